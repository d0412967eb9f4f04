//! Code generator state and the virtual-machine data model.
//!
//! Instructions are built into an in-memory block list per function and
//! serialised afterwards, so the prologue can subtract the final frame
//! size even though it is only known once the body is generated.

use std::rc::Rc;

use crate::ast::Function;
use crate::error::CompileError;
use crate::lexer::Token;
use crate::strings::Interner;
use crate::types::Type;

/// Machine registers. r0-r9 hold expression temporaries and arguments;
/// ra and rb are reserved as code-generator scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    RA,
    RB,
    RSP,
    RFP,
    RPP,
    RIP,
}

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Reg::R0 => "r0",
            Reg::R1 => "r1",
            Reg::R2 => "r2",
            Reg::R3 => "r3",
            Reg::R4 => "r4",
            Reg::R5 => "r5",
            Reg::R6 => "r6",
            Reg::R7 => "r7",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::RA => "ra",
            Reg::RB => "rb",
            Reg::RSP => "rsp",
            Reg::RFP => "rfp",
            Reg::RPP => "rpp",
            Reg::RIP => "rip",
        }
    }

    /// General-purpose register by index (0..=9).
    pub fn gp(index: u32) -> Reg {
        match index {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::R8,
            9 => Reg::R9,
            _ => unreachable!("register index out of range"),
        }
    }
}

/// The instruction set of the target machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Divs,
    Divu,
    Mods,
    Modu,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shrs,
    Shru,
    Cmps,
    Cmpu,
    Isz,
    Bool,
    Mov,
    Ldw,
    Ldh,
    Ldb,
    Stw,
    Sts,
    Stb,
    Sxb,
    Sxs,
    Push,
    Pop,
    Jmp,
    Jz,
    Jnz,
    Call,
    Ret,
    Enter,
    Leave,
    Imw,
    Ims,
    Zero,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Divs => "divs",
            Opcode::Divu => "divu",
            Opcode::Mods => "mods",
            Opcode::Modu => "modu",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Not => "not",
            Opcode::Shl => "shl",
            Opcode::Shrs => "shrs",
            Opcode::Shru => "shru",
            Opcode::Cmps => "cmps",
            Opcode::Cmpu => "cmpu",
            Opcode::Isz => "isz",
            Opcode::Bool => "bool",
            Opcode::Mov => "mov",
            Opcode::Ldw => "ldw",
            Opcode::Ldh => "ldh",
            Opcode::Ldb => "ldb",
            Opcode::Stw => "stw",
            Opcode::Sts => "sts",
            Opcode::Stb => "stb",
            Opcode::Sxb => "sxb",
            Opcode::Sxs => "sxs",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Jmp => "jmp",
            Opcode::Jz => "jz",
            Opcode::Jnz => "jnz",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Enter => "enter",
            Opcode::Leave => "leave",
            Opcode::Imw => "imw",
            Opcode::Ims => "ims",
            Opcode::Zero => "zero",
        }
    }
}

/// Mix-type operands fit in one instruction byte.
pub fn fits_mix(value: i32) -> bool {
    (-127..=127).contains(&value)
}

#[derive(Debug, Clone)]
pub enum Operand {
    Reg(Reg),
    /// Small immediate, must satisfy [`fits_mix`].
    Imm(i32),
    /// Full-width immediate (imw payload).
    Imm32(i32),
    /// Symbol or label reference with its sigil (`^` address, `&` label).
    Sym { sigil: char, name: String },
}

pub struct Ins {
    pub op: Opcode,
    /// Source attribution for `#line` debug output.
    pub token: Option<Rc<Token>>,
    pub operands: Vec<Operand>,
}

/// A run of instructions with an optional leading label.
pub struct Block {
    pub label: Option<String>,
    pub ins: Vec<Ins>,
}

/// Global data is a sequence of emission terms.
pub enum DataTerm {
    Word(u32),
    Bytes(Vec<u8>),
    /// Address of a symbol, as a word.
    Addr(String),
    Zeroes(u32),
}

pub enum AsmItem {
    Variable {
        name: String,
        data: Vec<DataTerm>,
    },
    Function {
        name: String,
        blocks: Vec<Block>,
    },
    /// Deferred string-literal (and `__func__`) constants.
    StringConstant {
        name: String,
        bytes: Vec<u8>,
    },
}

/// One lowered translation unit, in emission order.
pub struct AsmProgram {
    pub items: Vec<AsmItem>,
}

/// Per-function lowering state.
pub(super) struct FuncState {
    /// Total bytes of named parameters in the variadic stack area.
    pub named_stack_bytes: u32,
    /// Slot holding the hidden result pointer, for wide return types.
    pub ret_ptr_offset: Option<i32>,
    /// One `__S_` label per function for `__func__`, minted on first use.
    pub func_name_label: Option<String>,
}

pub struct CodeGen {
    pub(super) interner: Interner,
    // Unit-level output: globals, then functions, then deferred strings.
    pub(super) globals: Vec<AsmItem>,
    pub(super) functions: Vec<AsmItem>,
    pub(super) strings: Vec<AsmItem>,
    pub(super) next_string: u32,
    pub(super) next_static: u32,
    // Per-function state.
    pub(super) blocks: Vec<Block>,
    pub(super) next_label: u32,
    pub(super) frame_size: u32,
    pub(super) frame_cursor: u32,
    /// Locals persist; temporaries above the floor are released at each
    /// statement boundary.
    pub(super) frame_floor: u32,
    pub(super) func: Option<FuncState>,
    pub(super) break_labels: Vec<String>,
    pub(super) continue_labels: Vec<String>,
    pub(super) cur_token: Option<Rc<Token>>,
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen {
            interner: Interner::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            strings: Vec::new(),
            next_string: 0,
            next_static: 0,
            blocks: Vec::new(),
            next_label: 0,
            frame_size: 0,
            frame_cursor: 0,
            frame_floor: 0,
            func: None,
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            cur_token: None,
        }
    }

    pub(super) fn reset_function(&mut self, f: &Function) {
        self.blocks = vec![Block {
            label: None,
            ins: Vec::new(),
        }];
        self.next_label = f.label_count;
        self.frame_size = 0;
        self.frame_cursor = 0;
        self.frame_floor = 0;
        self.break_labels.clear();
        self.continue_labels.clear();
        self.cur_token = Some(Rc::clone(&f.token));
    }

    // ------------------------------------------------------------------
    // Instruction building
    // ------------------------------------------------------------------

    pub(super) fn ins(&mut self, op: Opcode, operands: Vec<Operand>) {
        let block = self
            .blocks
            .last_mut()
            .expect("instruction emitted outside a function");
        block.ins.push(Ins {
            op,
            token: self.cur_token.clone(),
            operands,
        });
    }

    /// Mint a fresh intra-function label.
    pub(super) fn new_label(&mut self) -> String {
        let label = format!("L{}", self.next_label);
        self.next_label += 1;
        label
    }

    /// The label for a parser-assigned case/default id.
    pub(super) fn parser_label(id: u32) -> String {
        format!("L{}", id)
    }

    /// Start a new block at `label`.
    pub(super) fn define_label(&mut self, label: String) {
        self.blocks.push(Block {
            label: Some(label),
            ins: Vec::new(),
        });
    }

    // ------------------------------------------------------------------
    // Frame allocation
    // ------------------------------------------------------------------

    /// Allocate frame space, word-granular. Returns a negative offset
    /// from the frame pointer.
    fn alloc_frame(&mut self, size: u32) -> i32 {
        let rounded = size.div_ceil(4) * 4;
        self.frame_cursor += rounded;
        self.frame_size = self.frame_size.max(self.frame_cursor);
        -(self.frame_cursor as i32)
    }

    /// A local variable or parameter slot; survives to function end.
    pub(super) fn alloc_local(&mut self, size: u32) -> i32 {
        let offset = self.alloc_frame(size);
        self.frame_floor = self.frame_cursor;
        offset
    }

    /// Scratch storage for the current statement.
    pub(super) fn alloc_temp(&mut self, size: u32) -> i32 {
        self.alloc_frame(size)
    }

    /// Release statement temporaries.
    pub(super) fn release_temps(&mut self) {
        self.frame_cursor = self.frame_floor;
    }

    // ------------------------------------------------------------------
    // Common sequences
    // ------------------------------------------------------------------

    pub(super) fn mov_reg(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.ins(Opcode::Mov, vec![Operand::Reg(dst), Operand::Reg(src)]);
        }
    }

    /// Load a constant into a register.
    pub(super) fn load_imm(&mut self, dst: Reg, value: i32) {
        if value == 0 {
            self.ins(Opcode::Zero, vec![Operand::Reg(dst)]);
        } else if fits_mix(value) {
            self.ins(Opcode::Mov, vec![Operand::Reg(dst), Operand::Imm(value)]);
        } else {
            self.ins(Opcode::Imw, vec![Operand::Reg(dst), Operand::Imm32(value)]);
        }
    }

    /// dst = src + value, routing large constants through a scratch
    /// register.
    pub(super) fn add_imm(&mut self, dst: Reg, src: Reg, value: i32) {
        if fits_mix(value) {
            self.ins(
                Opcode::Add,
                vec![Operand::Reg(dst), Operand::Reg(src), Operand::Imm(value)],
            );
        } else {
            let scratch = if src == Reg::RA { Reg::RB } else { Reg::RA };
            self.ins(
                Opcode::Imw,
                vec![Operand::Reg(scratch), Operand::Imm32(value)],
            );
            self.ins(
                Opcode::Add,
                vec![Operand::Reg(dst), Operand::Reg(src), Operand::Reg(scratch)],
            );
        }
    }

    /// dst = rfp + offset (the address of a frame slot).
    pub(super) fn lea_frame(&mut self, dst: Reg, offset: i32) {
        self.add_imm(dst, Reg::RFP, offset);
    }

    /// dst = rpp + offset-of(symbol): the address of a global.
    pub(super) fn load_sym_addr(&mut self, dst: Reg, name: &str) {
        self.ins(
            Opcode::Imw,
            vec![
                Operand::Reg(dst),
                Operand::Sym {
                    sigil: '^',
                    name: name.to_string(),
                },
            ],
        );
        self.ins(
            Opcode::Add,
            vec![Operand::Reg(dst), Operand::Reg(Reg::RPP), Operand::Reg(dst)],
        );
    }

    pub(super) fn jump(&mut self, label: &str) {
        self.ins(
            Opcode::Jmp,
            vec![Operand::Sym {
                sigil: '&',
                name: label.to_string(),
            }],
        );
    }

    pub(super) fn jump_if_zero(&mut self, reg: Reg, label: &str) {
        self.ins(
            Opcode::Jz,
            vec![
                Operand::Reg(reg),
                Operand::Sym {
                    sigil: '&',
                    name: label.to_string(),
                },
            ],
        );
    }

    pub(super) fn jump_if_nonzero(&mut self, reg: Reg, label: &str) {
        self.ins(
            Opcode::Jnz,
            vec![
                Operand::Reg(reg),
                Operand::Sym {
                    sigil: '&',
                    name: label.to_string(),
                },
            ],
        );
    }

    pub(super) fn push_reg(&mut self, reg: Reg) {
        self.ins(Opcode::Push, vec![Operand::Reg(reg)]);
    }

    pub(super) fn pop_reg(&mut self, reg: Reg) {
        self.ins(Opcode::Pop, vec![Operand::Reg(reg)]);
    }

    /// Load a value of `ty` from the address in `addr` into `dst`.
    /// Byte and halfword loads do not sign-extend; the extension is
    /// explicit where the type is signed.
    pub(super) fn load_value(
        &mut self,
        dst: Reg,
        addr: Reg,
        ty: &Rc<Type>,
    ) -> Result<(), CompileError> {
        match ty.size()? {
            1 => {
                self.ins(
                    Opcode::Ldb,
                    vec![Operand::Reg(dst), Operand::Reg(addr), Operand::Imm(0)],
                );
                if ty.is_signed() {
                    self.ins(Opcode::Sxb, vec![Operand::Reg(dst), Operand::Reg(dst)]);
                }
            }
            2 => {
                self.ins(
                    Opcode::Ldh,
                    vec![Operand::Reg(dst), Operand::Reg(addr), Operand::Imm(0)],
                );
                if ty.is_signed() {
                    self.ins(Opcode::Sxs, vec![Operand::Reg(dst), Operand::Reg(dst)]);
                }
            }
            4 => {
                self.ins(
                    Opcode::Ldw,
                    vec![Operand::Reg(dst), Operand::Reg(addr), Operand::Imm(0)],
                );
            }
            other => {
                return Err(CompileError::internal(format!(
                    "register load of a {}-byte value",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Store the value in `value` to the address in `addr`, sized by `ty`.
    pub(super) fn store_value(
        &mut self,
        value: Reg,
        addr: Reg,
        ty: &Rc<Type>,
    ) -> Result<(), CompileError> {
        let op = match ty.size()? {
            1 => Opcode::Stb,
            2 => Opcode::Sts,
            4 => Opcode::Stw,
            other => {
                return Err(CompileError::internal(format!(
                    "register store of a {}-byte value",
                    other
                )));
            }
        };
        self.ins(
            op,
            vec![Operand::Reg(value), Operand::Reg(addr), Operand::Imm(0)],
        );
        Ok(())
    }

    /// Intern a deferred string constant; returns its label.
    pub(super) fn add_string_constant(&mut self, mut bytes: Vec<u8>) -> String {
        bytes.push(0);
        let name = format!("__S_{:x}", self.next_string);
        self.next_string += 1;
        self.strings.push(AsmItem::StringConstant {
            name: name.clone(),
            bytes,
        });
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_range() {
        assert!(fits_mix(0));
        assert!(fits_mix(127));
        assert!(fits_mix(-127));
        assert!(!fits_mix(128));
        assert!(!fits_mix(-128));
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Reg::R0.name(), "r0");
        assert_eq!(Reg::gp(9).name(), "r9");
        assert_eq!(Reg::RSP.name(), "rsp");
        assert_eq!(Reg::RPP.name(), "rpp");
    }

    #[test]
    fn test_frame_allocation_word_granular() {
        let mut cg = CodeGen::new();
        cg.blocks.push(Block {
            label: None,
            ins: Vec::new(),
        });
        assert_eq!(cg.alloc_local(4), -4);
        assert_eq!(cg.alloc_local(1), -8);
        assert_eq!(cg.alloc_local(8), -16);
        assert_eq!(cg.frame_size, 16);
    }

    #[test]
    fn test_temps_release_to_floor() {
        let mut cg = CodeGen::new();
        assert_eq!(cg.alloc_local(4), -4);
        assert_eq!(cg.alloc_temp(8), -12);
        cg.release_temps();
        // The next local reuses the released temp space.
        assert_eq!(cg.alloc_local(4), -8);
    }

    #[test]
    fn test_string_labels_are_sequential() {
        let mut cg = CodeGen::new();
        assert_eq!(cg.add_string_constant(b"a".to_vec()), "__S_0");
        assert_eq!(cg.add_string_constant(b"a".to_vec()), "__S_1");
    }
}
