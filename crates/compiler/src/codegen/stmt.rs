//! Function and statement lowering.
//!
//! The body is generated into the in-memory block list first; the
//! prologue is built afterwards, once the frame size is final, and
//! prepended as its own block.

use std::rc::Rc;

use super::expr::{by_reference, HelperArg};
use super::runtime;
use super::state::{fits_mix, AsmItem, Block, FuncState, Opcode, Operand, Reg};
use super::CodeGen;
use crate::ast::{Function, Init, Stmt};
use crate::error::CompileError;
use crate::scope::Symbol;
use crate::types::Type;

impl CodeGen {
    pub(super) fn lower_function(&mut self, f: &Function) -> Result<(), CompileError> {
        self.reset_function(f);
        let sig = f
            .symbol
            .ty()
            .signature()
            .ok_or_else(|| CompileError::internal("function without a signature"))?;
        let wide_ret = by_reference(&sig.ret);

        let mut state = FuncState {
            named_stack_bytes: 0,
            ret_ptr_offset: None,
            func_name_label: None,
        };

        // Parameter placement. Register-size parameters arrive in r0-r3
        // (r1 is the hidden result pointer for wide returns) and are
        // spilled to frame slots so they are addressable; everything else
        // already lives at positive offsets on the caller's stack. A
        // variadic function takes every parameter on the stack so the
        // va_arg area is contiguous.
        let slots: &[Reg] = if wide_ret {
            &[Reg::R0, Reg::R2, Reg::R3]
        } else {
            &[Reg::R0, Reg::R1, Reg::R2, Reg::R3]
        };
        let mut reg_params: Vec<(Rc<Symbol>, Reg)> = Vec::new();
        let mut stack_offset: i32 = 8;
        for param in &f.params {
            let ty = param.ty();
            let size = ty.size().map_err(|e| e.at(&f.token))?;
            let rounded = size.div_ceil(4) * 4;
            if !sig.variadic && !by_reference(&ty) && reg_params.len() < slots.len() {
                let offset = self.alloc_local(size);
                param.set_frame_offset(offset);
                let slot = slots[reg_params.len()];
                reg_params.push((Rc::clone(param), slot));
            } else {
                param.set_frame_offset(stack_offset);
                stack_offset += rounded as i32;
            }
        }
        state.named_stack_bytes = (stack_offset - 8) as u32;

        if wide_ret {
            state.ret_ptr_offset = Some(self.alloc_local(4));
        }
        self.func = Some(state);

        for stmt in &f.body {
            self.lower_stmt(stmt)?;
        }

        // Fall-off-the-end return. main's implicit 0 comes for free.
        self.cur_token = Some(Rc::clone(&f.token));
        self.ins(Opcode::Zero, vec![Operand::Reg(Reg::R0)]);
        self.ins(Opcode::Leave, vec![]);
        self.ins(Opcode::Ret, vec![]);

        // Build the prologue now that the frame size is known.
        let body_blocks = std::mem::take(&mut self.blocks);
        self.blocks = vec![Block {
            label: None,
            ins: Vec::new(),
        }];
        self.ins(Opcode::Enter, vec![]);
        let frame = self.frame_size;
        if frame > 0 {
            if fits_mix(frame as i32) {
                self.ins(
                    Opcode::Sub,
                    vec![
                        Operand::Reg(Reg::RSP),
                        Operand::Reg(Reg::RSP),
                        Operand::Imm(frame as i32),
                    ],
                );
            } else {
                self.ins(
                    Opcode::Imw,
                    vec![Operand::Reg(Reg::RA), Operand::Imm32(frame as i32)],
                );
                self.ins(
                    Opcode::Sub,
                    vec![
                        Operand::Reg(Reg::RSP),
                        Operand::Reg(Reg::RSP),
                        Operand::Reg(Reg::RA),
                    ],
                );
            }
        }
        if let Some(offset) = self.func.as_ref().and_then(|s| s.ret_ptr_offset) {
            self.store_frame_word(Reg::R1, offset);
        }
        for (param, slot) in &reg_params {
            let offset = param
                .frame_offset()
                .expect("register parameter has a slot");
            self.store_frame_word(*slot, offset);
        }
        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.extend(body_blocks);

        self.functions.push(AsmItem::Function {
            name: f.symbol.asm_name().to_string(),
            blocks,
        });
        self.func = None;
        Ok(())
    }

    /// Store a word register to a frame slot.
    fn store_frame_word(&mut self, value: Reg, offset: i32) {
        if fits_mix(offset) {
            self.ins(
                Opcode::Stw,
                vec![
                    Operand::Reg(value),
                    Operand::Reg(Reg::RFP),
                    Operand::Imm(offset),
                ],
            );
        } else {
            self.lea_frame(Reg::RB, offset);
            self.ins(
                Opcode::Stw,
                vec![Operand::Reg(value), Operand::Reg(Reg::RB), Operand::Imm(0)],
            );
        }
    }

    /// Load a word from a frame slot.
    fn load_frame_word(&mut self, dst: Reg, offset: i32) {
        if fits_mix(offset) {
            self.ins(
                Opcode::Ldw,
                vec![
                    Operand::Reg(dst),
                    Operand::Reg(Reg::RFP),
                    Operand::Imm(offset),
                ],
            );
        } else {
            self.lea_frame(Reg::RB, offset);
            self.ins(
                Opcode::Ldw,
                vec![Operand::Reg(dst), Operand::Reg(Reg::RB), Operand::Imm(0)],
            );
        }
    }

    pub(super) fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(e) => {
                self.expr(e, 0)?;
            }
            Stmt::Decl {
                symbol,
                init,
                token,
            } => {
                self.cur_token = Some(Rc::clone(token));
                let ty = symbol.ty();
                let size = ty.size().map_err(|e| e.at(token))?;
                let offset = self.alloc_local(size);
                symbol.set_frame_offset(offset);
                if let Some(init) = init {
                    self.lower_local_init(&ty, init, offset)?;
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond, 0)?;
                let end = self.new_label();
                match else_body {
                    Some(else_body) => {
                        let else_label = self.new_label();
                        self.jump_if_zero(Reg::R0, &else_label);
                        self.lower_stmt(then_body)?;
                        self.jump(&end);
                        self.define_label(else_label);
                        self.lower_stmt(else_body)?;
                    }
                    None => {
                        self.jump_if_zero(Reg::R0, &end);
                        self.lower_stmt(then_body)?;
                    }
                }
                self.define_label(end);
            }
            Stmt::While { cond, body } => {
                let cond_label = self.new_label();
                let end = self.new_label();
                self.define_label(cond_label.clone());
                self.expr(cond, 0)?;
                self.jump_if_zero(Reg::R0, &end);
                self.break_labels.push(end.clone());
                self.continue_labels.push(cond_label.clone());
                self.lower_stmt(body)?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.jump(&cond_label);
                self.define_label(end);
            }
            Stmt::DoWhile { body, cond } => {
                let top = self.new_label();
                let cond_label = self.new_label();
                let end = self.new_label();
                self.define_label(top.clone());
                self.break_labels.push(end.clone());
                self.continue_labels.push(cond_label.clone());
                self.lower_stmt(body)?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.define_label(cond_label);
                self.expr(cond, 0)?;
                self.jump_if_nonzero(Reg::R0, &top);
                self.define_label(end);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.lower_stmt(init)?;
                }
                let cond_label = self.new_label();
                let step_label = self.new_label();
                let end = self.new_label();
                self.define_label(cond_label.clone());
                if let Some(cond) = cond {
                    self.expr(cond, 0)?;
                    self.jump_if_zero(Reg::R0, &end);
                }
                self.break_labels.push(end.clone());
                self.continue_labels.push(step_label.clone());
                self.lower_stmt(body)?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.define_label(step_label);
                if let Some(step) = step {
                    self.expr(step, 0)?;
                }
                self.jump(&cond_label);
                self.define_label(end);
            }
            Stmt::Switch {
                cond,
                cases,
                default,
                body,
            } => {
                self.expr(cond, 0)?;
                // A chain of compare-and-branch, then the default or the
                // end.
                for (value, label_id) in cases {
                    let value = *value as i32;
                    if fits_mix(value) {
                        self.ins(
                            Opcode::Cmps,
                            vec![
                                Operand::Reg(Reg::RA),
                                Operand::Reg(Reg::R0),
                                Operand::Imm(value),
                            ],
                        );
                    } else {
                        self.ins(
                            Opcode::Imw,
                            vec![Operand::Reg(Reg::RB), Operand::Imm32(value)],
                        );
                        self.ins(
                            Opcode::Cmps,
                            vec![
                                Operand::Reg(Reg::RA),
                                Operand::Reg(Reg::R0),
                                Operand::Reg(Reg::RB),
                            ],
                        );
                    }
                    self.jump_if_zero(Reg::RA, &CodeGen::parser_label(*label_id));
                }
                let end = self.new_label();
                match default {
                    Some(label_id) => self.jump(&CodeGen::parser_label(*label_id)),
                    None => self.jump(&end),
                }
                self.break_labels.push(end.clone());
                self.lower_stmt(body)?;
                self.break_labels.pop();
                self.define_label(end);
            }
            Stmt::Case { label, body } => {
                self.define_label(CodeGen::parser_label(*label));
                self.lower_stmt(body)?;
            }
            Stmt::Default { label, body } => {
                self.define_label(CodeGen::parser_label(*label));
                self.lower_stmt(body)?;
            }
            Stmt::Break { token } => {
                let label = self
                    .break_labels
                    .last()
                    .cloned()
                    .ok_or_else(|| {
                        CompileError::semantic("break outside a loop or switch", token)
                    })?;
                self.jump(&label);
            }
            Stmt::Continue { token } => {
                let label = self
                    .continue_labels
                    .last()
                    .cloned()
                    .ok_or_else(|| CompileError::semantic("continue outside a loop", token))?;
                self.jump(&label);
            }
            Stmt::Goto { name, token } => {
                self.cur_token = Some(Rc::clone(token));
                self.jump(&format!("goto_{}", name));
            }
            Stmt::Labeled { name, body } => {
                self.define_label(format!("goto_{}", name));
                self.lower_stmt(body)?;
            }
            Stmt::Return { value, token } => {
                self.cur_token = Some(Rc::clone(token));
                self.lower_return(value.as_ref())?;
            }
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.lower_stmt(stmt)?;
                }
            }
            Stmt::Empty => {}
        }
        self.release_temps();
        Ok(())
    }

    fn lower_return(
        &mut self,
        value: Option<&crate::ast::Expr>,
    ) -> Result<(), CompileError> {
        if let Some(value) = value {
            let ret_ptr = self.func.as_ref().and_then(|f| f.ret_ptr_offset);
            self.expr(value, 0)?;
            if let Some(offset) = ret_ptr {
                // Copy the value into the caller's result slot and return
                // the slot's address.
                let size = value.ty.size().map_err(|e| e.at(&value.token))?;
                self.load_frame_word(Reg::RA, offset);
                if size <= 32 {
                    let mut k = 0;
                    while k < size {
                        self.ins(
                            Opcode::Ldw,
                            vec![
                                Operand::Reg(Reg::RB),
                                Operand::Reg(Reg::R0),
                                Operand::Imm(k as i32),
                            ],
                        );
                        self.ins(
                            Opcode::Stw,
                            vec![
                                Operand::Reg(Reg::RB),
                                Operand::Reg(Reg::RA),
                                Operand::Imm(k as i32),
                            ],
                        );
                        k += 4;
                    }
                    self.mov_reg(Reg::R0, Reg::RA);
                } else {
                    self.call_helper(
                        runtime::MEMCPY,
                        &[
                            HelperArg::Reg(Reg::RA),
                            HelperArg::Reg(Reg::R0),
                            HelperArg::Imm(size as i32),
                        ],
                        0,
                        0,
                    );
                }
            }
        }
        self.ins(Opcode::Leave, vec![]);
        self.ins(Opcode::Ret, vec![]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local initialisers
    // ------------------------------------------------------------------

    fn lower_local_init(
        &mut self,
        ty: &Rc<Type>,
        init: &Init,
        offset: i32,
    ) -> Result<(), CompileError> {
        match init {
            Init::Scalar(expr) => self.lower_init_scalar(ty, expr, offset),
            Init::List(items) => {
                // Zero the whole object first; list initialisation
                // zero-fills whatever the list does not mention.
                let size = ty.size()?;
                self.zero_fill_frame(offset, size);
                self.lower_init_list(ty, items, offset)
            }
        }
    }

    fn lower_init_list(
        &mut self,
        ty: &Rc<Type>,
        items: &[Init],
        offset: i32,
    ) -> Result<(), CompileError> {
        if let Some(element) = ty.element() {
            let element_size = element.size()?;
            for (i, item) in items.iter().enumerate() {
                let at = offset + (i as u32 * element_size) as i32;
                match item {
                    Init::Scalar(expr) => self.lower_init_scalar(&element, expr, at)?,
                    Init::List(nested) => self.lower_init_list(&element, nested, at)?,
                }
            }
            return Ok(());
        }
        if let Some(record) = ty.as_record() {
            let members: Vec<_> = record
                .members()
                .into_iter()
                .filter(|(_, member_ty, _)| !member_ty.is_flexible_array())
                .collect();
            for (item, (_, member_ty, member_offset)) in items.iter().zip(&members) {
                let at = offset + *member_offset as i32;
                match item {
                    Init::Scalar(expr) => self.lower_init_scalar(member_ty, expr, at)?,
                    Init::List(nested) => self.lower_init_list(member_ty, nested, at)?,
                }
            }
            return Ok(());
        }
        // Braced scalar.
        if let Some(item) = items.first() {
            match item {
                Init::Scalar(expr) => self.lower_init_scalar(ty, expr, offset)?,
                Init::List(nested) => self.lower_init_list(ty, nested, offset)?,
            }
        }
        Ok(())
    }

    fn lower_init_scalar(
        &mut self,
        ty: &Rc<Type>,
        expr: &crate::ast::Expr,
        offset: i32,
    ) -> Result<(), CompileError> {
        // A char array initialised from a string literal copies the bytes
        // and zero-fills the remainder.
        if ty.is_array() {
            let size = ty.size()?;
            let literal_len = match &expr.kind {
                crate::ast::ExprKind::Str(bytes) => bytes.len() as u32,
                _ => {
                    return Err(CompileError::internal(
                        "array initialiser is not a string literal",
                    )
                    .at(&expr.token));
                }
            };
            let copy = size.min(literal_len + 1);
            if size > copy {
                self.zero_fill_frame(offset, size);
            }
            self.expr(expr, 0)?;
            self.lea_frame(Reg::gp(1), offset);
            self.copy_object(1, 0, copy, 0);
            return Ok(());
        }

        self.expr(expr, 0)?;
        self.lea_frame(Reg::gp(1), offset);
        if by_reference(ty) {
            let size = ty.size()?;
            self.copy_object(1, 0, size, 0);
        } else {
            self.store_value(Reg::R0, Reg::gp(1), ty)?;
        }
        Ok(())
    }

    /// Zero `size` bytes of frame storage at `offset`.
    fn zero_fill_frame(&mut self, offset: i32, size: u32) {
        if size <= 32 {
            self.lea_frame(Reg::RB, offset);
            self.ins(Opcode::Zero, vec![Operand::Reg(Reg::RA)]);
            let mut k = 0;
            while k < size {
                let step = size - k;
                let (op, width) = if step >= 4 {
                    (Opcode::Stw, 4)
                } else if step >= 2 {
                    (Opcode::Sts, 2)
                } else {
                    (Opcode::Stb, 1)
                };
                self.ins(
                    op,
                    vec![
                        Operand::Reg(Reg::RA),
                        Operand::Reg(Reg::RB),
                        Operand::Imm(k as i32),
                    ],
                );
                k += width;
            }
        } else {
            self.lea_frame(Reg::R0, offset);
            self.call_helper(
                runtime::MEMSET,
                &[
                    HelperArg::Reg(Reg::R0),
                    HelperArg::Imm(0),
                    HelperArg::Imm(size as i32),
                ],
                0,
                0,
            );
        }
    }
}
