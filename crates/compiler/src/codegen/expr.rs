//! Expression lowering.
//!
//! Every expression leaves its value in a caller-chosen register, with
//! registers below it live and registers above it free. Word-size scalars
//! travel by value; long long, double, and record values travel as a
//! pointer to storage. ra and rb are scratch and never live across a
//! sub-expression.

use std::rc::Rc;

use super::runtime;
use super::state::{Opcode, Operand, Reg};
use super::CodeGen;
use crate::ast::{BinaryOp, Expr, ExprKind, IncDec, Stmt, UnaryOp};
use crate::error::CompileError;
use crate::scope::Symbol;
use crate::types::Type;

/// Values of these types are represented by a pointer to their storage.
pub(super) fn by_reference(ty: &Rc<Type>) -> bool {
    if ty.is_record() {
        return true;
    }
    if ty.is_long_long() {
        return true;
    }
    ty.is_floating() && ty.size().map(|s| s == 8).unwrap_or(false)
}

pub(super) enum HelperArg {
    Reg(Reg),
    Imm(i32),
}

impl CodeGen {
    fn gp_checked(&self, index: u32, token: &Rc<crate::lexer::Token>) -> Result<Reg, CompileError> {
        if index > 9 {
            return Err(CompileError::unsupported(
                "expression is too deeply nested",
                token,
            ));
        }
        Ok(Reg::gp(index))
    }

    /// Lower `e`, leaving its value in general register `dst`.
    pub(super) fn expr(&mut self, e: &Expr, dst: u32) -> Result<(), CompileError> {
        self.cur_token = Some(Rc::clone(&e.token));
        let d = self.gp_checked(dst, &e.token)?;

        match &e.kind {
            ExprKind::Int(value) => {
                if by_reference(&e.ty) {
                    self.wide_constant(d, *value as u64)?;
                } else {
                    self.load_imm(d, *value as i32);
                }
            }
            ExprKind::Float(value) => {
                if by_reference(&e.ty) {
                    self.wide_constant(d, value.to_bits())?;
                } else {
                    let bits = (*value as f32).to_bits() as i32;
                    self.ins(Opcode::Imw, vec![Operand::Reg(d), Operand::Imm32(bits)]);
                }
            }
            ExprKind::Str(bytes) => {
                let label = self.add_string_constant(bytes.clone());
                self.load_sym_addr(d, &label);
            }
            ExprKind::FuncName(name) => {
                let label = self.func_name_constant(name.as_str());
                self.load_sym_addr(d, &label);
            }
            ExprKind::Sym(_) | ExprKind::Member { .. } => {
                self.load_lvalue(e, dst)?;
            }
            ExprKind::Unary { op, operand } => {
                self.lower_unary(e, *op, operand, dst)?;
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.lower_binary(e, *op, lhs, rhs, dst)?;
            }
            ExprKind::Logical { and, lhs, rhs } => {
                self.expr(lhs, dst)?;
                let end = self.new_label();
                if *and {
                    self.jump_if_zero(d, &end);
                } else {
                    self.jump_if_nonzero(d, &end);
                }
                self.expr(rhs, dst)?;
                self.define_label(end);
            }
            ExprKind::Assign { op, target, value } => {
                self.lower_assign(op.as_ref().copied(), target, value, dst)?;
            }
            ExprKind::PostIncDec { op, target } => {
                self.lower_post_inc_dec(*op, target, dst)?;
            }
            ExprKind::Call { callee, args } => {
                self.lower_call(e, callee, args, dst)?;
            }
            ExprKind::Cast(operand) => {
                self.expr(operand, dst)?;
                self.convert(dst, &operand.ty, &e.ty, &e.token)?;
            }
            ExprKind::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                self.expr(cond, dst)?;
                let else_label = self.new_label();
                let end = self.new_label();
                self.jump_if_zero(d, &else_label);
                self.expr(then_expr, dst)?;
                self.jump(&end);
                self.define_label(else_label);
                self.expr(else_expr, dst)?;
                self.define_label(end);
            }
            ExprKind::Comma { lhs, rhs } => {
                self.expr(lhs, dst)?;
                self.expr(rhs, dst)?;
            }
            ExprKind::StmtExpr(stmts) => {
                self.lower_statement_expression(e, stmts, dst)?;
            }
            ExprKind::VaStart { ap } => {
                self.lower_va_start(ap, dst)?;
            }
            ExprKind::VaArg { ap } => {
                self.lower_va_arg(e, ap, dst)?;
            }
            ExprKind::VaEnd { ap } => {
                self.gen_addr(ap, dst)?;
                self.ins(Opcode::Zero, vec![Operand::Reg(Reg::RA)]);
                self.ins(
                    Opcode::Stw,
                    vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
                );
            }
            ExprKind::VaCopy { dst: dest, src } => {
                self.gen_addr(dest, dst)?;
                let s = self.gp_checked(dst + 1, &e.token)?;
                self.expr(src, dst + 1)?;
                self.ins(
                    Opcode::Stw,
                    vec![Operand::Reg(s), Operand::Reg(d), Operand::Imm(0)],
                );
            }
        }
        Ok(())
    }

    /// Lower the address of an lvalue into `dst`.
    pub(super) fn gen_addr(&mut self, e: &Expr, dst: u32) -> Result<(), CompileError> {
        let d = self.gp_checked(dst, &e.token)?;
        match &e.kind {
            ExprKind::Sym(symbol) => {
                self.symbol_addr(symbol, d);
                Ok(())
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self.expr(operand, dst),
            ExprKind::Member { base, offset, .. } => {
                if base.is_lvalue() {
                    self.gen_addr(base, dst)?;
                } else {
                    // A record-valued expression's value is its address.
                    self.expr(base, dst)?;
                }
                if *offset != 0 {
                    self.add_imm(d, d, *offset as i32);
                }
                Ok(())
            }
            ExprKind::Str(bytes) => {
                let label = self.add_string_constant(bytes.clone());
                self.load_sym_addr(d, &label);
                Ok(())
            }
            ExprKind::FuncName(name) => {
                let label = self.func_name_constant(name.as_str());
                self.load_sym_addr(d, &label);
                Ok(())
            }
            _ => Err(CompileError::internal("address of a non-lvalue").at(&e.token)),
        }
    }

    fn symbol_addr(&mut self, symbol: &Rc<Symbol>, d: Reg) {
        match symbol.frame_offset() {
            Some(offset) => self.lea_frame(d, offset),
            None => {
                let name = symbol.asm_name();
                self.load_sym_addr(d, name.as_str());
            }
        }
    }

    /// Load the value of an lvalue expression: word scalars load from
    /// memory, reference-typed values stay as their address.
    fn load_lvalue(&mut self, e: &Expr, dst: u32) -> Result<(), CompileError> {
        let d = self.gp_checked(dst, &e.token)?;
        if let ExprKind::Sym(symbol) = &e.kind
            && symbol.ty().is_function()
        {
            let name = symbol.asm_name();
            self.load_sym_addr(d, name.as_str());
            return Ok(());
        }
        self.gen_addr(e, dst)?;
        if by_reference(&e.ty) || e.ty.is_array() {
            return Ok(());
        }
        self.load_value(d, d, &e.ty).map_err(|err| err.at(&e.token))
    }

    /// An 8-byte constant (long long or double bits) in a fresh temp slot.
    fn wide_constant(&mut self, d: Reg, bits: u64) -> Result<(), CompileError> {
        let offset = self.alloc_temp(8);
        self.lea_frame(d, offset);
        let low = bits as u32 as i32;
        let high = (bits >> 32) as u32 as i32;
        self.ins(Opcode::Imw, vec![Operand::Reg(Reg::RA), Operand::Imm32(low)]);
        self.ins(
            Opcode::Stw,
            vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
        );
        self.ins(
            Opcode::Imw,
            vec![Operand::Reg(Reg::RA), Operand::Imm32(high)],
        );
        self.ins(
            Opcode::Stw,
            vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(4)],
        );
        Ok(())
    }

    fn func_name_constant(&mut self, name: &str) -> String {
        if let Some(label) = self
            .func
            .as_ref()
            .and_then(|f| f.func_name_label.clone())
        {
            return label;
        }
        let label = self.add_string_constant(name.as_bytes().to_vec());
        if let Some(f) = self.func.as_mut() {
            f.func_name_label = Some(label.clone());
        }
        label
    }

    // ------------------------------------------------------------------
    // Unary operators
    // ------------------------------------------------------------------

    fn lower_unary(
        &mut self,
        e: &Expr,
        op: UnaryOp,
        operand: &Expr,
        dst: u32,
    ) -> Result<(), CompileError> {
        let d = Reg::gp(dst);
        match op {
            UnaryOp::Deref => {
                self.expr(operand, dst)?;
                if by_reference(&e.ty) || e.ty.is_array() || e.ty.is_function() {
                    return Ok(());
                }
                self.load_value(d, d, &e.ty).map_err(|err| err.at(&e.token))
            }
            UnaryOp::AddressOf => self.gen_addr(operand, dst),
            UnaryOp::LogicalNot => {
                self.expr(operand, dst)?;
                self.ins(Opcode::Isz, vec![Operand::Reg(d), Operand::Reg(d)]);
                Ok(())
            }
            UnaryOp::Complement => {
                if by_reference(&e.ty) {
                    // ~x on long long: x ^ ~0.
                    self.expr(operand, dst)?;
                    self.copy_to_temp(dst, 8);
                    let ones = self.gp_checked(dst + 1, &e.token)?;
                    self.wide_constant(ones, u64::MAX)?;
                    let helper = runtime::binary_helper(BinaryOp::BitXor, &e.ty)?;
                    self.call_helper(
                        &helper,
                        &[HelperArg::Reg(d), HelperArg::Reg(ones)],
                        dst,
                        dst,
                    );
                    return Ok(());
                }
                self.expr(operand, dst)?;
                self.ins(Opcode::Not, vec![Operand::Reg(d), Operand::Reg(d)]);
                Ok(())
            }
            UnaryOp::Neg => {
                if by_reference(&e.ty) || e.ty.is_floating() {
                    // -x lowers as 0 - x through the helper. All-zero bits
                    // are 0 for long long and 0.0 for both float widths.
                    self.gp_checked(dst + 1, &e.token)?;
                    if by_reference(&e.ty) {
                        self.wide_constant(d, 0)?;
                    } else {
                        self.load_imm(d, 0);
                    }
                    self.expr(operand, dst + 1)?;
                    self.apply_helper_op(BinaryOp::Sub, &e.ty, dst, dst + 1, false)?;
                    return Ok(());
                }
                self.expr(operand, dst)?;
                self.ins(Opcode::Zero, vec![Operand::Reg(Reg::RA)]);
                self.ins(
                    Opcode::Sub,
                    vec![Operand::Reg(d), Operand::Reg(Reg::RA), Operand::Reg(d)],
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Binary operators
    // ------------------------------------------------------------------

    fn lower_binary(
        &mut self,
        e: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u32,
    ) -> Result<(), CompileError> {
        // Pointer arithmetic scales by the pointee size.
        if matches!(op, BinaryOp::Add | BinaryOp::Sub)
            && (lhs.ty.is_pointer() || rhs.ty.is_pointer())
        {
            return self.lower_pointer_arith(e, op, lhs, rhs, dst);
        }

        let operand_ty = Rc::clone(&lhs.ty);
        let compare = matches!(
            op,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        );

        if by_reference(&operand_ty) || operand_ty.is_floating() {
            self.gp_checked(dst + 1, &e.token)?;
            self.expr(lhs, dst)?;
            self.expr(rhs, dst + 1)?;
            self.apply_helper_op(op, &operand_ty, dst, dst + 1, compare)?;
            return Ok(());
        }

        // 32-bit integer path.
        let (a, b) = self.binary_operands(lhs, rhs, dst)?;
        let d = Reg::gp(dst.min(9));
        self.apply_int_op(op, &operand_ty, d, a, b);
        Ok(())
    }

    /// Evaluate both operands, spilling to the stack when the register
    /// file runs out.
    fn binary_operands(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        dst: u32,
    ) -> Result<(Reg, Reg), CompileError> {
        self.expr(lhs, dst)?;
        if dst < 9 {
            self.expr(rhs, dst + 1)?;
            Ok((Reg::gp(dst), Reg::gp(dst + 1)))
        } else {
            self.push_reg(Reg::gp(9));
            self.expr(rhs, 9)?;
            self.pop_reg(Reg::RA);
            Ok((Reg::RA, Reg::gp(9)))
        }
    }

    /// d = a OP b for 32-bit operands; comparisons leave 0 or 1 in d.
    fn apply_int_op(&mut self, op: BinaryOp, ty: &Rc<Type>, d: Reg, a: Reg, b: Reg) {
        let signed = ty.is_signed();
        let opcode = match op {
            BinaryOp::Add => Some(Opcode::Add),
            BinaryOp::Sub => Some(Opcode::Sub),
            BinaryOp::Mul => Some(Opcode::Mul),
            BinaryOp::Div => Some(if signed { Opcode::Divs } else { Opcode::Divu }),
            BinaryOp::Mod => Some(if signed { Opcode::Mods } else { Opcode::Modu }),
            BinaryOp::BitAnd => Some(Opcode::And),
            BinaryOp::BitOr => Some(Opcode::Or),
            BinaryOp::BitXor => Some(Opcode::Xor),
            BinaryOp::Shl => Some(Opcode::Shl),
            BinaryOp::Shr => Some(if signed { Opcode::Shrs } else { Opcode::Shru }),
            _ => None,
        };
        if let Some(opcode) = opcode {
            self.ins(
                opcode,
                vec![Operand::Reg(d), Operand::Reg(a), Operand::Reg(b)],
            );
            return;
        }
        // Comparison: cmps/cmpu then a short bias to exactly 0 or 1.
        let cmp = if signed { Opcode::Cmps } else { Opcode::Cmpu };
        self.ins(cmp, vec![Operand::Reg(d), Operand::Reg(a), Operand::Reg(b)]);
        self.compare_bias(op, d);
    }

    /// Turn a three-way compare result (-1, 0, 1) in `d` into the boolean
    /// the comparison operator wants.
    fn compare_bias(&mut self, op: BinaryOp, d: Reg) {
        match op {
            BinaryOp::Eq => {
                self.ins(Opcode::Isz, vec![Operand::Reg(d), Operand::Reg(d)]);
            }
            BinaryOp::Ne => {
                self.ins(Opcode::Bool, vec![Operand::Reg(d), Operand::Reg(d)]);
            }
            BinaryOp::Lt => {
                self.ins(
                    Opcode::Shru,
                    vec![Operand::Reg(d), Operand::Reg(d), Operand::Imm(31)],
                );
            }
            BinaryOp::Gt => {
                self.ins(
                    Opcode::Add,
                    vec![Operand::Reg(d), Operand::Reg(d), Operand::Imm(1)],
                );
                self.ins(
                    Opcode::Shru,
                    vec![Operand::Reg(d), Operand::Reg(d), Operand::Imm(1)],
                );
            }
            BinaryOp::Le => {
                self.ins(
                    Opcode::Sub,
                    vec![Operand::Reg(d), Operand::Reg(d), Operand::Imm(1)],
                );
                self.ins(
                    Opcode::Shru,
                    vec![Operand::Reg(d), Operand::Reg(d), Operand::Imm(31)],
                );
            }
            BinaryOp::Ge => {
                self.ins(
                    Opcode::Add,
                    vec![Operand::Reg(d), Operand::Reg(d), Operand::Imm(1)],
                );
                self.ins(Opcode::Bool, vec![Operand::Reg(d), Operand::Reg(d)]);
            }
            _ => unreachable!("compare_bias on a non-comparison"),
        }
    }

    fn lower_pointer_arith(
        &mut self,
        e: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u32,
    ) -> Result<(), CompileError> {
        let d = Reg::gp(dst);
        let r = self.gp_checked(dst + 1, &e.token)?;

        if lhs.ty.is_pointer() && rhs.ty.is_pointer() {
            // ptr - ptr: subtract, then divide by the element size.
            let size = element_size(&lhs.ty, &e.token)?;
            self.expr(lhs, dst)?;
            self.expr(rhs, dst + 1)?;
            self.ins(
                Opcode::Sub,
                vec![Operand::Reg(d), Operand::Reg(d), Operand::Reg(r)],
            );
            if size > 1 {
                if size.is_power_of_two() {
                    self.ins(
                        Opcode::Shrs,
                        vec![
                            Operand::Reg(d),
                            Operand::Reg(d),
                            Operand::Imm(size.trailing_zeros() as i32),
                        ],
                    );
                } else {
                    self.load_imm(Reg::RA, size as i32);
                    self.ins(
                        Opcode::Divs,
                        vec![Operand::Reg(d), Operand::Reg(d), Operand::Reg(Reg::RA)],
                    );
                }
            }
            return Ok(());
        }

        let (ptr, ptr_first) = if lhs.ty.is_pointer() {
            (lhs, true)
        } else {
            (rhs, false)
        };
        let size = element_size(&ptr.ty, &e.token)?;

        self.expr(lhs, dst)?;
        self.expr(rhs, dst + 1)?;
        let index_reg = if ptr_first { r } else { d };
        self.scale_index(index_reg, size);
        match op {
            BinaryOp::Add => self.ins(
                Opcode::Add,
                vec![Operand::Reg(d), Operand::Reg(d), Operand::Reg(r)],
            ),
            BinaryOp::Sub => self.ins(
                Opcode::Sub,
                vec![Operand::Reg(d), Operand::Reg(d), Operand::Reg(r)],
            ),
            _ => unreachable!("pointer arithmetic is add or sub"),
        }
        Ok(())
    }

    /// Multiply an index register by an element size, preferring a shift.
    fn scale_index(&mut self, reg: Reg, size: u32) {
        if size == 1 {
            return;
        }
        if size.is_power_of_two() {
            self.ins(
                Opcode::Shl,
                vec![
                    Operand::Reg(reg),
                    Operand::Reg(reg),
                    Operand::Imm(size.trailing_zeros() as i32),
                ],
            );
        } else {
            self.load_imm(Reg::RA, size as i32);
            self.ins(
                Opcode::Mul,
                vec![Operand::Reg(reg), Operand::Reg(reg), Operand::Reg(Reg::RA)],
            );
        }
    }

    /// Apply a helper-routine operation. Operand value representations are
    /// already in `a` and `b` (words for 4-byte float, storage pointers
    /// otherwise); the result representation lands in `a`'s register.
    pub(super) fn apply_helper_op(
        &mut self,
        op: BinaryOp,
        operand_ty: &Rc<Type>,
        a: u32,
        b: u32,
        compare: bool,
    ) -> Result<(), CompileError> {
        let helper = runtime::binary_helper(op, operand_ty)?;
        let a_reg = Reg::gp(a);
        let b_reg = Reg::gp(b);
        let is_word_float = operand_ty.is_floating() && operand_ty.size()? == 4;

        if is_word_float {
            // Park both word values in temp slots; the helpers take
            // pointers. Each address moves out of the scratch register
            // before the next lea can reuse it.
            let slot_a = self.alloc_temp(4);
            let slot_b = self.alloc_temp(4);
            self.lea_frame(Reg::RA, slot_a);
            self.ins(
                Opcode::Stw,
                vec![Operand::Reg(a_reg), Operand::Reg(Reg::RA), Operand::Imm(0)],
            );
            self.mov_reg(a_reg, Reg::RA);
            self.lea_frame(Reg::RB, slot_b);
            self.ins(
                Opcode::Stw,
                vec![Operand::Reg(b_reg), Operand::Reg(Reg::RB), Operand::Imm(0)],
            );
            self.mov_reg(b_reg, Reg::RB);
        } else if !compare {
            // The helper writes through its first pointer; never let that
            // be a variable's own storage.
            self.copy_to_temp(a, 8);
        }

        self.call_helper(
            &helper,
            &[HelperArg::Reg(a_reg), HelperArg::Reg(b_reg)],
            a,
            a,
        );

        if compare {
            self.compare_bias(op, a_reg);
        } else if is_word_float {
            self.ins(
                Opcode::Ldw,
                vec![Operand::Reg(a_reg), Operand::Reg(a_reg), Operand::Imm(0)],
            );
        }
        Ok(())
    }

    /// Copy `size` bytes from the address in gp(`reg`) into a fresh temp
    /// slot; gp(`reg`) then points at the copy.
    pub(super) fn copy_to_temp(&mut self, reg: u32, size: u32) {
        let offset = self.alloc_temp(size);
        let r = Reg::gp(reg);
        self.lea_frame(Reg::RB, offset);
        let mut k = 0;
        while k < size {
            self.ins(
                Opcode::Ldw,
                vec![Operand::Reg(Reg::RA), Operand::Reg(r), Operand::Imm(k as i32)],
            );
            self.ins(
                Opcode::Stw,
                vec![
                    Operand::Reg(Reg::RA),
                    Operand::Reg(Reg::RB),
                    Operand::Imm(k as i32),
                ],
            );
            k += 4;
        }
        self.mov_reg(r, Reg::RB);
    }

    /// Copy `size` bytes from [src] to [dest]: inline word moves for
    /// small objects, a memcpy call otherwise.
    pub(super) fn copy_object(
        &mut self,
        dest: u32,
        src: u32,
        size: u32,
        live: u32,
    ) {
        if size <= 32 {
            let mut k = 0;
            while k < size {
                let step = size - k;
                let (op_load, op_store, width) = if step >= 4 {
                    (Opcode::Ldw, Opcode::Stw, 4)
                } else if step >= 2 {
                    (Opcode::Ldh, Opcode::Sts, 2)
                } else {
                    (Opcode::Ldb, Opcode::Stb, 1)
                };
                self.ins(
                    op_load,
                    vec![
                        Operand::Reg(Reg::RA),
                        Operand::Reg(Reg::gp(src)),
                        Operand::Imm(k as i32),
                    ],
                );
                self.ins(
                    op_store,
                    vec![
                        Operand::Reg(Reg::RA),
                        Operand::Reg(Reg::gp(dest)),
                        Operand::Imm(k as i32),
                    ],
                );
                k += width;
            }
        } else {
            self.call_helper(
                runtime::MEMCPY,
                &[
                    HelperArg::Reg(Reg::gp(dest)),
                    HelperArg::Reg(Reg::gp(src)),
                    HelperArg::Imm(size as i32),
                ],
                dest,
                live,
            );
        }
    }

    /// Call a runtime helper: preserve the live registers, stage the
    /// arguments into r0.., call, and move the result into gp(`dst`).
    pub(super) fn call_helper(
        &mut self,
        name: &str,
        args: &[HelperArg],
        dst: u32,
        live: u32,
    ) {
        for i in 0..live {
            self.push_reg(Reg::gp(i));
        }
        // Stage register arguments through scratch so argument and target
        // registers can overlap freely.
        let scratch = [Reg::RA, Reg::RB];
        let mut staged = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            if let HelperArg::Reg(reg) = arg {
                let via = scratch[staged.len()];
                self.mov_reg(via, *reg);
                staged.push((i, via));
            }
        }
        for (i, arg) in args.iter().enumerate() {
            let target = Reg::gp(i as u32);
            match arg {
                HelperArg::Reg(_) => {
                    let via = staged
                        .iter()
                        .find(|(index, _)| *index == i)
                        .map(|(_, via)| *via)
                        .expect("register argument was staged");
                    self.mov_reg(target, via);
                }
                HelperArg::Imm(value) => self.load_imm(target, *value),
            }
        }
        self.ins(
            Opcode::Call,
            vec![Operand::Sym {
                sigil: '^',
                name: name.to_string(),
            }],
        );
        self.mov_reg(Reg::gp(dst), Reg::R0);
        for i in (0..live).rev() {
            self.pop_reg(Reg::gp(i));
        }
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    fn lower_assign(
        &mut self,
        op: Option<BinaryOp>,
        target: &Expr,
        value: &Expr,
        dst: u32,
    ) -> Result<(), CompileError> {
        let d = Reg::gp(dst);
        let Some(op) = op else {
            // Simple assignment: value first, then the location.
            let a = self.gp_checked(dst + 1, &target.token)?;
            self.expr(value, dst)?;
            self.gen_addr(target, dst + 1)?;
            if by_reference(&target.ty) {
                let size = target.ty.size().map_err(|e| e.at(&target.token))?;
                self.copy_object(dst + 1, dst, size, dst);
                self.mov_reg(d, a);
            } else {
                self.store_value(d, a, &target.ty)
                    .map_err(|e| e.at(&target.token))?;
            }
            return Ok(());
        };

        // Compound assignment: read, operate, write back.
        if target.ty.is_pointer() {
            let a = self.gp_checked(dst + 1, &target.token)?;
            self.gen_addr(target, dst)?;
            self.expr(value, dst + 1)?;
            let size = element_size(&target.ty, &target.token)?;
            self.scale_index(a, size);
            self.ins(
                Opcode::Ldw,
                vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
            );
            let opcode = if op == BinaryOp::Add { Opcode::Add } else { Opcode::Sub };
            self.ins(
                opcode,
                vec![Operand::Reg(Reg::RA), Operand::Reg(Reg::RA), Operand::Reg(a)],
            );
            self.ins(
                Opcode::Stw,
                vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
            );
            self.mov_reg(d, Reg::RA);
            return Ok(());
        }

        // The type the operation happens in: shifts keep the target's
        // shape and take a word amount, everything else uses the
        // converted value's type.
        let shift = matches!(op, BinaryOp::Shl | BinaryOp::Shr);
        let op_ty = if shift {
            target.ty.promoted()
        } else {
            Rc::clone(&value.ty)
        };

        if !by_reference(&target.ty)
            && !by_reference(&op_ty)
            && !op_ty.is_floating()
        {
            // Everything fits in registers.
            let a = self.gp_checked(dst + 1, &target.token)?;
            self.gen_addr(target, dst)?;
            self.expr(value, dst + 1)?;
            self.load_value(Reg::RA, d, &target.ty)
                .map_err(|e| e.at(&target.token))?;
            self.apply_int_op(op, &op_ty, Reg::RA, Reg::RA, a);
            self.store_value(Reg::RA, d, &target.ty)
                .map_err(|e| e.at(&target.token))?;
            self.load_value(d, d, &target.ty)
                .map_err(|e| e.at(&target.token))?;
            return Ok(());
        }

        // The operation involves long long or floating values.
        let cur = self.gp_checked(dst + 1, &target.token)?;
        self.gp_checked(dst + 2, &target.token)?;
        self.gen_addr(target, dst)?;
        // Current value, converted to the operation type.
        if by_reference(&target.ty) {
            self.mov_reg(cur, d);
            self.copy_to_temp(dst + 1, target.ty.size().map_err(|e| e.at(&target.token))?);
        } else {
            self.load_value(cur, d, &target.ty)
                .map_err(|e| e.at(&target.token))?;
        }
        self.convert(dst + 1, &target.ty, &op_ty, &target.token)?;
        self.expr(value, dst + 2)?;
        self.apply_helper_op(op, &op_ty, dst + 1, dst + 2, false)?;
        self.convert(dst + 1, &op_ty, &target.ty, &target.token)?;
        if by_reference(&target.ty) {
            let size = target.ty.size().map_err(|e| e.at(&target.token))?;
            self.copy_object(dst, dst + 1, size, dst);
        } else {
            self.store_value(cur, d, &target.ty)
                .map_err(|e| e.at(&target.token))?;
            self.mov_reg(d, cur);
        }
        Ok(())
    }

    fn lower_post_inc_dec(
        &mut self,
        op: IncDec,
        target: &Expr,
        dst: u32,
    ) -> Result<(), CompileError> {
        let d = Reg::gp(dst);
        let addr = self.gp_checked(dst + 1, &target.token)?;
        let ty = &target.ty;

        if !by_reference(ty) && !ty.is_floating() {
            // Integers and pointers.
            let delta = if ty.is_pointer() {
                element_size(ty, &target.token)? as i32
            } else {
                1
            };
            let delta = if op == IncDec::Dec { -delta } else { delta };
            self.gen_addr(target, dst + 1)?;
            self.load_value(d, addr, ty).map_err(|e| e.at(&target.token))?;
            self.mov_reg(Reg::RA, d);
            self.add_imm(Reg::RA, Reg::RA, delta);
            self.store_value(Reg::RA, addr, ty)
                .map_err(|e| e.at(&target.token))?;
            return Ok(());
        }

        // Floating or long long: the old value is the result; compute
        // old ± 1 through the helpers and store it back.
        let work = self.gp_checked(dst + 2, &target.token)?;
        let one = self.gp_checked(dst + 3, &target.token)?;
        let binop = if op == IncDec::Inc { BinaryOp::Add } else { BinaryOp::Sub };
        let size = ty.size().map_err(|e| e.at(&target.token))?;

        self.gen_addr(target, dst + 1)?;
        if by_reference(ty) {
            self.mov_reg(d, addr);
            self.copy_to_temp(dst, size);
            self.mov_reg(work, d);
            self.copy_to_temp(dst + 2, size);
        } else {
            // 4-byte float.
            self.load_value(d, addr, ty).map_err(|e| e.at(&target.token))?;
            self.mov_reg(work, d);
        }
        if ty.is_floating() {
            if size == 4 {
                let bits = 1.0f32.to_bits() as i32;
                self.ins(Opcode::Imw, vec![Operand::Reg(one), Operand::Imm32(bits)]);
            } else {
                self.wide_constant(one, 1.0f64.to_bits())?;
            }
        } else {
            self.wide_constant(one, 1)?;
        }
        self.apply_helper_op(binop, ty, dst + 2, dst + 3, false)?;
        if by_reference(ty) {
            self.copy_object(dst + 1, dst + 2, size, dst + 1);
        } else {
            self.store_value(work, addr, ty)
                .map_err(|e| e.at(&target.token))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    /// Convert the value representation in gp(`reg`) from `from` to `to`.
    pub(super) fn convert(
        &mut self,
        reg: u32,
        from: &Rc<Type>,
        to: &Rc<Type>,
        token: &Rc<crate::lexer::Token>,
    ) -> Result<(), CompileError> {
        if Type::compatible_unqual(from, to) || to.is_void() {
            return Ok(());
        }
        let r = Reg::gp(reg);

        // Decay casts: the array's value is already its address.
        if from.is_array() && to.is_pointer() {
            return Ok(());
        }
        if from.is_function() && to.is_pointer() {
            return Ok(());
        }
        if from.is_record() || to.is_record() {
            // Only identical records convert, and those passed the
            // compatibility test above.
            return Ok(());
        }

        if to.is_bool() {
            return self.convert_to_bool(reg, from);
        }

        let from_wide = by_reference(from);
        let to_wide = by_reference(to);
        let from_float = from.is_floating();
        let to_float = to.is_floating();

        // double and long double share one representation.
        if from_float && to_float && from.size()? == to.size()? {
            return Ok(());
        }

        if !from_float && !to_float {
            if !from_wide && to_wide {
                // int/pointer -> long long.
                let offset = self.alloc_temp(8);
                self.lea_frame(Reg::RB, offset);
                self.ins(
                    Opcode::Stw,
                    vec![Operand::Reg(r), Operand::Reg(Reg::RB), Operand::Imm(0)],
                );
                if from.is_integer() && from.is_signed() {
                    self.ins(
                        Opcode::Shrs,
                        vec![Operand::Reg(Reg::RA), Operand::Reg(r), Operand::Imm(31)],
                    );
                } else {
                    self.ins(Opcode::Zero, vec![Operand::Reg(Reg::RA)]);
                }
                self.ins(
                    Opcode::Stw,
                    vec![Operand::Reg(Reg::RA), Operand::Reg(Reg::RB), Operand::Imm(4)],
                );
                self.mov_reg(r, Reg::RB);
                return Ok(());
            }
            if from_wide && !to_wide {
                // long long -> int/pointer: the low word.
                self.ins(
                    Opcode::Ldw,
                    vec![Operand::Reg(r), Operand::Reg(r), Operand::Imm(0)],
                );
                self.narrow_if_needed(r, to)?;
                return Ok(());
            }
            if from_wide && to_wide {
                // long long <-> unsigned long long: same bits.
                return Ok(());
            }
            // Word-to-word integers and pointers.
            self.narrow_if_needed(r, to)?;
            return Ok(());
        }

        // A floating side is involved: go through the conversion helpers.
        let helper = runtime::conversion_helper(from, to).ok_or_else(|| {
            CompileError::internal(format!("no conversion from '{}' to '{}'", from, to))
                .at(token)
        })?;

        // Source storage pointer in RB.
        if from_wide {
            self.mov_reg(Reg::RB, r);
        } else {
            let offset = self.alloc_temp(4);
            self.lea_frame(Reg::RB, offset);
            self.ins(
                Opcode::Stw,
                vec![Operand::Reg(r), Operand::Reg(Reg::RB), Operand::Imm(0)],
            );
        }
        // Destination storage pointer in RA.
        let dest_size = if to_wide { 8 } else { 4 };
        let dest_offset = self.alloc_temp(dest_size);
        self.lea_frame(Reg::RA, dest_offset);

        self.call_helper(
            &helper,
            &[HelperArg::Reg(Reg::RA), HelperArg::Reg(Reg::RB)],
            reg,
            reg,
        );

        if !to_wide {
            self.ins(
                Opcode::Ldw,
                vec![Operand::Reg(r), Operand::Reg(r), Operand::Imm(0)],
            );
            self.narrow_if_needed(r, to)?;
        }
        Ok(())
    }

    /// Reduce a 32-bit register value to a narrower integer type's range,
    /// re-extending by the target's signedness.
    fn narrow_if_needed(&mut self, r: Reg, to: &Rc<Type>) -> Result<(), CompileError> {
        if !to.is_integer() {
            return Ok(());
        }
        let size = to.size()?;
        if size >= 4 {
            return Ok(());
        }
        let shift = (4 - size) * 8;
        self.ins(
            Opcode::Shl,
            vec![Operand::Reg(r), Operand::Reg(r), Operand::Imm(shift as i32)],
        );
        let back = if to.is_signed() { Opcode::Shrs } else { Opcode::Shru };
        self.ins(
            back,
            vec![Operand::Reg(r), Operand::Reg(r), Operand::Imm(shift as i32)],
        );
        Ok(())
    }

    fn convert_to_bool(&mut self, reg: u32, from: &Rc<Type>) -> Result<(), CompileError> {
        let r = Reg::gp(reg);
        if by_reference(from) {
            if from.is_floating() {
                // Two words; ignore the high sign bit so -0.0 is false.
                self.ins(
                    Opcode::Ldw,
                    vec![Operand::Reg(Reg::RA), Operand::Reg(r), Operand::Imm(0)],
                );
                self.ins(
                    Opcode::Ldw,
                    vec![Operand::Reg(Reg::RB), Operand::Reg(r), Operand::Imm(4)],
                );
                self.ins(
                    Opcode::Shl,
                    vec![Operand::Reg(Reg::RB), Operand::Reg(Reg::RB), Operand::Imm(1)],
                );
            } else {
                self.ins(
                    Opcode::Ldw,
                    vec![Operand::Reg(Reg::RA), Operand::Reg(r), Operand::Imm(0)],
                );
                self.ins(
                    Opcode::Ldw,
                    vec![Operand::Reg(Reg::RB), Operand::Reg(r), Operand::Imm(4)],
                );
            }
            self.ins(
                Opcode::Or,
                vec![Operand::Reg(r), Operand::Reg(Reg::RA), Operand::Reg(Reg::RB)],
            );
            self.ins(Opcode::Bool, vec![Operand::Reg(r), Operand::Reg(r)]);
            return Ok(());
        }
        if from.is_floating() {
            // 4-byte float: clear the sign bit so -0.0 is false.
            self.ins(
                Opcode::Shl,
                vec![Operand::Reg(r), Operand::Reg(r), Operand::Imm(1)],
            );
        }
        self.ins(Opcode::Bool, vec![Operand::Reg(r), Operand::Reg(r)]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn lower_call(
        &mut self,
        e: &Expr,
        callee: &Expr,
        args: &[Expr],
        dst: u32,
    ) -> Result<(), CompileError> {
        let d = self.gp_checked(dst, &e.token)?;
        let sig = callee
            .ty
            .signature()
            .ok_or_else(|| CompileError::internal("call through a non-function").at(&e.token))?;
        let ret = &e.ty;
        let wide_ret = by_reference(ret);

        // Classify arguments: register slots are r0-r3, with r1 reserved
        // for the hidden result pointer on wide-returning calls. Variadic
        // calls pass everything on the stack.
        let slots: &[u32] = if wide_ret { &[0, 2, 3] } else { &[0, 1, 2, 3] };
        let mut reg_args: Vec<(usize, u32)> = Vec::new();
        let mut stack_args: Vec<usize> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            if !sig.variadic
                && !by_reference(&arg.ty)
                && reg_args.len() < slots.len()
            {
                reg_args.push((i, slots[reg_args.len()]));
            } else {
                stack_args.push(i);
            }
        }

        for i in 0..dst {
            self.push_reg(Reg::gp(i));
        }

        // Stack-resident arguments, right to left.
        let mut pushed_bytes: u32 = 0;
        for &i in stack_args.iter().rev() {
            let arg = &args[i];
            self.expr(arg, 0)?;
            if by_reference(&arg.ty) {
                let size = arg.ty.size().map_err(|err| err.at(&arg.token))?;
                let rounded = size.div_ceil(4) * 4;
                self.add_imm(Reg::RSP, Reg::RSP, -(rounded as i32));
                self.copy_stack_arg(size)?;
                pushed_bytes += rounded;
            } else {
                self.push_reg(Reg::R0);
                pushed_bytes += 4;
            }
        }

        // An indirect callee is computed before the register arguments
        // and parked on the stack.
        let direct = direct_callee(callee);
        if direct.is_none() {
            self.expr(callee, 0)?;
            self.push_reg(Reg::R0);
        }

        for &(i, slot) in &reg_args {
            self.expr(&args[i], slot)?;
        }

        let ret_slot = if wide_ret {
            let size = ret.size().map_err(|err| err.at(&e.token))?;
            let offset = self.alloc_temp(size);
            self.lea_frame(Reg::R1, offset);
            Some(offset)
        } else {
            None
        };

        match &direct {
            Some(symbol) => {
                let name = symbol.asm_name();
                self.ins(
                    Opcode::Call,
                    vec![Operand::Sym {
                        sigil: '^',
                        name: name.to_string(),
                    }],
                );
            }
            None => {
                self.pop_reg(Reg::RA);
                self.ins(Opcode::Call, vec![Operand::Reg(Reg::RA)]);
            }
        }

        if pushed_bytes > 0 {
            self.add_imm(Reg::RSP, Reg::RSP, pushed_bytes as i32);
        }

        if let Some(offset) = ret_slot {
            self.lea_frame(d, offset);
        } else if !ret.is_void() {
            self.mov_reg(d, Reg::R0);
        }

        for i in (0..dst).rev() {
            self.pop_reg(Reg::gp(i));
        }
        Ok(())
    }

    /// Copy a wide argument's storage (address in r0) onto the freshly
    /// reserved stack space.
    fn copy_stack_arg(&mut self, size: u32) -> Result<(), CompileError> {
        if size <= 32 {
            let mut k = 0;
            while k < size {
                self.ins(
                    Opcode::Ldw,
                    vec![
                        Operand::Reg(Reg::RA),
                        Operand::Reg(Reg::R0),
                        Operand::Imm(k as i32),
                    ],
                );
                self.ins(
                    Opcode::Stw,
                    vec![
                        Operand::Reg(Reg::RA),
                        Operand::Reg(Reg::RSP),
                        Operand::Imm(k as i32),
                    ],
                );
                k += 4;
            }
        } else {
            self.call_helper(
                runtime::MEMCPY,
                &[
                    HelperArg::Reg(Reg::RSP),
                    HelperArg::Reg(Reg::R0),
                    HelperArg::Imm(size as i32),
                ],
                0,
                0,
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statement expressions and variadic builtins
    // ------------------------------------------------------------------

    fn lower_statement_expression(
        &mut self,
        e: &Expr,
        stmts: &[Stmt],
        dst: u32,
    ) -> Result<(), CompileError> {
        // Inner statement boundaries must not release temporaries that
        // belong to the surrounding expression.
        let saved_floor = self.frame_floor;
        self.frame_floor = self.frame_cursor;

        let value_stmt = if e.ty.is_void() { stmts.len() } else { stmts.len() - 1 };
        for stmt in &stmts[..value_stmt] {
            self.lower_stmt(stmt)?;
        }
        if let Some(Stmt::Expr(value)) = stmts.get(value_stmt) {
            self.expr(value, dst)?;
        } else if let Some(stmt) = stmts.get(value_stmt) {
            self.lower_stmt(stmt)?;
        }

        self.frame_floor = saved_floor;
        Ok(())
    }

    fn lower_va_start(&mut self, ap: &Expr, dst: u32) -> Result<(), CompileError> {
        let d = Reg::gp(dst);
        let named = self
            .func
            .as_ref()
            .map(|f| f.named_stack_bytes)
            .unwrap_or(0);
        self.gen_addr(ap, dst)?;
        // The variadic area starts right after the named parameters.
        self.add_imm(Reg::RA, Reg::RFP, 8 + named as i32);
        self.ins(
            Opcode::Stw,
            vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
        );
        Ok(())
    }

    fn lower_va_arg(&mut self, e: &Expr, ap: &Expr, dst: u32) -> Result<(), CompileError> {
        let d = Reg::gp(dst);
        let p = self.gp_checked(dst + 1, &e.token)?;
        let size = e.ty.size().map_err(|err| err.at(&e.token))?;
        let rounded = size.div_ceil(4) * 4;

        self.gen_addr(ap, dst)?;
        self.ins(
            Opcode::Ldw,
            vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
        );
        self.mov_reg(p, Reg::RA);
        self.add_imm(Reg::RA, Reg::RA, rounded as i32);
        self.ins(
            Opcode::Stw,
            vec![Operand::Reg(Reg::RA), Operand::Reg(d), Operand::Imm(0)],
        );
        if by_reference(&e.ty) {
            // The argument's storage on the caller's stack is the value.
            self.mov_reg(d, p);
        } else {
            self.load_value(d, p, &e.ty).map_err(|err| err.at(&e.token))?;
        }
        Ok(())
    }
}

fn element_size(
    ptr_ty: &Rc<Type>,
    token: &Rc<crate::lexer::Token>,
) -> Result<u32, CompileError> {
    let pointee = ptr_ty
        .pointee()
        .ok_or_else(|| CompileError::internal("pointer arithmetic without a pointee"))?;
    pointee.size().map_err(|e| e.at(token))
}

fn direct_callee(callee: &Expr) -> Option<Rc<Symbol>> {
    match &callee.kind {
        ExprKind::Sym(symbol) if symbol.ty().is_function() => Some(Rc::clone(symbol)),
        ExprKind::Cast(inner) => direct_callee(inner),
        _ => None,
    }
}
