//! Global data images.
//!
//! Globals are lowered in declaration order: a data image is built per
//! symbol with explicit zero padding between members, so the emitter can
//! write it out term by term. Static locals get their unique `__L_` label
//! here, before any function body references them.

use std::rc::Rc;

use super::state::{AsmItem, DataTerm};
use super::CodeGen;
use crate::ast::{Expr, ExprKind, Global, Init, UnaryOp};
use crate::error::CompileError;
use crate::records::RecordKind;
use crate::scope::Linkage;
use crate::types::Type;

/// A global scalar initialiser reduced to an emissible constant.
enum ConstValue {
    Int(i64),
    Float(f64),
    /// Address of a symbol or string-literal label.
    Addr(String),
}

impl CodeGen {
    pub(super) fn lower_global(&mut self, g: &Global) -> Result<(), CompileError> {
        // A static local's label must be unique across the unit.
        if g.symbol.linkage() == Linkage::None {
            let label = format!("__L_{:x}_{}", self.next_static, g.symbol.name);
            self.next_static += 1;
            g.symbol.set_asm_name(self.interner.intern(&label));
        }

        let ty = g.symbol.ty();
        let size = ty.size().map_err(|e| e.at(&g.token))?;
        let data = match &g.init {
            None => vec![DataTerm::Zeroes(size)],
            Some(init) => {
                let mut data = Vec::new();
                self.build_data(&ty, init, &mut data)?;
                data
            }
        };

        self.globals.push(AsmItem::Variable {
            name: g.symbol.asm_name().to_string(),
            data,
        });
        Ok(())
    }

    /// Append the data image of `init` for an object of type `ty`. The
    /// image always covers exactly `size(ty)` bytes.
    fn build_data(
        &mut self,
        ty: &Rc<Type>,
        init: &Init,
        out: &mut Vec<DataTerm>,
    ) -> Result<(), CompileError> {
        match init {
            Init::Scalar(expr) => self.build_scalar_data(ty, expr, out),
            Init::List(items) => self.build_list_data(ty, items, out),
        }
    }

    fn build_list_data(
        &mut self,
        ty: &Rc<Type>,
        items: &[Init],
        out: &mut Vec<DataTerm>,
    ) -> Result<(), CompileError> {
        if let Some(element) = ty.element() {
            let element_size = element.size()?;
            for item in items {
                self.build_data(&element, item, out)?;
            }
            let total = ty.size()?;
            let filled = items.len() as u32 * element_size;
            if total > filled {
                out.push(DataTerm::Zeroes(total - filled));
            }
            return Ok(());
        }

        if let Some(record) = ty.as_record() {
            let size = ty.size()?;
            let members: Vec<_> = record
                .members()
                .into_iter()
                .filter(|(_, member_ty, _)| !member_ty.is_flexible_array())
                .collect();
            let mut end: u32 = 0;
            let limit = match record.kind() {
                RecordKind::Struct => items.len(),
                RecordKind::Union => items.len().min(1),
            };
            for (item, (_, member_ty, member_offset)) in items.iter().take(limit).zip(&members) {
                if *member_offset > end {
                    out.push(DataTerm::Zeroes(member_offset - end));
                }
                self.build_data(member_ty, item, out)?;
                end = member_offset + member_ty.size()?;
            }
            if size > end {
                out.push(DataTerm::Zeroes(size - end));
            }
            return Ok(());
        }

        // Braced scalar.
        match items.first() {
            Some(item) => self.build_data(ty, item, out),
            None => {
                out.push(DataTerm::Zeroes(ty.size()?));
                Ok(())
            }
        }
    }

    fn build_scalar_data(
        &mut self,
        ty: &Rc<Type>,
        expr: &Expr,
        out: &mut Vec<DataTerm>,
    ) -> Result<(), CompileError> {
        // char name[] = "literal";
        if ty.is_array() {
            let ExprKind::Str(bytes) = &expr.kind else {
                return Err(CompileError::semantic(
                    "array initialiser is not a constant",
                    &expr.token,
                ));
            };
            let size = ty.size()?;
            let mut image = bytes.clone();
            if (image.len() as u32) < size {
                image.push(0);
            }
            let padding = size - image.len() as u32;
            out.push(DataTerm::Bytes(image));
            if padding > 0 {
                out.push(DataTerm::Zeroes(padding));
            }
            return Ok(());
        }

        let value = self.const_value(expr)?;
        let size = ty.size()?;
        match value {
            ConstValue::Addr(name) => {
                if size != 4 {
                    return Err(CompileError::semantic(
                        "address initialiser for a non-pointer object",
                        &expr.token,
                    ));
                }
                out.push(DataTerm::Addr(name));
            }
            ConstValue::Float(f) => match size {
                4 => out.push(DataTerm::Word((f as f32).to_bits())),
                8 => {
                    let bits = f.to_bits();
                    out.push(DataTerm::Word(bits as u32));
                    out.push(DataTerm::Word((bits >> 32) as u32));
                }
                _ => {
                    return Err(CompileError::internal("odd floating object size")
                        .at(&expr.token));
                }
            },
            ConstValue::Int(v) => match size {
                1 => out.push(DataTerm::Bytes(vec![v as u8])),
                2 => out.push(DataTerm::Bytes((v as u16).to_le_bytes().to_vec())),
                4 => out.push(DataTerm::Word(v as u32)),
                8 => {
                    out.push(DataTerm::Word(v as u64 as u32));
                    out.push(DataTerm::Word((v as u64 >> 32) as u32));
                }
                _ => {
                    return Err(CompileError::semantic(
                        "initialiser is not a constant",
                        &expr.token,
                    ));
                }
            },
        }
        Ok(())
    }

    /// Evaluate a file-scope initialiser: an arithmetic constant
    /// expression or an address constant.
    fn const_value(&mut self, expr: &Expr) -> Result<ConstValue, CompileError> {
        if let Some(value) = self.const_addr(expr) {
            return Ok(value);
        }
        if let Some(value) = const_float(expr) {
            // The parser has already cast the initialiser to the target
            // type; an integer target means the float truncates there.
            if expr.ty.is_floating() {
                return Ok(ConstValue::Float(value));
            }
        }
        expr.const_int_value().map(ConstValue::Int)
    }

    /// Address constants: a global's name, &global, a string literal, or
    /// a cast thereof.
    fn const_addr(&mut self, expr: &Expr) -> Option<ConstValue> {
        match &expr.kind {
            ExprKind::Str(bytes) => {
                let label = self.add_string_constant(bytes.clone());
                Some(ConstValue::Addr(label))
            }
            ExprKind::Sym(symbol) => {
                if symbol.is_local() {
                    return None;
                }
                let ty = symbol.ty();
                if ty.is_function() || ty.is_array() {
                    Some(ConstValue::Addr(symbol.asm_name().to_string()))
                } else {
                    None
                }
            }
            ExprKind::Unary {
                op: UnaryOp::AddressOf,
                operand,
            } => match &operand.kind {
                ExprKind::Sym(symbol) if !symbol.is_local() => {
                    Some(ConstValue::Addr(symbol.asm_name().to_string()))
                }
                _ => None,
            },
            ExprKind::Cast(inner) => self.const_addr(inner),
            _ => None,
        }
    }
}

/// A floating constant expression: literals, negation, and casts of
/// integer constants.
fn const_float(expr: &Expr) -> Option<f64> {
    match &expr.kind {
        ExprKind::Float(f) => Some(*f),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => const_float(operand).map(|f| -f),
        ExprKind::Cast(inner) => {
            if let Some(f) = const_float(inner) {
                return Some(f);
            }
            inner.const_int_value().ok().map(|v| v as f64)
        }
        _ => None,
    }
}
