//! Expression parsing.
//!
//! Precedence climbing over the binary operators, with right-associative
//! assignment and conditional. Conversions happen here: every node leaves
//! the parser carrying its final type, so the code generator only reads
//! types, never computes them.

use std::rc::Rc;

use super::Parser;
use crate::ast::{BinaryOp, Expr, ExprKind, IncDec, UnaryOp};
use crate::config::WarningSet;
use crate::error::CompileError;
use crate::lexer::{self, Token, TokenKind, is_keyword};
use crate::scope::{Builtin, Linkage, Symbol, SymbolKind};
use crate::types::{Base, Type};

/// Binding strength of a binary operator; higher binds tighter.
fn binary_precedence(text: &str) -> Option<u32> {
    match text {
        "*" | "/" | "%" => Some(10),
        "+" | "-" => Some(9),
        "<<" | ">>" => Some(8),
        "<" | ">" | "<=" | ">=" => Some(7),
        "==" | "!=" => Some(6),
        "&" => Some(5),
        "^" => Some(4),
        "|" => Some(3),
        "&&" => Some(2),
        "||" => Some(1),
        _ => None,
    }
}

fn compound_assign_op(text: &str) -> Option<BinaryOp> {
    match text {
        "+=" => Some(BinaryOp::Add),
        "-=" => Some(BinaryOp::Sub),
        "*=" => Some(BinaryOp::Mul),
        "/=" => Some(BinaryOp::Div),
        "%=" => Some(BinaryOp::Mod),
        "<<=" => Some(BinaryOp::Shl),
        ">>=" => Some(BinaryOp::Shr),
        "&=" => Some(BinaryOp::BitAnd),
        "|=" => Some(BinaryOp::BitOr),
        "^=" => Some(BinaryOp::BitXor),
        _ => None,
    }
}

impl Parser {
    /// Full expression, comma operator included.
    pub(super) fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_assignment()?;
        while self.lexer.is(",") {
            let token = self.lexer.take()?;
            let rhs = self.parse_assignment()?;
            let ty = Rc::clone(&rhs.ty);
            lhs = Expr::new(
                ExprKind::Comma {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty,
                token,
            );
        }
        Ok(lhs)
    }

    pub(super) fn parse_assignment(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_conditional()?;

        let text = self.current().text.to_string();
        let is_simple = self.lexer.is("=");
        let compound = compound_assign_op(&text).filter(|_| self.lexer.is(&text));
        if !is_simple && compound.is_none() {
            return Ok(lhs);
        }

        let token = self.lexer.take()?;
        if !lhs.is_lvalue() {
            return Err(CompileError::semantic(
                "expression is not assignable",
                &token,
            ));
        }
        let rhs = self.parse_assignment()?.decay();
        let result_ty = Type::unqualified(&lhs.ty);

        if is_simple {
            let value = self.assign_convert(rhs, &lhs.ty)?;
            return Ok(Expr::new(
                ExprKind::Assign {
                    op: None,
                    target: Box::new(lhs),
                    value: Box::new(value),
                },
                result_ty,
                token,
            ));
        }

        let op = compound.unwrap();
        let value = if lhs.ty.is_pointer() && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            if !rhs.ty.is_integer() {
                return Err(CompileError::semantic(
                    "pointer compound assignment requires an integer operand",
                    &token,
                ));
            }
            rhs.promote()
        } else {
            if !lhs.ty.is_arithmetic() || !rhs.ty.is_arithmetic() {
                return Err(CompileError::semantic(
                    "invalid operands of compound assignment",
                    &token,
                ));
            }
            if matches!(
                op,
                BinaryOp::Mod | BinaryOp::Shl | BinaryOp::Shr | BinaryOp::BitAnd
                    | BinaryOp::BitOr | BinaryOp::BitXor
            ) && (!lhs.ty.is_integer() || !rhs.ty.is_integer())
            {
                return Err(CompileError::semantic(
                    "operator requires integer operands",
                    &token,
                ));
            }
            if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
                // Shift amounts promote on their own; the computation
                // keeps the target's promoted type.
                rhs.promote()
            } else {
                // The computation happens in the usual-conversion type;
                // the value field carries it so the generator knows the
                // width.
                let lhs_ty = Rc::clone(&lhs.ty);
                let probe = Expr::new(ExprKind::Int(0), lhs_ty, Rc::clone(&token));
                let (_, rhs, _) = self.usual_arithmetic(probe, rhs, &token, false)?;
                rhs
            }
        };

        Ok(Expr::new(
            ExprKind::Assign {
                op: Some(op),
                target: Box::new(lhs),
                value: Box::new(value),
            },
            result_ty,
            token,
        ))
    }

    fn parse_conditional(&mut self) -> Result<Expr, CompileError> {
        let cond = self.parse_binary(1)?;
        if !self.lexer.is("?") {
            return Ok(cond);
        }
        let token = self.lexer.take()?;
        let cond = cond.decay().to_predicate();
        let then_expr = self.parse_expr()?.decay();
        self.lexer.expect(":", "expected ':' in conditional expression")?;
        let else_expr = self.parse_conditional()?.decay();

        let (then_expr, else_expr, ty) = self.unify_conditional(then_expr, else_expr, &token)?;
        Ok(Expr::new(
            ExprKind::Conditional {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            ty,
            token,
        ))
    }

    fn unify_conditional(
        &mut self,
        a: Expr,
        b: Expr,
        token: &Rc<Token>,
    ) -> Result<(Expr, Expr, Rc<Type>), CompileError> {
        if a.ty.is_arithmetic() && b.ty.is_arithmetic() {
            let (a, b, ty) = self.usual_arithmetic(a, b, token, false)?;
            return Ok((a, b, ty));
        }
        if a.ty.is_void() && b.ty.is_void() {
            let ty = Rc::clone(&a.ty);
            return Ok((a, b, ty));
        }
        if a.ty.is_pointer() && b.is_zero_constant() {
            let ty = Rc::clone(&a.ty);
            let b = b.cast_to(Rc::clone(&ty));
            return Ok((a, b, ty));
        }
        if b.ty.is_pointer() && a.is_zero_constant() {
            let ty = Rc::clone(&b.ty);
            let a = a.cast_to(Rc::clone(&ty));
            return Ok((a, b, ty));
        }
        if a.ty.is_pointer() && b.ty.is_pointer() {
            let ty = Rc::clone(&a.ty);
            let b = b.cast_to(Rc::clone(&ty));
            return Ok((a, b, ty));
        }
        if Type::compatible_unqual(&a.ty, &b.ty) {
            let ty = Type::unqualified(&a.ty);
            return Ok((a, b, ty));
        }
        Err(CompileError::semantic(
            "incompatible operands of '?:'",
            token,
        ))
    }

    fn parse_binary(&mut self, min_prec: u32) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_cast_expr()?;
        loop {
            let prec = match binary_precedence(&self.current().text) {
                Some(p) if self.current().kind == TokenKind::Punctuation && p >= min_prec => p,
                _ => break,
            };
            let token = self.lexer.take()?;
            let rhs = self.parse_binary(prec + 1)?;
            lhs = self.build_binary(token, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn build_binary(
        &mut self,
        token: Rc<Token>,
        lhs: Expr,
        rhs: Expr,
    ) -> Result<Expr, CompileError> {
        let lhs = lhs.decay();
        let rhs = rhs.decay();
        let text = token.text.to_string();

        match text.as_str() {
            "&&" | "||" => {
                if !lhs.ty.is_scalar() || !rhs.ty.is_scalar() {
                    return Err(CompileError::semantic("invalid operands of logical operator", &token));
                }
                let and = text == "&&";
                return Ok(Expr::new(
                    ExprKind::Logical {
                        and,
                        lhs: Box::new(lhs.to_predicate()),
                        rhs: Box::new(rhs.to_predicate()),
                    },
                    Type::int(),
                    token,
                ));
            }
            "==" | "!=" | "<" | ">" | "<=" | ">=" => {
                let op = match text.as_str() {
                    "==" => BinaryOp::Eq,
                    "!=" => BinaryOp::Ne,
                    "<" => BinaryOp::Lt,
                    ">" => BinaryOp::Gt,
                    "<=" => BinaryOp::Le,
                    _ => BinaryOp::Ge,
                };
                let (lhs, rhs) = if lhs.ty.is_pointer() || rhs.ty.is_pointer() {
                    // Pointer comparisons happen as unsigned words.
                    (lhs.cast_to(Type::uint()), rhs.cast_to(Type::uint()))
                } else {
                    let (lhs, rhs, _) = self.usual_arithmetic(lhs, rhs, &token, true)?;
                    (lhs, rhs)
                };
                return Ok(Expr::new(
                    ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    Type::int(),
                    token,
                ));
            }
            "+" => {
                if lhs.ty.is_pointer() && rhs.ty.is_integer() {
                    self.check_pointee_size(&lhs.ty, &token)?;
                    let ty = Rc::clone(&lhs.ty);
                    return Ok(Expr::new(
                        ExprKind::Binary {
                            op: BinaryOp::Add,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs.promote()),
                        },
                        ty,
                        token,
                    ));
                }
                if lhs.ty.is_integer() && rhs.ty.is_pointer() {
                    self.check_pointee_size(&rhs.ty, &token)?;
                    let ty = Rc::clone(&rhs.ty);
                    return Ok(Expr::new(
                        ExprKind::Binary {
                            op: BinaryOp::Add,
                            lhs: Box::new(lhs.promote()),
                            rhs: Box::new(rhs),
                        },
                        ty,
                        token,
                    ));
                }
            }
            "-" => {
                if lhs.ty.is_pointer() && rhs.ty.is_integer() {
                    self.check_pointee_size(&lhs.ty, &token)?;
                    let ty = Rc::clone(&lhs.ty);
                    return Ok(Expr::new(
                        ExprKind::Binary {
                            op: BinaryOp::Sub,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs.promote()),
                        },
                        ty,
                        token,
                    ));
                }
                if lhs.ty.is_pointer() && rhs.ty.is_pointer() {
                    self.check_pointee_size(&lhs.ty, &token)?;
                    return Ok(Expr::new(
                        ExprKind::Binary {
                            op: BinaryOp::Sub,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        Type::int(),
                        token,
                    ));
                }
            }
            "<<" | ">>" => {
                if !lhs.ty.is_integer() || !rhs.ty.is_integer() {
                    return Err(CompileError::semantic(
                        "shift requires integer operands",
                        &token,
                    ));
                }
                // Shifts promote each operand separately; the result has
                // the promoted left operand's type.
                let lhs = lhs.promote();
                let rhs = rhs.promote();
                let ty = Rc::clone(&lhs.ty);
                let op = if text == "<<" { BinaryOp::Shl } else { BinaryOp::Shr };
                return Ok(Expr::new(
                    ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    ty,
                    token,
                ));
            }
            _ => {}
        }

        // Plain arithmetic: + - * / % & | ^
        let op = match text.as_str() {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "&" => BinaryOp::BitAnd,
            "|" => BinaryOp::BitOr,
            "^" => BinaryOp::BitXor,
            other => {
                return Err(CompileError::internal(format!(
                    "unhandled binary operator '{}'",
                    other
                )));
            }
        };
        let integer_only = matches!(
            op,
            BinaryOp::Mod | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor
        );
        if integer_only && (!lhs.ty.is_integer() || !rhs.ty.is_integer()) {
            return Err(CompileError::semantic(
                "operator requires integer operands",
                &token,
            ));
        }
        if !lhs.ty.is_arithmetic() || !rhs.ty.is_arithmetic() {
            return Err(CompileError::semantic("invalid operands", &token));
        }
        let (lhs, rhs, ty) = self.usual_arithmetic(lhs, rhs, &token, false)?;
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            token,
        ))
    }

    fn check_pointee_size(&self, ty: &Rc<Type>, token: &Rc<Token>) -> Result<(), CompileError> {
        let pointee = ty
            .pointee()
            .ok_or_else(|| CompileError::internal("pointer without pointee"))?;
        pointee.size().map_err(|e| e.at(token))?;
        Ok(())
    }

    /// The usual arithmetic conversions. Returns both operands converted
    /// plus the common type. With `comparing`, a signed/unsigned mix
    /// triggers the sign-compare warning.
    fn usual_arithmetic(
        &mut self,
        lhs: Expr,
        rhs: Expr,
        token: &Rc<Token>,
        comparing: bool,
    ) -> Result<(Expr, Expr, Rc<Type>), CompileError> {
        if !lhs.ty.is_arithmetic() || !rhs.ty.is_arithmetic() {
            return Err(CompileError::semantic("invalid operands", token));
        }

        // Floating wins, widest first.
        for base in [Base::LongDouble, Base::Double, Base::Float] {
            let probe = Type::base(base.clone());
            if Type::compatible_unqual(&lhs.ty, &probe)
                || Type::compatible_unqual(&rhs.ty, &probe)
            {
                let ty = Type::base(base);
                let lhs = lhs.cast_to(Rc::clone(&ty));
                let rhs = rhs.cast_to(Rc::clone(&ty));
                return Ok((lhs, rhs, ty));
            }
        }

        let lhs = lhs.promote();
        let rhs = rhs.promote();
        if comparing && lhs.ty.is_signed() != rhs.ty.is_signed() {
            self.warn(
                WarningSet::SIGN_COMPARE,
                token,
                "comparison between signed and unsigned; the unsigned type wins",
            );
        }

        let ty = common_integer_type(&lhs.ty, &rhs.ty);
        let lhs = lhs.cast_to(Rc::clone(&ty));
        let rhs = rhs.cast_to(Rc::clone(&ty));
        Ok((lhs, rhs, ty))
    }

    // ------------------------------------------------------------------
    // Cast, unary, postfix
    // ------------------------------------------------------------------

    fn parse_cast_expr(&mut self) -> Result<Expr, CompileError> {
        if self.lexer.is("(") {
            let open = self.lexer.take()?;
            if self.starts_type() {
                let ty = self.parse_typename()?;
                self.lexer.expect(")", "expected ')' after type name")?;
                if self.lexer.is("{") {
                    return Err(CompileError::unsupported(
                        "compound literals are not supported",
                        self.current(),
                    ));
                }
                let operand = self.parse_cast_expr()?.decay();
                if !ty.is_void()
                    && !(ty.is_scalar() && operand.ty.is_scalar())
                    && !Type::compatible_unqual(&ty, &operand.ty)
                {
                    return Err(CompileError::semantic("invalid cast", &open));
                }
                let operand = Box::new(operand);
                return Ok(Expr::new(ExprKind::Cast(operand), ty, open));
            }
            self.lexer.push_back(open);
        }
        self.parse_unary()
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if self.current().kind == TokenKind::Punctuation {
            match self.current().text.as_str() {
                "++" | "--" => {
                    let token = self.lexer.take()?;
                    let inc = token.text == "++";
                    let target = self.parse_unary()?;
                    return self.build_pre_inc_dec(token, target, inc);
                }
                "+" => {
                    let token = self.lexer.take()?;
                    let operand = self.parse_cast_expr()?.decay();
                    if !operand.ty.is_arithmetic() {
                        return Err(CompileError::semantic("invalid operand of unary '+'", &token));
                    }
                    return Ok(operand.promote());
                }
                "-" => {
                    let token = self.lexer.take()?;
                    let operand = self.parse_cast_expr()?.decay();
                    if !operand.ty.is_arithmetic() {
                        return Err(CompileError::semantic("invalid operand of unary '-'", &token));
                    }
                    let operand = if operand.ty.is_integer() {
                        operand.promote()
                    } else {
                        operand
                    };
                    let ty = Rc::clone(&operand.ty);
                    return Ok(Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::Neg,
                            operand: Box::new(operand),
                        },
                        ty,
                        token,
                    ));
                }
                "!" => {
                    let token = self.lexer.take()?;
                    let operand = self.parse_cast_expr()?.decay();
                    if !operand.ty.is_scalar() {
                        return Err(CompileError::semantic("invalid operand of '!'", &token));
                    }
                    return Ok(Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::LogicalNot,
                            operand: Box::new(operand.to_predicate()),
                        },
                        Type::int(),
                        token,
                    ));
                }
                "~" => {
                    let token = self.lexer.take()?;
                    let operand = self.parse_cast_expr()?.decay();
                    if !operand.ty.is_integer() {
                        return Err(CompileError::semantic("invalid operand of '~'", &token));
                    }
                    let operand = operand.promote();
                    let ty = Rc::clone(&operand.ty);
                    return Ok(Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::Complement,
                            operand: Box::new(operand),
                        },
                        ty,
                        token,
                    ));
                }
                "*" => {
                    let token = self.lexer.take()?;
                    let operand = self.parse_cast_expr()?.decay();
                    let pointee = operand.ty.pointee().ok_or_else(|| {
                        CompileError::semantic("cannot dereference a non-pointer", &token)
                    })?;
                    return Ok(Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::Deref,
                            operand: Box::new(operand),
                        },
                        pointee,
                        token,
                    ));
                }
                "&" => {
                    let token = self.lexer.take()?;
                    // No decay here: &array yields pointer-to-array.
                    let operand = self.parse_cast_expr()?;
                    if !operand.is_lvalue() && !operand.ty.is_function() {
                        return Err(CompileError::semantic(
                            "cannot take the address of this expression",
                            &token,
                        ));
                    }
                    let ty = Type::pointer(Rc::clone(&operand.ty));
                    return Ok(Expr::new(
                        ExprKind::Unary {
                            op: UnaryOp::AddressOf,
                            operand: Box::new(operand),
                        },
                        ty,
                        token,
                    ));
                }
                _ => {}
            }
        }
        if self.lexer.is("sizeof") {
            let token = self.lexer.take()?;
            let ty = if self.lexer.is("(") {
                let open = self.lexer.take()?;
                if self.starts_type() {
                    let ty = self.parse_typename()?;
                    self.lexer.expect(")", "expected ')' after type name")?;
                    ty
                } else {
                    self.lexer.push_back(open);
                    let operand = self.parse_unary()?;
                    Rc::clone(&operand.ty)
                }
            } else {
                let operand = self.parse_unary()?;
                Rc::clone(&operand.ty)
            };
            let size = ty.size().map_err(|e| e.at(&token))?;
            return Ok(Expr::new(
                ExprKind::Int(i64::from(size)),
                Type::uint(),
                token,
            ));
        }
        self.parse_postfix()
    }

    fn build_pre_inc_dec(
        &mut self,
        token: Rc<Token>,
        target: Expr,
        inc: bool,
    ) -> Result<Expr, CompileError> {
        if !target.is_lvalue() || !target.ty.is_scalar() {
            return Err(CompileError::semantic(
                "operand of '++'/'--' must be a scalar lvalue",
                &token,
            ));
        }
        let one = Expr::new(ExprKind::Int(1), Type::int(), Rc::clone(&token));
        let value = if target.ty.is_pointer() {
            one
        } else {
            let comp = common_arithmetic_with_int(&target.ty);
            one.cast_to(comp)
        };
        let result_ty = Type::unqualified(&target.ty);
        Ok(Expr::new(
            ExprKind::Assign {
                op: Some(if inc { BinaryOp::Add } else { BinaryOp::Sub }),
                target: Box::new(target),
                value: Box::new(value),
            },
            result_ty,
            token,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.lexer.is("(") {
                let token = self.lexer.take()?;
                expr = self.build_call(expr, token)?;
            } else if self.lexer.is("[") {
                let token = self.lexer.take()?;
                let index = self.parse_expr()?;
                self.lexer.expect("]", "expected ']' after subscript")?;
                expr = self.build_subscript(expr, index, token)?;
            } else if self.lexer.is(".") {
                self.lexer.consume()?;
                let name = self.lexer.take()?;
                expr = self.build_member(expr, name, false)?;
            } else if self.lexer.is("->") {
                self.lexer.consume()?;
                let name = self.lexer.take()?;
                expr = self.build_member(expr, name, true)?;
            } else if self.lexer.is("++") || self.lexer.is("--") {
                let token = self.lexer.take()?;
                if !expr.is_lvalue() || !expr.ty.is_scalar() {
                    return Err(CompileError::semantic(
                        "operand of '++'/'--' must be a scalar lvalue",
                        &token,
                    ));
                }
                let op = if token.text == "++" { IncDec::Inc } else { IncDec::Dec };
                let ty = Type::unqualified(&expr.ty);
                expr = Expr::new(
                    ExprKind::PostIncDec {
                        op,
                        target: Box::new(expr),
                    },
                    ty,
                    token,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn build_call(&mut self, callee: Expr, token: Rc<Token>) -> Result<Expr, CompileError> {
        let callee = callee.decay();
        let sig = callee.ty.signature().ok_or_else(|| {
            CompileError::semantic("called object is not a function", &token)
        })?;

        let mut args = Vec::new();
        if !self.lexer.accept(")")? {
            loop {
                let arg = self.parse_assignment()?.decay();
                args.push(arg);
                if !self.lexer.accept(",")? {
                    self.lexer.expect(")", "expected ')' after arguments")?;
                    break;
                }
            }
        }

        if args.len() < sig.params.len() {
            return Err(CompileError::semantic(
                format!(
                    "too few arguments: expected {}, got {}",
                    sig.params.len(),
                    args.len()
                ),
                &token,
            ));
        }
        if args.len() > sig.params.len() && !sig.variadic {
            return Err(CompileError::semantic(
                format!(
                    "too many arguments: expected {}, got {}",
                    sig.params.len(),
                    args.len()
                ),
                &token,
            ));
        }

        let mut converted = Vec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            if i < sig.params.len() {
                converted.push(self.assign_convert(arg, &sig.params[i].ty)?);
            } else {
                // Default argument promotions for the variadic tail.
                let arg = if Type::compatible_unqual(&arg.ty, &Type::base(Base::Float)) {
                    arg.cast_to(Type::double_type())
                } else if arg.ty.is_integer() {
                    arg.promote()
                } else {
                    arg
                };
                converted.push(arg);
            }
        }

        let ty = Rc::clone(&sig.ret);
        Ok(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args: converted,
            },
            ty,
            token,
        ))
    }

    /// `a[i]` is `*(a + i)` after the usual decay.
    fn build_subscript(
        &mut self,
        base: Expr,
        index: Expr,
        token: Rc<Token>,
    ) -> Result<Expr, CompileError> {
        let base = base.decay();
        let index = index.decay();
        let (pointer, offset) = if base.ty.is_pointer() && index.ty.is_integer() {
            (base, index)
        } else if index.ty.is_pointer() && base.ty.is_integer() {
            (index, base)
        } else {
            return Err(CompileError::semantic(
                "subscripted value is not a pointer",
                &token,
            ));
        };
        self.check_pointee_size(&pointer.ty, &token)?;
        let pointee = pointer.ty.pointee().unwrap();
        let ptr_ty = Rc::clone(&pointer.ty);
        let sum = Expr::new(
            ExprKind::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(pointer),
                rhs: Box::new(offset.promote()),
            },
            ptr_ty,
            Rc::clone(&token),
        );
        Ok(Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand: Box::new(sum),
            },
            pointee,
            token,
        ))
    }

    fn build_member(
        &mut self,
        base: Expr,
        name: Rc<Token>,
        through_pointer: bool,
    ) -> Result<Expr, CompileError> {
        if !name.is_identifier() {
            return Err(CompileError::parse("expected a member name", &name));
        }
        let base = if through_pointer {
            let base = base.decay();
            let pointee = base.ty.pointee().ok_or_else(|| {
                CompileError::semantic("'->' requires a pointer to a struct or union", &name)
            })?;
            Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Deref,
                    operand: Box::new(base),
                },
                pointee,
                Rc::clone(&name),
            )
        } else {
            base
        };

        let record = base.ty.as_record().ok_or_else(|| {
            CompileError::semantic(
                "member access on something that is not a struct or union",
                &name,
            )
        })?;
        if !record.is_defined() {
            return Err(CompileError::semantic(
                format!("member access on incomplete {}", record.kind_name()),
                &name,
            ));
        }
        let (member_ty, offset) = record.find(&name.text).ok_or_else(|| {
            CompileError::semantic(
                format!("no member named '{}' in {}", name.text, record.kind_name()),
                &name,
            )
        })?;
        Ok(Expr::new(
            ExprKind::Member {
                base: Box::new(base),
                name: name.text.clone(),
                offset,
            },
            member_ty,
            name,
        ))
    }

    // ------------------------------------------------------------------
    // Primary expressions
    // ------------------------------------------------------------------

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.current().kind {
            TokenKind::Number => {
                let token = self.lexer.take()?;
                self.parse_number_token(token)
            }
            TokenKind::Character => {
                let token = self.lexer.take()?;
                self.parse_character_token(token)
            }
            TokenKind::String => self.parse_string_literal(),
            TokenKind::Alphanumeric => {
                if is_keyword(&self.current().text) {
                    return Err(self.parse_error("expected an expression"));
                }
                let token = self.lexer.take()?;
                self.resolve_identifier(token)
            }
            TokenKind::Punctuation if self.lexer.is("(") => {
                let open = self.lexer.take()?;
                if self.lexer.is("{") {
                    return self.parse_statement_expression(open);
                }
                let expr = self.parse_expr()?;
                self.lexer.expect(")", "expected ')'")?;
                Ok(expr)
            }
            _ => Err(self.parse_error("expected an expression")),
        }
    }

    fn resolve_identifier(&mut self, token: Rc<Token>) -> Result<Expr, CompileError> {
        if let Some(symbol) = self.scopes.find_symbol(&token.text, true) {
            return match symbol.kind {
                SymbolKind::EnumConstant(value) => Ok(Expr::new(
                    ExprKind::Int(i64::from(value)),
                    Type::int(),
                    token,
                )),
                SymbolKind::Builtin(builtin) => self.parse_builtin(builtin, token),
                SymbolKind::Typedef => Err(CompileError::parse(
                    format!("unexpected type name '{}'", token.text),
                    &token,
                )),
                _ => {
                    let ty = symbol.ty();
                    Ok(Expr::new(ExprKind::Sym(symbol), ty, token))
                }
            };
        }

        // Implicit function declaration: a call to an undeclared name.
        if self.lexer.is("(") {
            if !self.options.dialect.allows_implicit_functions() {
                return Err(CompileError::semantic(
                    format!("implicit declaration of function '{}'", token.text),
                    &token,
                ));
            }
            self.warn(
                WarningSet::IMPLICIT_FUNCTION,
                &token,
                &format!("implicit declaration of function '{}'", token.text),
            );
            let ty = Type::function(Type::int(), Vec::new(), true)
                .expect("int(...) is a valid function type");
            let symbol = Symbol::new(
                SymbolKind::Function,
                token.text.clone(),
                Rc::clone(&ty),
                Some(Rc::clone(&token)),
            );
            symbol.set_linkage(Linkage::External);
            self.scopes.add_global_symbol(Rc::clone(&symbol));
            return Ok(Expr::new(ExprKind::Sym(symbol), ty, token));
        }

        Err(CompileError::semantic(
            format!("'{}' is not declared", token.text),
            &token,
        ))
    }

    fn parse_builtin(&mut self, builtin: Builtin, token: Rc<Token>) -> Result<Expr, CompileError> {
        if builtin == Builtin::FuncName {
            let name = self.current_function_name().ok_or_else(|| {
                CompileError::semantic("__func__ outside a function", &token)
            })?;
            let ty = Type::array(Type::char_type(), name.len() as u32 + 1)
                .expect("char array is a valid type");
            return Ok(Expr::new(ExprKind::FuncName(name), ty, token));
        }

        self.lexer.expect("(", "expected '(' after builtin")?;
        let expr = match builtin {
            Builtin::VaStart => {
                let variadic = self.fn_ctx.as_ref().is_some_and(|ctx| ctx.variadic);
                if !variadic {
                    return Err(CompileError::semantic(
                        "va_start in a function that is not variadic",
                        &token,
                    ));
                }
                let ap_expr = self.parse_assignment()?;
                let ap = self.require_lvalue(ap_expr, &token)?;
                if self.lexer.accept(",")? {
                    // The last named parameter; unused, the frame layout
                    // pins the variadic area.
                    let _ = self.parse_assignment()?;
                }
                Expr::new(ExprKind::VaStart { ap: Box::new(ap) }, Type::void(), token)
            }
            Builtin::VaArg => {
                let ap_expr = self.parse_assignment()?;
                let ap = self.require_lvalue(ap_expr, &token)?;
                self.lexer.expect(",", "expected ',' in va_arg")?;
                let ty = self.parse_typename()?;
                ty.size().map_err(|e| e.at(&token))?;
                Expr::new(ExprKind::VaArg { ap: Box::new(ap) }, ty, token)
            }
            Builtin::VaEnd => {
                let ap_expr = self.parse_assignment()?;
                let ap = self.require_lvalue(ap_expr, &token)?;
                Expr::new(ExprKind::VaEnd { ap: Box::new(ap) }, Type::void(), token)
            }
            Builtin::VaCopy => {
                let dst_expr = self.parse_assignment()?;
                let dst = self.require_lvalue(dst_expr, &token)?;
                self.lexer.expect(",", "expected ',' in va_copy")?;
                let src = self.parse_assignment()?;
                Expr::new(
                    ExprKind::VaCopy {
                        dst: Box::new(dst),
                        src: Box::new(src),
                    },
                    Type::void(),
                    token,
                )
            }
            Builtin::FuncName => unreachable!("handled above"),
        };
        self.lexer.expect(")", "expected ')' after builtin arguments")?;
        Ok(expr)
    }

    fn require_lvalue(&self, expr: Expr, token: &Rc<Token>) -> Result<Expr, CompileError> {
        if !expr.is_lvalue() {
            return Err(CompileError::semantic(
                "builtin argument must be an lvalue",
                token,
            ));
        }
        Ok(expr)
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    /// A string literal, with adjacent literals concatenated.
    pub(super) fn parse_string_literal(&mut self) -> Result<Expr, CompileError> {
        let first = self.lexer.take()?;
        if let Some(prefix) = &first.prefix {
            return Err(CompileError::unsupported(
                format!("string literal prefix '{}' is not supported", prefix),
                &first,
            ));
        }
        let mut bytes = lexer::decode_escapes(&first.text, &first)?;
        while self.current().kind == TokenKind::String {
            let more = self.lexer.take()?;
            if let Some(prefix) = &more.prefix {
                return Err(CompileError::unsupported(
                    format!("string literal prefix '{}' is not supported", prefix),
                    &more,
                ));
            }
            bytes.extend(lexer::decode_escapes(&more.text, &more)?);
        }
        let ty = Type::array(Type::char_type(), bytes.len() as u32 + 1)
            .expect("char array is a valid type");
        Ok(Expr::new(ExprKind::Str(bytes), ty, first))
    }

    fn parse_character_token(&mut self, token: Rc<Token>) -> Result<Expr, CompileError> {
        if let Some(prefix) = &token.prefix {
            return Err(CompileError::unsupported(
                format!("character literal prefix '{}' is not supported", prefix),
                &token,
            ));
        }
        let bytes = lexer::decode_escapes(&token.text, &token)?;
        if bytes.len() != 1 {
            return Err(CompileError::parse(
                "character literal must be exactly one byte",
                &token,
            ));
        }
        // Plain char is signed on this target.
        let value = i64::from(bytes[0] as i8);
        Ok(Expr::new(ExprKind::Int(value), Type::int(), token))
    }

    fn parse_number_token(&mut self, token: Rc<Token>) -> Result<Expr, CompileError> {
        let text = token.text.as_str();
        let is_hex = text.starts_with("0x") || text.starts_with("0X");

        if is_hex && text.contains(['.', 'p', 'P']) {
            return Err(CompileError::unsupported(
                "hexadecimal floating constants are not supported",
                &token,
            ));
        }
        if !is_hex && (text.contains('.') || text.contains(['e', 'E'])) {
            return self.parse_float_token(token);
        }

        let (digits, radix) = if is_hex {
            (&text[2..], 16u32)
        } else if text.len() > 1 && text.starts_with('0') {
            (&text[1..], 8u32)
        } else {
            (text, 10u32)
        };

        // Split trailing length/sign suffix from the digits.
        let split = digits
            .find(|c: char| !c.is_digit(radix))
            .unwrap_or(digits.len());
        let (digits, suffix) = digits.split_at(split);
        if digits.is_empty() && radix != 8 {
            return Err(CompileError::parse("malformed number", &token));
        }

        let (unsigned, longs) = match suffix.to_ascii_lowercase().as_str() {
            "" => (false, 0),
            "u" => (true, 0),
            "l" => (false, 1),
            "ul" | "lu" => (true, 1),
            "ll" => (false, 2),
            "ull" | "llu" => (true, 2),
            _ => return Err(CompileError::parse("malformed number suffix", &token)),
        };

        let mut value: u64 = 0;
        for c in digits.chars() {
            let digit = c.to_digit(radix).ok_or_else(|| {
                CompileError::parse(format!("invalid digit '{}' in number", c), &token)
            })?;
            value = value
                .checked_mul(u64::from(radix))
                .and_then(|v| v.checked_add(u64::from(digit)))
                .ok_or_else(|| {
                    CompileError::parse("integer constant is too large", &token)
                })?;
        }

        let ty = integer_literal_type(value, radix == 10, unsigned, longs)
            .ok_or_else(|| CompileError::parse("integer constant is too large", &token))?;
        Ok(Expr::new(ExprKind::Int(value as i64), ty, token))
    }

    fn parse_float_token(&mut self, token: Rc<Token>) -> Result<Expr, CompileError> {
        let text = token.text.as_str();
        let (digits, base) = match text.chars().last() {
            Some('f') | Some('F') => (&text[..text.len() - 1], Base::Float),
            Some('l') | Some('L') => (&text[..text.len() - 1], Base::LongDouble),
            _ => (text, Base::Double),
        };
        let value: f64 = digits
            .parse()
            .map_err(|_| CompileError::parse("malformed floating constant", &token))?;
        Ok(Expr::new(ExprKind::Float(value), Type::base(base), token))
    }

    // ------------------------------------------------------------------
    // Conversions for assignment contexts
    // ------------------------------------------------------------------

    /// Convert `expr` for assignment/initialisation/argument passing to
    /// `target`. Decay has already happened.
    pub(super) fn assign_convert(
        &mut self,
        expr: Expr,
        target: &Rc<Type>,
    ) -> Result<Expr, CompileError> {
        if Type::compatible_unqual(&expr.ty, target) {
            return Ok(expr);
        }
        if target.is_bool() {
            if !expr.ty.is_scalar() {
                return Err(CompileError::semantic(
                    "cannot convert to _Bool",
                    &expr.token,
                ));
            }
            return Ok(expr.cast_to(Rc::clone(target)));
        }
        if target.is_arithmetic() && expr.ty.is_arithmetic() {
            if expr.ty.is_floating() && target.is_integer() {
                self.warn(
                    WarningSet::FLOAT_TO_INT,
                    &expr.token,
                    &format!(
                        "implicit conversion from '{}' to '{}' truncates; cast to silence",
                        expr.ty, target
                    ),
                );
            }
            return Ok(expr.cast_to(Rc::clone(target)));
        }
        if target.is_pointer() && (expr.ty.is_pointer() || expr.ty.is_integer()) {
            return Ok(expr.cast_to(Rc::clone(target)));
        }
        if target.is_integer() && expr.ty.is_pointer() {
            return Ok(expr.cast_to(Rc::clone(target)));
        }
        Err(CompileError::semantic(
            format!("incompatible types: cannot convert '{}' to '{}'", expr.ty, target),
            &expr.token,
        ))
    }

    /// Constant expression contexts: case labels, enumerators, array
    /// bounds, bit-field widths.
    pub(super) fn parse_const_expr(&mut self) -> Result<i64, CompileError> {
        let expr = self.parse_conditional()?;
        expr.const_int_value()
    }
}

/// The common type of two promoted integer operands.
fn common_integer_type(a: &Rc<Type>, b: &Rc<Type>) -> Rc<Type> {
    let (ra, rb) = (a.integer_rank(), b.integer_rank());
    if ra == rb {
        if a.is_signed() == b.is_signed() {
            return Rc::clone(a);
        }
        // Equal rank, mixed signedness: unsigned wins.
        return unsigned_version(a);
    }
    let (high, low) = if ra > rb { (a, b) } else { (b, a) };
    if high.is_signed() && !low.is_signed() {
        let high_size = high.size().unwrap_or(4);
        let low_size = low.size().unwrap_or(4);
        if high_size == low_size {
            // The signed type cannot represent the unsigned one.
            return unsigned_version(high);
        }
    }
    Rc::clone(high)
}

fn unsigned_version(ty: &Rc<Type>) -> Rc<Type> {
    let base = match &**ty {
        Type::Base { base, .. } => base.clone(),
        _ => return Rc::clone(ty),
    };
    let unsigned = match base {
        Base::Int => Base::UInt,
        Base::Long => Base::ULong,
        Base::LongLong => Base::ULongLong,
        other => other,
    };
    Type::base(unsigned)
}

/// For `++`/`--` and compound assignment on integers: the type the
/// computation happens in.
fn common_arithmetic_with_int(ty: &Rc<Type>) -> Rc<Type> {
    if ty.is_floating() {
        return Rc::clone(ty);
    }
    common_integer_type(&ty.promoted(), &Type::int())
}

/// Pick the first type in the C literal chain that can represent `value`.
fn integer_literal_type(value: u64, decimal: bool, unsigned: bool, longs: u32) -> Option<Rc<Type>> {
    // (base, max value, minimum suffix rank, is unsigned)
    let chain: [(Base, u64, u32, bool); 6] = [
        (Base::Int, i32::MAX as u64, 0, false),
        (Base::UInt, u32::MAX as u64, 0, true),
        (Base::Long, i32::MAX as u64, 1, false),
        (Base::ULong, u32::MAX as u64, 1, true),
        (Base::LongLong, i64::MAX as u64, 2, false),
        (Base::ULongLong, u64::MAX, 2, true),
    ];
    for (base, max, rank_longs, candidate_unsigned) in chain {
        if rank_longs < longs {
            continue;
        }
        if unsigned != candidate_unsigned {
            // A `u` suffix forces unsigned; unsuffixed decimal constants
            // never become unsigned, while octal and hex ones may.
            if unsigned || decimal || !candidate_unsigned {
                continue;
            }
        }
        if value <= max {
            return Some(Type::base(base));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TranslationUnit;
    use crate::config::Options;

    fn parse(source: &str) -> Result<TranslationUnit, CompileError> {
        let parser = Parser::new(source.as_bytes().to_vec(), "test.i", Options::default())?;
        parser.parse_unit()
    }

    /// Assert a constant expression's value by making the wrong value an
    /// invalid (zero-sized is fine, negative is not) array bound.
    fn assert_const(expr: &str, expected: i64) {
        let source = format!("int probe[({}) == ({}) ? 1 : -1];", expr, expected);
        assert!(parse(&source).is_ok(), "({}) != {}", expr, expected);
    }

    #[test]
    fn test_integer_literal_types() {
        assert!(Type::equal(
            &integer_literal_type(1, true, false, 0).unwrap(),
            &Type::int()
        ));
        assert!(Type::equal(
            &integer_literal_type(0x8000_0000, false, false, 0).unwrap(),
            &Type::uint()
        ));
        // Decimal constants skip unsigned types.
        assert!(Type::equal(
            &integer_literal_type(0x8000_0000, true, false, 0).unwrap(),
            &Type::base(Base::LongLong)
        ));
        assert!(Type::equal(
            &integer_literal_type(5, true, true, 0).unwrap(),
            &Type::uint()
        ));
        assert!(Type::equal(
            &integer_literal_type(5, true, false, 2).unwrap(),
            &Type::base(Base::LongLong)
        ));
        assert!(integer_literal_type(u64::MAX, true, false, 0).is_none());
    }

    #[test]
    fn test_common_integer_type_prefers_unsigned_at_equal_rank() {
        let t = common_integer_type(&Type::int(), &Type::uint());
        assert!(Type::equal(&t, &Type::uint()));
    }

    #[test]
    fn test_common_integer_type_same_size_unsigned_wins() {
        // long is 4 bytes here, so long + unsigned int -> unsigned long.
        let t = common_integer_type(&Type::base(Base::Long), &Type::uint());
        assert!(Type::equal(&t, &Type::base(Base::ULong)));
        // long long represents all of unsigned int, so it wins.
        let t = common_integer_type(&Type::base(Base::LongLong), &Type::uint());
        assert!(Type::equal(&t, &Type::base(Base::LongLong)));
    }

    #[test]
    fn test_signed_unsigned_comparison_is_unsigned() {
        // (-1 > 0u) is 1 because -1 converts to UINT_MAX.
        let unit = parse("enum R { V = (-1 > 0u) };").unwrap();
        let _ = unit;
        let source = "int a[(-1 > 0u) ? 1 : 9]; int check[sizeof(a) == 4 ? 1 : 9];";
        assert!(parse(source).is_ok());
    }

    #[test]
    fn test_conditional_constant_folding() {
        assert!(parse("int a[1 ? 2 : 3]; int check[sizeof(a) == 8 ? 1 : 9];").is_ok());
    }

    #[test]
    fn test_signed_right_shift_constant() {
        assert!(parse("int check[((-8 >> 2) == -2) ? 1 : 9];").is_ok());
    }

    #[test]
    fn test_division_by_zero_in_constant_rejected() {
        assert!(parse("int a[1 / 0];").is_err());
    }

    #[test]
    fn test_sizeof_expressions() {
        assert!(parse("int a[4]; int check[sizeof(a) == 16 ? 1 : 9];").is_ok());
        assert!(parse("int a[4]; int check[sizeof a == 16 ? 1 : 9];").is_ok());
        // sizeof does not decay its operand.
        assert!(parse("char s[3]; int check[sizeof(s) == 3 ? 1 : 9];").is_ok());
        assert!(parse("int check[sizeof(int*) == 4 ? 1 : 9];").is_ok());
        assert!(parse("int check[sizeof(long long) == 8 ? 1 : 9];").is_ok());
    }

    #[test]
    fn test_string_concatenation() {
        let unit = parse("char s[] = \"ab\" \"cd\";").unwrap();
        assert_eq!(unit.globals[0].symbol.ty().size().unwrap(), 5);
    }

    #[test]
    fn test_char_literal_value() {
        assert!(parse("int check[('A' == 65) ? 1 : 9];").is_ok());
        assert!(parse("int check[('\\n' == 10) ? 1 : 9];").is_ok());
        assert!(parse("char c = 'ab';").is_err());
    }

    #[test]
    fn test_wide_literal_rejected() {
        assert!(parse("char c = L'a';").is_err());
        assert!(parse("char *s = L\"abc\";").is_err());
    }

    #[test]
    fn test_call_argument_checking() {
        assert!(parse("int f(int, int); int g(void) { return f(1); }").is_err());
        assert!(parse("int f(int); int g(void) { return f(1, 2); }").is_err());
        assert!(parse("int f(int, ...); int g(void) { return f(1, 2, 3); }").is_ok());
    }

    #[test]
    fn test_implicit_function_declaration_by_dialect() {
        // The default gnu dialect accepts it with a warning.
        assert!(parse("int main(void) { return undeclared_fn(); }").is_ok());
        // Strict c99 rejects it.
        let options = Options::default().with_dialect(crate::config::Dialect::C99);
        let parser = Parser::new(
            b"int main(void) { return undeclared_fn(); }".to_vec(),
            "test.i",
            options,
        )
        .unwrap();
        assert!(parser.parse_unit().is_err());
    }

    #[test]
    fn test_assignment_requires_lvalue() {
        assert!(parse("int main(void) { 3 = 4; return 0; }").is_err());
        assert!(parse("int main(void) { int x; (x + 1)++; return 0; }").is_err());
    }

    #[test]
    fn test_address_of_rvalue_rejected() {
        assert!(parse("int main(void) { int *p = &3; return 0; }").is_err());
    }

    #[test]
    fn test_va_builtins_need_variadic_function() {
        let source = r#"
            typedef char *va_list;
            int sum(int n, ...) {
                va_list ap;
                __builtin_va_start(ap, n);
                int total = __builtin_va_arg(ap, int);
                __builtin_va_end(ap);
                return total;
            }
        "#;
        assert!(parse(source).is_ok());
        let bad = r#"
            typedef char *va_list;
            int f(int n) { va_list ap; __builtin_va_start(ap, n); return 0; }
        "#;
        assert!(parse(bad).is_err());
    }

    #[test]
    fn test_func_name_builtin() {
        assert!(parse("int main(void) { return sizeof(__func__) == 5 ? 0 : 1; }").is_ok());
    }

    #[test]
    fn test_constant_arithmetic_values() {
        assert_const("1 + 2 * 3", 7);
        assert_const("(2 + 3) * 4", 20);
        assert_const("-8 >> 2", -2);
        assert_const("7 / 2", 3);
        assert_const("7 % 3", 1);
        assert_const("~0 & 0xff", 255);
        assert_const("1 << 10", 1024);
        assert_const("'a'", 97);
        assert_const("(char)300", 44);
        assert_const("(unsigned char)300", 44);
        assert_const("!5", 0);
        assert_const("5 || 0", 1);
        assert_const("0 && 1", 0);
    }
}
