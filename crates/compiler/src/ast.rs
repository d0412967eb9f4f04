//! Typed abstract syntax tree.
//!
//! Every expression node carries its final C type and the token it was
//! parsed from; the parser applies promotions, conversions, and decay while
//! building the tree, so the code generator never recomputes types.
//!
//! Subscripts and `->` are desugared during parsing: `a[i]` becomes
//! `*(a + i)` and `p->f` becomes `(*p).f`.

use std::rc::Rc;

use crate::lexer::Token;
use crate::scope::Symbol;
use crate::strings::Name;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement `~`.
    Complement,
    /// Logical `!`; result is 0 or 1.
    LogicalNot,
    /// Pointer dereference `*`.
    Deref,
    /// Address-of `&`.
    AddressOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDec {
    Inc,
    Dec,
}

pub enum ExprKind {
    /// Integer constant; the node type gives its width and signedness.
    Int(i64),
    /// Floating constant; the node type distinguishes float and double.
    Float(f64),
    /// String literal bytes, without the terminating NUL.
    Str(Vec<u8>),
    /// Reference to a declared symbol.
    Sym(Rc<Symbol>),
    /// `__func__`: the enclosing function's name as a string constant.
    FuncName(Name),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Logical `&&` / `||`, kept apart from Binary because they
    /// short-circuit.
    Logical {
        and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Simple or compound assignment; `op` is the compound operator, if any.
    Assign {
        op: Option<BinaryOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// Postfix `++` / `--`; the value is the operand before the update.
    PostIncDec {
        op: IncDec,
        target: Box<Expr>,
    },
    /// Member access on an lvalue or struct-valued expression. The offset
    /// is resolved at parse time; `->` has already been desugared through
    /// a dereference.
    Member {
        base: Box<Expr>,
        name: Name,
        offset: u32,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Implicit or explicit conversion to the node type.
    Cast(Box<Expr>),
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Comma {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// GNU statement expression `({ ... })`. The value is the last
    /// expression statement, if the node type is non-void.
    StmtExpr(Vec<Stmt>),
    VaStart {
        ap: Box<Expr>,
    },
    VaArg {
        ap: Box<Expr>,
    },
    VaEnd {
        ap: Box<Expr>,
    },
    VaCopy {
        dst: Box<Expr>,
        src: Box<Expr>,
    },
}

pub struct Expr {
    pub kind: ExprKind,
    pub ty: Rc<Type>,
    pub token: Rc<Token>,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Rc<Type>, token: Rc<Token>) -> Expr {
        Expr { kind, ty, token }
    }

    /// Wrap in a cast node unless the type already matches.
    pub fn cast_to(self, ty: Rc<Type>) -> Expr {
        if Type::equal(&self.ty, &ty) {
            return self;
        }
        let token = Rc::clone(&self.token);
        Expr::new(ExprKind::Cast(Box::new(self)), ty, token)
    }

    /// Integer promotion: wrap in a cast to int if narrower.
    pub fn promote(self) -> Expr {
        let promoted = self.ty.promoted();
        self.cast_to(promoted)
    }

    /// Array-to-pointer and function-to-pointer decay. Other types pass
    /// through unchanged.
    pub fn decay(self) -> Expr {
        if let Some(element) = self.ty.element() {
            let ptr = Type::pointer(element);
            let token = Rc::clone(&self.token);
            return Expr::new(ExprKind::Cast(Box::new(self)), ptr, token);
        }
        if self.ty.is_function() {
            let ptr = Type::pointer(Rc::clone(&self.ty));
            let token = Rc::clone(&self.token);
            return Expr::new(ExprKind::Cast(Box::new(self)), ptr, token);
        }
        self
    }

    /// Condition position (if/while/for/?:/&&/||): collapse to 0-or-1 by
    /// casting to _Bool.
    pub fn to_predicate(self) -> Expr {
        self.cast_to(Type::bool_type())
    }

    /// Does this expression designate a storage location?
    pub fn is_lvalue(&self) -> bool {
        match &self.kind {
            ExprKind::Sym(symbol) => !symbol.ty().is_function(),
            ExprKind::Unary {
                op: UnaryOp::Deref, ..
            } => true,
            ExprKind::Member { base, .. } => base.is_lvalue(),
            ExprKind::Str(_) => true,
            ExprKind::FuncName(_) => true,
            _ => false,
        }
    }

    /// An integer constant expression with value 0 (a null pointer
    /// constant once converted).
    pub fn is_zero_constant(&self) -> bool {
        matches!(self.kind, ExprKind::Int(0))
    }

    /// Evaluate an integer constant expression.
    ///
    /// Supported: integer and character constants, enum constants, integer
    /// casts, unary and binary integer operators, and the conditional
    /// operator. Anything else is not a constant expression.
    pub fn const_int_value(&self) -> Result<i64, crate::error::CompileError> {
        use crate::error::CompileError;
        let fail = || {
            CompileError::semantic("expression is not an integer constant", &self.token)
        };
        match &self.kind {
            ExprKind::Int(value) => Ok(*value),
            ExprKind::Sym(symbol) => symbol.enum_value().map(i64::from).ok_or_else(fail),
            ExprKind::Cast(operand) => {
                if !self.ty.is_integer() {
                    return Err(fail());
                }
                // A floating constant cast to an integer type truncates.
                let value = match &operand.kind {
                    ExprKind::Float(f) => *f as i64,
                    _ => operand.const_int_value()?,
                };
                if self.ty.is_bool() {
                    return Ok(i64::from(value != 0));
                }
                Ok(truncate_to_type(value, &self.ty))
            }
            ExprKind::Unary { op, operand } => {
                let value = operand.const_int_value()?;
                match op {
                    UnaryOp::Neg => Ok(value.wrapping_neg()),
                    UnaryOp::Complement => Ok(!value),
                    UnaryOp::LogicalNot => Ok(i64::from(value == 0)),
                    _ => Err(fail()),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = lhs.const_int_value()?;
                let b = rhs.const_int_value()?;
                let unsigned = !lhs.ty.is_signed() || !rhs.ty.is_signed();
                let value = match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div => {
                        if b == 0 {
                            return Err(CompileError::semantic(
                                "division by zero in constant expression",
                                &self.token,
                            ));
                        }
                        if unsigned {
                            ((a as u64) / (b as u64)) as i64
                        } else {
                            a.wrapping_div(b)
                        }
                    }
                    BinaryOp::Mod => {
                        if b == 0 {
                            return Err(CompileError::semantic(
                                "division by zero in constant expression",
                                &self.token,
                            ));
                        }
                        if unsigned {
                            ((a as u64) % (b as u64)) as i64
                        } else {
                            a.wrapping_rem(b)
                        }
                    }
                    BinaryOp::Shl => a.wrapping_shl(b as u32),
                    BinaryOp::Shr => {
                        if lhs.ty.is_signed() {
                            a.wrapping_shr(b as u32)
                        } else {
                            ((a as u64).wrapping_shr(b as u32)) as i64
                        }
                    }
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    BinaryOp::BitXor => a ^ b,
                    BinaryOp::Eq => i64::from(a == b),
                    BinaryOp::Ne => i64::from(a != b),
                    BinaryOp::Lt => {
                        i64::from(if unsigned { (a as u64) < (b as u64) } else { a < b })
                    }
                    BinaryOp::Gt => {
                        i64::from(if unsigned { (a as u64) > (b as u64) } else { a > b })
                    }
                    BinaryOp::Le => {
                        i64::from(if unsigned { (a as u64) <= (b as u64) } else { a <= b })
                    }
                    BinaryOp::Ge => {
                        i64::from(if unsigned { (a as u64) >= (b as u64) } else { a >= b })
                    }
                };
                Ok(truncate_to_type(value, &self.ty))
            }
            ExprKind::Logical { and, lhs, rhs } => {
                let a = lhs.const_int_value()? != 0;
                if *and {
                    if !a {
                        return Ok(0);
                    }
                    Ok(i64::from(rhs.const_int_value()? != 0))
                } else {
                    if a {
                        return Ok(1);
                    }
                    Ok(i64::from(rhs.const_int_value()? != 0))
                }
            }
            ExprKind::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                if cond.const_int_value()? != 0 {
                    then_expr.const_int_value()
                } else {
                    else_expr.const_int_value()
                }
            }
            _ => Err(fail()),
        }
    }
}

/// Reduce a constant to the range of an integer type.
fn truncate_to_type(value: i64, ty: &Rc<Type>) -> i64 {
    let size = match ty.size() {
        Ok(size) => size,
        Err(_) => return value,
    };
    match (size, ty.is_signed()) {
        (1, true) => value as i8 as i64,
        (1, false) => value as u8 as i64,
        (2, true) => value as i16 as i64,
        (2, false) => value as u16 as i64,
        (4, true) => value as i32 as i64,
        (4, false) => value as u32 as i64,
        _ => value,
    }
}

/// An initialiser: a single expression, a braced list, or (for char
/// arrays) a string literal carried as a scalar.
pub enum Init {
    Scalar(Expr),
    List(Vec<Init>),
}

pub enum Stmt {
    Expr(Expr),
    /// Automatic-storage local declaration. Static locals and block-scope
    /// externs do not produce statements; they surface as globals.
    Decl {
        symbol: Rc<Symbol>,
        init: Option<Init>,
        token: Rc<Token>,
    },
    If {
        cond: Expr,
        then_body: Box<Stmt>,
        else_body: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    /// The case list is collected at parse time; each entry pairs the case
    /// value with a synthesised label id. `default` is a label id too.
    Switch {
        cond: Expr,
        cases: Vec<(i64, u32)>,
        default: Option<u32>,
        body: Box<Stmt>,
    },
    Case {
        label: u32,
        body: Box<Stmt>,
    },
    Default {
        label: u32,
        body: Box<Stmt>,
    },
    Break {
        token: Rc<Token>,
    },
    Continue {
        token: Rc<Token>,
    },
    Goto {
        name: Name,
        token: Rc<Token>,
    },
    Labeled {
        name: Name,
        body: Box<Stmt>,
    },
    Return {
        value: Option<Expr>,
        token: Rc<Token>,
    },
    Block(Vec<Stmt>),
    Empty,
}

/// A file-scope object with storage: an initialised or tentative global,
/// or a static local hoisted out of its function.
pub struct Global {
    pub symbol: Rc<Symbol>,
    pub init: Option<Init>,
    pub token: Rc<Token>,
}

pub struct Function {
    pub symbol: Rc<Symbol>,
    pub params: Vec<Rc<Symbol>>,
    pub body: Vec<Stmt>,
    /// Number of labels the parser synthesised (case/default labels); the
    /// code generator numbers its own labels after these.
    pub label_count: u32,
    pub token: Rc<Token>,
}

/// One parsed translation unit, in emission order: globals as declared,
/// then functions.
#[derive(Default)]
pub struct TranslationUnit {
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl TranslationUnit {
    pub fn new() -> Self {
        TranslationUnit::default()
    }

    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.symbol.name == *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{Lexer, TokenKind};
    use crate::scope::SymbolKind;
    use crate::strings::Interner;

    fn token() -> Rc<Token> {
        let interner = Rc::new(Interner::new());
        let mut lexer = Lexer::new(b"x".to_vec(), "t.i", interner).unwrap();
        lexer.take().unwrap()
    }

    fn int_expr(value: i64) -> Expr {
        Expr::new(ExprKind::Int(value), Type::int(), token())
    }

    #[test]
    fn test_cast_to_same_type_is_identity() {
        let e = int_expr(1).cast_to(Type::int());
        assert!(matches!(e.kind, ExprKind::Int(1)));
    }

    #[test]
    fn test_cast_to_other_type_wraps() {
        let e = int_expr(1).cast_to(Type::char_type());
        assert!(matches!(e.kind, ExprKind::Cast(_)));
        assert!(Type::equal(&e.ty, &Type::char_type()));
    }

    #[test]
    fn test_promote_narrow_type() {
        let c = Expr::new(ExprKind::Int(7), Type::char_type(), token());
        let p = c.promote();
        assert!(Type::equal(&p.ty, &Type::int()));
        assert!(matches!(p.kind, ExprKind::Cast(_)));
    }

    #[test]
    fn test_array_decay() {
        let arr_ty = Type::array(Type::int(), 4).unwrap();
        let interner = Interner::new();
        let sym = Symbol::new(SymbolKind::Variable, interner.intern("a"), Rc::clone(&arr_ty), None);
        let e = Expr::new(ExprKind::Sym(sym), arr_ty, token()).decay();
        assert!(e.ty.is_pointer());
        assert!(Type::equal(&e.ty.pointee().unwrap(), &Type::int()));
    }

    #[test]
    fn test_non_array_decay_is_identity() {
        let e = int_expr(3).decay();
        assert!(matches!(e.kind, ExprKind::Int(3)));
    }

    #[test]
    fn test_lvalue_detection() {
        let interner = Interner::new();
        let sym = Symbol::new(SymbolKind::Variable, interner.intern("x"), Type::int(), None);
        let var = Expr::new(ExprKind::Sym(sym), Type::int(), token());
        assert!(var.is_lvalue());
        assert!(!int_expr(0).is_lvalue());

        let deref = Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand: Box::new(int_expr(0)),
            },
            Type::int(),
            token(),
        );
        assert!(deref.is_lvalue());
    }

    #[test]
    fn test_predicate_is_bool() {
        let p = int_expr(5).to_predicate();
        assert!(p.ty.is_bool());
    }

    #[test]
    fn test_token_kind_reexport_sanity() {
        // Tokens flow into AST nodes unchanged.
        let t = token();
        assert_eq!(t.kind, TokenKind::Alphanumeric);
    }
}
