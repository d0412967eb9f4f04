//! Type representation.
//!
//! A type is either a base type (primitive, record, or enum) with optional
//! const/volatile qualification, or a declarator (pointer, array,
//! indeterminate array, function) wrapping a referenced type. Declarators
//! chain from the outermost wrapper inward, so `int *a[3]` is
//! Array(Pointer(Int), 3).
//!
//! Target model: 32-bit words. char is 1 byte, short 2, int/long/pointers
//! and enums 4, long long and both double types 8, float 4. Alignment is
//! natural, capped at the 4-byte word size.
//!
//! Every declaration constructs fresh `Rc<Type>` nodes; sharing happens
//! through the `Rc`, not through a cache.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{CompileError, ErrorKind};
use crate::records::{EnumDef, Record};
use crate::scope::Scope;
use crate::strings::Name;

/// Word size of the target machine in bytes.
pub const WORD: u32 = 4;

#[derive(Clone)]
pub enum Base {
    Void,
    Bool,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    LongDouble,
    Record(Rc<Record>),
    Enum(Rc<EnumDef>),
}

/// One function parameter as declared in a prototype.
#[derive(Clone)]
pub struct Param {
    pub name: Option<Name>,
    pub ty: Rc<Type>,
}

/// A function signature. The prototype scope is retained so tags declared
/// among the parameters stay visible inside the function body.
pub struct FunctionSig {
    pub ret: Rc<Type>,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub proto_scope: RefCell<Option<Rc<RefCell<Scope>>>>,
}

pub enum Type {
    Base {
        base: Base,
        is_const: bool,
        is_volatile: bool,
    },
    Pointer {
        target: Rc<Type>,
        is_const: bool,
        is_volatile: bool,
        is_restrict: bool,
    },
    Array {
        element: Rc<Type>,
        count: u32,
    },
    /// An array of unknown length: a parameter, or a declaration completed
    /// later by its initialiser or a redeclaration.
    IndeterminateArray {
        element: Rc<Type>,
    },
    Function(Rc<FunctionSig>),
}

impl Type {
    pub fn base(base: Base) -> Rc<Type> {
        Rc::new(Type::Base {
            base,
            is_const: false,
            is_volatile: false,
        })
    }

    pub fn void() -> Rc<Type> {
        Type::base(Base::Void)
    }

    pub fn bool_type() -> Rc<Type> {
        Type::base(Base::Bool)
    }

    pub fn char_type() -> Rc<Type> {
        Type::base(Base::Char)
    }

    pub fn int() -> Rc<Type> {
        Type::base(Base::Int)
    }

    pub fn uint() -> Rc<Type> {
        Type::base(Base::UInt)
    }

    pub fn double_type() -> Rc<Type> {
        Type::base(Base::Double)
    }

    pub fn pointer(target: Rc<Type>) -> Rc<Type> {
        Rc::new(Type::Pointer {
            target,
            is_const: false,
            is_volatile: false,
            is_restrict: false,
        })
    }

    pub fn qualified_pointer(
        target: Rc<Type>,
        is_const: bool,
        is_volatile: bool,
        is_restrict: bool,
    ) -> Rc<Type> {
        Rc::new(Type::Pointer {
            target,
            is_const,
            is_volatile,
            is_restrict,
        })
    }

    pub fn array(element: Rc<Type>, count: u32) -> Result<Rc<Type>, CompileError> {
        if element.is_function() {
            return Err(CompileError::new(
                ErrorKind::Semantic,
                "array of functions is not a valid type",
            ));
        }
        Ok(Rc::new(Type::Array { element, count }))
    }

    pub fn indeterminate_array(element: Rc<Type>) -> Result<Rc<Type>, CompileError> {
        if element.is_function() {
            return Err(CompileError::new(
                ErrorKind::Semantic,
                "array of functions is not a valid type",
            ));
        }
        Ok(Rc::new(Type::IndeterminateArray { element }))
    }

    pub fn function(
        ret: Rc<Type>,
        params: Vec<Param>,
        variadic: bool,
    ) -> Result<Rc<Type>, CompileError> {
        if ret.is_function() {
            return Err(CompileError::new(
                ErrorKind::Semantic,
                "function returning function is not a valid type",
            ));
        }
        if ret.is_array() {
            return Err(CompileError::new(
                ErrorKind::Semantic,
                "function returning array is not a valid type",
            ));
        }
        Ok(Rc::new(Type::Function(Rc::new(FunctionSig {
            ret,
            params,
            variadic,
            proto_scope: RefCell::new(None),
        }))))
    }

    pub fn record(record: Rc<Record>) -> Rc<Type> {
        Type::base(Base::Record(record))
    }

    pub fn enumeration(def: Rc<EnumDef>) -> Rc<Type> {
        Type::base(Base::Enum(def))
    }

    /// Copy `ty` with const/volatile set on the outermost node. Qualifying
    /// an array qualifies its element instead, per C semantics.
    pub fn qualified(ty: &Rc<Type>, add_const: bool, add_volatile: bool) -> Rc<Type> {
        if !add_const && !add_volatile {
            return Rc::clone(ty);
        }
        match &**ty {
            Type::Base {
                base,
                is_const,
                is_volatile,
            } => Rc::new(Type::Base {
                base: base.clone(),
                is_const: *is_const || add_const,
                is_volatile: *is_volatile || add_volatile,
            }),
            Type::Pointer {
                target,
                is_const,
                is_volatile,
                is_restrict,
            } => Rc::new(Type::Pointer {
                target: Rc::clone(target),
                is_const: *is_const || add_const,
                is_volatile: *is_volatile || add_volatile,
                is_restrict: *is_restrict,
            }),
            Type::Array { element, count } => Rc::new(Type::Array {
                element: Type::qualified(element, add_const, add_volatile),
                count: *count,
            }),
            Type::IndeterminateArray { element } => Rc::new(Type::IndeterminateArray {
                element: Type::qualified(element, add_const, add_volatile),
            }),
            Type::Function(_) => Rc::clone(ty),
        }
    }

    /// Copy with the outermost qualifiers cleared.
    pub fn unqualified(ty: &Rc<Type>) -> Rc<Type> {
        match &**ty {
            Type::Base {
                base,
                is_const,
                is_volatile,
            } if *is_const || *is_volatile => Rc::new(Type::Base {
                base: base.clone(),
                is_const: false,
                is_volatile: false,
            }),
            Type::Pointer {
                target,
                is_const,
                is_volatile,
                is_restrict,
            } if *is_const || *is_volatile || *is_restrict => Rc::new(Type::Pointer {
                target: Rc::clone(target),
                is_const: false,
                is_volatile: false,
                is_restrict: false,
            }),
            _ => Rc::clone(ty),
        }
    }

    pub fn size(&self) -> Result<u32, CompileError> {
        match self {
            Type::Base { base, .. } => base.size(),
            Type::Pointer { .. } => Ok(WORD),
            Type::Array { element, count } => Ok(element.size()? * count),
            Type::IndeterminateArray { .. } => Err(CompileError::new(
                ErrorKind::Semantic,
                "size of array of unknown length",
            )),
            Type::Function(_) => {
                Err(CompileError::new(ErrorKind::Semantic, "size of function type"))
            }
        }
    }

    pub fn alignment(&self) -> Result<u32, CompileError> {
        match self {
            Type::Base { base, .. } => base.alignment(),
            Type::Pointer { .. } => Ok(WORD),
            Type::Array { element, .. } | Type::IndeterminateArray { element } => {
                element.alignment()
            }
            Type::Function(_) => Ok(WORD),
        }
    }

    /// Structural equality, qualifiers included.
    pub fn equal(a: &Rc<Type>, b: &Rc<Type>) -> bool {
        if Rc::ptr_eq(a, b) {
            return true;
        }
        match (&**a, &**b) {
            (
                Type::Base {
                    base: ba,
                    is_const: ca,
                    is_volatile: va,
                },
                Type::Base {
                    base: bb,
                    is_const: cb,
                    is_volatile: vb,
                },
            ) => ca == cb && va == vb && Base::equal(ba, bb),
            (
                Type::Pointer {
                    target: ta,
                    is_const: ca,
                    is_volatile: va,
                    is_restrict: ra,
                },
                Type::Pointer {
                    target: tb,
                    is_const: cb,
                    is_volatile: vb,
                    is_restrict: rb,
                },
            ) => ca == cb && va == vb && ra == rb && Type::equal(ta, tb),
            (
                Type::Array {
                    element: ea,
                    count: na,
                },
                Type::Array {
                    element: eb,
                    count: nb,
                },
            ) => na == nb && Type::equal(ea, eb),
            (Type::IndeterminateArray { element: ea }, Type::IndeterminateArray { element: eb }) => {
                Type::equal(ea, eb)
            }
            (Type::Function(fa), Type::Function(fb)) => {
                fa.variadic == fb.variadic
                    && fa.params.len() == fb.params.len()
                    && Type::equal(&fa.ret, &fb.ret)
                    && fa
                        .params
                        .iter()
                        .zip(&fb.params)
                        .all(|(pa, pb)| Type::equal(&pa.ty, &pb.ty))
            }
            _ => false,
        }
    }

    /// Equality ignoring the outermost qualifiers.
    pub fn compatible_unqual(a: &Rc<Type>, b: &Rc<Type>) -> bool {
        Type::equal(&Type::unqualified(a), &Type::unqualified(b))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Base { base: Base::Void, .. })
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Base { base: Base::Bool, .. })
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::Base {
                base: Base::Bool
                    | Base::Char
                    | Base::SChar
                    | Base::UChar
                    | Base::Short
                    | Base::UShort
                    | Base::Int
                    | Base::UInt
                    | Base::Long
                    | Base::ULong
                    | Base::LongLong
                    | Base::ULongLong
                    | Base::Enum(_),
                ..
            }
        )
    }

    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            Type::Base {
                base: Base::Float | Base::Double | Base::LongDouble,
                ..
            }
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_floating()
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. } | Type::IndeterminateArray { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function(_))
    }

    /// Pointer or array.
    pub fn is_indirection(&self) -> bool {
        self.is_pointer() || self.is_array()
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Type::Base { base: Base::Record(_), .. })
    }

    pub fn is_scalar(&self) -> bool {
        self.is_arithmetic() || self.is_pointer()
    }

    pub fn is_long_long(&self) -> bool {
        matches!(
            self,
            Type::Base {
                base: Base::LongLong | Base::ULongLong,
                ..
            }
        )
    }

    /// Indeterminate or zero-length array: a flexible array member.
    pub fn is_flexible_array(&self) -> bool {
        match self {
            Type::IndeterminateArray { .. } => true,
            Type::Array { count, .. } => *count == 0,
            _ => false,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Type::Base {
                base: Base::Char
                    | Base::SChar
                    | Base::Short
                    | Base::Int
                    | Base::Long
                    | Base::LongLong
                    | Base::Enum(_),
                ..
            }
        )
    }

    /// Conversion rank. Meaningful only for integer types.
    pub fn integer_rank(&self) -> u32 {
        match self {
            Type::Base { base, .. } => match base {
                Base::Bool => 0,
                Base::Char | Base::SChar | Base::UChar => 1,
                Base::Short | Base::UShort => 2,
                Base::Int | Base::UInt | Base::Enum(_) => 3,
                Base::Long | Base::ULong => 4,
                Base::LongLong | Base::ULongLong => 5,
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Result of integer promotion. Anything narrower than int becomes int;
    /// everything in that range is representable as int on this target.
    pub fn promoted(self: &Rc<Type>) -> Rc<Type> {
        if let Type::Base { base: Base::Enum(_), .. } = &**self {
            return Type::int();
        }
        if self.is_integer() && self.integer_rank() < 3 {
            return Type::int();
        }
        Rc::clone(self)
    }

    pub fn pointee(&self) -> Option<Rc<Type>> {
        match self {
            Type::Pointer { target, .. } => Some(Rc::clone(target)),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<Rc<Type>> {
        match self {
            Type::Array { element, .. } | Type::IndeterminateArray { element } => {
                Some(Rc::clone(element))
            }
            _ => None,
        }
    }

    /// The signature of a function type, or of a pointer to function.
    pub fn signature(&self) -> Option<Rc<FunctionSig>> {
        match self {
            Type::Function(sig) => Some(Rc::clone(sig)),
            Type::Pointer { target, .. } => match &**target {
                Type::Function(sig) => Some(Rc::clone(sig)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<Rc<Record>> {
        match self {
            Type::Base {
                base: Base::Record(record),
                ..
            } => Some(Rc::clone(record)),
            _ => None,
        }
    }
}

impl Base {
    pub fn size(&self) -> Result<u32, CompileError> {
        match self {
            // GNU extension: void has size 1 so void* arithmetic works.
            Base::Void => Ok(1),
            Base::Bool | Base::Char | Base::SChar | Base::UChar => Ok(1),
            Base::Short | Base::UShort => Ok(2),
            Base::Int | Base::UInt | Base::Long | Base::ULong => Ok(WORD),
            Base::LongLong | Base::ULongLong => Ok(8),
            Base::Float => Ok(WORD),
            Base::Double | Base::LongDouble => Ok(8),
            Base::Record(record) => record.size_checked(),
            Base::Enum(_) => Ok(WORD),
        }
    }

    pub fn alignment(&self) -> Result<u32, CompileError> {
        match self {
            Base::Void | Base::Bool | Base::Char | Base::SChar | Base::UChar => Ok(1),
            Base::Short | Base::UShort => Ok(2),
            Base::Record(record) => record.alignment_checked(),
            // 8-byte types align to the word size on this target.
            _ => Ok(WORD),
        }
    }

    fn equal(a: &Base, b: &Base) -> bool {
        match (a, b) {
            (Base::Record(ra), Base::Record(rb)) => Rc::ptr_eq(ra, rb),
            (Base::Enum(ea), Base::Enum(eb)) => Rc::ptr_eq(ea, eb),
            _ => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Base::Void => "void",
            Base::Bool => "_Bool",
            Base::Char => "char",
            Base::SChar => "signed char",
            Base::UChar => "unsigned char",
            Base::Short => "short",
            Base::UShort => "unsigned short",
            Base::Int => "int",
            Base::UInt => "unsigned int",
            Base::Long => "long",
            Base::ULong => "unsigned long",
            Base::LongLong => "long long",
            Base::ULongLong => "unsigned long long",
            Base::Float => "float",
            Base::Double => "double",
            Base::LongDouble => "long double",
            Base::Record(_) => "record",
            Base::Enum(_) => "enum",
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Base { base, is_const, .. } => {
                if *is_const {
                    write!(f, "const ")?;
                }
                match base {
                    Base::Record(record) => match record.tag() {
                        Some(tag) => write!(f, "{} {}", record.kind_name(), tag),
                        None => write!(f, "{} <anonymous>", record.kind_name()),
                    },
                    Base::Enum(def) => match &def.tag {
                        Some(tag) => write!(f, "enum {}", tag),
                        None => write!(f, "enum <anonymous>"),
                    },
                    other => write!(f, "{}", other.name()),
                }
            }
            Type::Pointer { target, .. } => write!(f, "{}*", target),
            Type::Array { element, count } => write!(f, "{}[{}]", element, count),
            Type::IndeterminateArray { element } => write!(f, "{}[]", element),
            Type::Function(sig) => {
                write!(f, "{}(", sig.ret)?;
                for (i, p) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.ty)?;
                }
                if sig.variadic {
                    if !sig.params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(Type::char_type().size().unwrap(), 1);
        assert_eq!(Type::base(Base::Short).size().unwrap(), 2);
        assert_eq!(Type::int().size().unwrap(), 4);
        assert_eq!(Type::base(Base::Long).size().unwrap(), 4);
        assert_eq!(Type::base(Base::LongLong).size().unwrap(), 8);
        assert_eq!(Type::base(Base::Float).size().unwrap(), 4);
        assert_eq!(Type::double_type().size().unwrap(), 8);
        assert_eq!(Type::pointer(Type::int()).size().unwrap(), 4);
    }

    #[test]
    fn test_array_size() {
        let a = Type::array(Type::int(), 4).unwrap();
        assert_eq!(a.size().unwrap(), 16);
        assert_eq!(a.alignment().unwrap(), 4);
    }

    #[test]
    fn test_alignment_capped_at_word() {
        assert_eq!(Type::double_type().alignment().unwrap(), 4);
        assert_eq!(Type::base(Base::LongLong).alignment().unwrap(), 4);
        assert_eq!(Type::base(Base::Short).alignment().unwrap(), 2);
    }

    #[test]
    fn test_equality_includes_qualifiers() {
        let a = Type::int();
        let b = Type::qualified(&Type::int(), true, false);
        assert!(!Type::equal(&a, &b));
        assert!(Type::compatible_unqual(&a, &b));
        assert!(Type::equal(&a, &Type::int()));
    }

    #[test]
    fn test_pointer_equality_is_structural() {
        let a = Type::pointer(Type::char_type());
        let b = Type::pointer(Type::char_type());
        assert!(Type::equal(&a, &b));
        assert!(!Type::equal(&a, &Type::pointer(Type::int())));
    }

    #[test]
    fn test_function_invariants() {
        let f = Type::function(Type::int(), vec![], false).unwrap();
        assert!(Type::function(Rc::clone(&f), vec![], false).is_err());
        assert!(Type::function(Type::array(Type::int(), 2).unwrap(), vec![], false).is_err());
        assert!(Type::array(f, 3).is_err());
    }

    #[test]
    fn test_integer_rank_order() {
        let ranks = [
            Type::bool_type().integer_rank(),
            Type::char_type().integer_rank(),
            Type::base(Base::Short).integer_rank(),
            Type::int().integer_rank(),
            Type::base(Base::Long).integer_rank(),
            Type::base(Base::LongLong).integer_rank(),
        ];
        for pair in ranks.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_promotion() {
        assert!(Type::equal(&Type::char_type().promoted(), &Type::int()));
        assert!(Type::equal(&Type::base(Base::UShort).promoted(), &Type::int()));
        assert!(Type::equal(&Type::uint().promoted(), &Type::uint()));
        assert!(Type::equal(
            &Type::base(Base::LongLong).promoted(),
            &Type::base(Base::LongLong)
        ));
    }

    #[test]
    fn test_promotion_is_idempotent() {
        let types = [
            Type::char_type(),
            Type::int(),
            Type::uint(),
            Type::base(Base::ULongLong),
        ];
        for ty in &types {
            let once = ty.promoted();
            let twice = once.promoted();
            assert!(Type::equal(&once, &twice));
        }
    }

    #[test]
    fn test_flexible_array_detection() {
        assert!(
            Type::indeterminate_array(Type::int())
                .unwrap()
                .is_flexible_array()
        );
        assert!(Type::array(Type::int(), 0).unwrap().is_flexible_array());
        assert!(!Type::array(Type::int(), 1).unwrap().is_flexible_array());
    }

    #[test]
    fn test_signedness() {
        assert!(Type::char_type().is_signed());
        assert!(!Type::base(Base::UChar).is_signed());
        assert!(Type::base(Base::LongLong).is_signed());
        assert!(!Type::base(Base::ULongLong).is_signed());
        assert!(!Type::bool_type().is_signed());
    }
}
