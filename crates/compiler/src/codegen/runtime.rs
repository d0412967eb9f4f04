//! Names of the runtime helper routines the generated code calls.
//!
//! The helpers live in the accompanying libc. All of them follow one
//! protocol: pointer arguments to operand storage in r0 and r1, result
//! written through r0, and r0 returned. Comparison helpers instead return
//! -1, 0, or 1 in r0. Conversion helpers take the destination pointer in
//! r0 and the source pointer in r1. The long long shift helpers are the
//! one exception: the shift amount travels by value in r1.

use crate::ast::BinaryOp;
use crate::error::CompileError;
use crate::types::Type;

pub const MEMCPY: &str = "memcpy";
pub const MEMSET: &str = "memset";

/// The complete helper surface, for reference and diagnostics.
pub const HELPER_NAMES: &[&str] = &[
    "__llong_add",
    "__llong_sub",
    "__llong_mul",
    "__llong_divs",
    "__llong_divu",
    "__llong_mods",
    "__llong_modu",
    "__llong_and",
    "__llong_or",
    "__llong_xor",
    "__llong_shl",
    "__llong_shrs",
    "__llong_shru",
    "__llong_cmps",
    "__llong_cmpu",
    "__float_add",
    "__float_sub",
    "__float_mul",
    "__float_div",
    "__float_cmp",
    "__double_add",
    "__double_sub",
    "__double_mul",
    "__double_div",
    "__double_cmp",
    "__float_to_double",
    "__double_to_float",
    "__float_from_int",
    "__float_from_uint",
    "__float_from_llong",
    "__float_from_ullong",
    "__float_to_int",
    "__float_to_uint",
    "__float_to_llong",
    "__float_to_ullong",
    "__double_from_int",
    "__double_from_uint",
    "__double_from_llong",
    "__double_from_ullong",
    "__double_to_int",
    "__double_to_uint",
    "__double_to_llong",
    "__double_to_ullong",
];

/// Family prefix of a helper by operand type.
pub fn helper_family(ty: &Type) -> Option<&'static str> {
    if ty.is_long_long() {
        return Some("__llong");
    }
    if !ty.is_floating() {
        return None;
    }
    match ty.size() {
        Ok(4) => Some("__float"),
        _ => Some("__double"),
    }
}

/// Helper for a binary arithmetic operation on long long or floating
/// operands. Comparison operators map to the family's cmp helper.
pub fn binary_helper(op: BinaryOp, ty: &Type) -> Result<String, CompileError> {
    let family = helper_family(ty)
        .ok_or_else(|| CompileError::internal("helper requested for a register-width type"))?;
    let signed = ty.is_signed();
    let name = match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => {
            if family == "__llong" {
                if signed { "divs" } else { "divu" }
            } else {
                "div"
            }
        }
        BinaryOp::Mod => {
            if family != "__llong" {
                return Err(CompileError::internal("floating modulo is not lowered"));
            }
            if signed { "mods" } else { "modu" }
        }
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => {
            if signed { "shrs" } else { "shru" }
        }
        BinaryOp::BitAnd => "and",
        BinaryOp::BitOr => "or",
        BinaryOp::BitXor => "xor",
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le
        | BinaryOp::Ge => {
            if family == "__llong" {
                if signed { "cmps" } else { "cmpu" }
            } else {
                "cmp"
            }
        }
    };
    Ok(format!("{}_{}", family, name))
}

/// Helper converting between a floating family and an integer shape, or
/// between the two floating widths.
pub fn conversion_helper(from: &Type, to: &Type) -> Option<String> {
    let from_family = helper_family(from);
    let to_family = helper_family(to);
    match (from_family, to_family) {
        (Some("__float"), Some("__double")) => Some("__float_to_double".to_string()),
        (Some("__double"), Some("__float")) => Some("__double_to_float".to_string()),
        (Some(f @ ("__float" | "__double")), _) if to.is_long_long() => Some(format!(
            "{}_to_{}",
            f,
            if to.is_signed() { "llong" } else { "ullong" }
        )),
        (Some(f @ ("__float" | "__double")), _) if to.is_integer() => Some(format!(
            "{}_to_{}",
            f,
            if to.is_signed() { "int" } else { "uint" }
        )),
        (_, Some(f @ ("__float" | "__double"))) if from.is_long_long() => Some(format!(
            "{}_from_{}",
            f,
            if from.is_signed() { "llong" } else { "ullong" }
        )),
        (_, Some(f @ ("__float" | "__double"))) if from.is_integer() || from.is_pointer() => {
            Some(format!(
                "{}_from_{}",
                f,
                if from.is_integer() && from.is_signed() {
                    "int"
                } else {
                    "uint"
                }
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Base;

    #[test]
    fn test_llong_helpers() {
        let ll = Type::base(Base::LongLong);
        let ull = Type::base(Base::ULongLong);
        assert_eq!(binary_helper(BinaryOp::Add, &ll).unwrap(), "__llong_add");
        assert_eq!(binary_helper(BinaryOp::Div, &ll).unwrap(), "__llong_divs");
        assert_eq!(binary_helper(BinaryOp::Div, &ull).unwrap(), "__llong_divu");
        assert_eq!(binary_helper(BinaryOp::Shr, &ull).unwrap(), "__llong_shru");
        assert_eq!(binary_helper(BinaryOp::Lt, &ll).unwrap(), "__llong_cmps");
    }

    #[test]
    fn test_float_helpers() {
        let f = Type::base(Base::Float);
        let d = Type::double_type();
        assert_eq!(binary_helper(BinaryOp::Add, &f).unwrap(), "__float_add");
        assert_eq!(binary_helper(BinaryOp::Div, &d).unwrap(), "__double_div");
        assert_eq!(binary_helper(BinaryOp::Eq, &d).unwrap(), "__double_cmp");
        assert!(binary_helper(BinaryOp::Mod, &d).is_err());
    }

    #[test]
    fn test_long_double_uses_double_family() {
        let ld = Type::base(Base::LongDouble);
        assert_eq!(binary_helper(BinaryOp::Mul, &ld).unwrap(), "__double_mul");
    }

    #[test]
    fn test_conversion_helpers() {
        let f = Type::base(Base::Float);
        let d = Type::double_type();
        let i = Type::int();
        let u = Type::uint();
        let ll = Type::base(Base::LongLong);
        assert_eq!(conversion_helper(&i, &d).unwrap(), "__double_from_int");
        assert_eq!(conversion_helper(&d, &u).unwrap(), "__double_to_uint");
        assert_eq!(conversion_helper(&f, &d).unwrap(), "__float_to_double");
        assert_eq!(conversion_helper(&ll, &f).unwrap(), "__float_from_llong");
        assert_eq!(conversion_helper(&f, &ll).unwrap(), "__float_to_llong");
        assert!(conversion_helper(&i, &u).is_none());
        // Every generated name is in the published surface.
        for pair in [
            conversion_helper(&i, &d).unwrap(),
            conversion_helper(&d, &u).unwrap(),
            conversion_helper(&f, &ll).unwrap(),
        ] {
            assert!(HELPER_NAMES.contains(&pair.as_str()), "{} missing", pair);
        }
    }
}
