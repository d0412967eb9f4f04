//! Lowering from the typed AST to virtual-machine instructions.
//!
//! The generator walks the translation unit in emission order: global
//! data first, then function bodies, with string-literal constants
//! deferred to the end. Each function's body is generated into an
//! in-memory block list and the prologue is attached once the frame size
//! is known.
//!
//! # Module Structure
//!
//! - `state.rs`: registers, opcodes, operands, blocks, and the CodeGen
//!   state (labels, frame allocator, deferred strings)
//! - `expr.rs`: expression lowering, conversions, helper calls
//! - `stmt.rs`: function frames, statements, control flow
//! - `globals.rs`: global data images and address constants
//! - `runtime.rs`: the helper-routine name surface

mod expr;
mod globals;
mod runtime;
mod state;
mod stmt;

pub use state::{AsmItem, AsmProgram, Block, CodeGen, DataTerm, Ins, Opcode, Operand, Reg};

use crate::ast::TranslationUnit;
use crate::error::CompileError;

impl CodeGen {
    /// Lower a whole translation unit.
    pub fn lower_unit(&mut self, unit: &TranslationUnit) -> Result<AsmProgram, CompileError> {
        for global in &unit.globals {
            self.lower_global(global)?;
        }
        for function in &unit.functions {
            self.lower_function(function)?;
        }

        let mut items = Vec::new();
        items.append(&mut self.globals);
        items.append(&mut self.functions);
        items.append(&mut self.strings);
        Ok(AsmProgram { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::parser::Parser;

    fn lower(source: &str) -> AsmProgram {
        let parser =
            Parser::new(source.as_bytes().to_vec(), "test.i", Options::default()).unwrap();
        let unit = parser.parse_unit().unwrap();
        let mut codegen = CodeGen::new();
        codegen.lower_unit(&unit).unwrap()
    }

    fn function_ops(program: &AsmProgram, name: &str) -> Vec<Opcode> {
        program
            .items
            .iter()
            .find_map(|item| match item {
                AsmItem::Function { name: n, blocks } if n == name => Some(
                    blocks
                        .iter()
                        .flat_map(|b| b.ins.iter().map(|i| i.op))
                        .collect(),
                ),
                _ => None,
            })
            .expect("function not found")
    }

    #[test]
    fn test_minimal_main_shape() {
        let program = lower("int main(void) { return 0; }");
        let ops = function_ops(&program, "main");
        assert_eq!(ops.first(), Some(&Opcode::Enter));
        assert!(ops.contains(&Opcode::Zero));
        assert!(ops.contains(&Opcode::Leave));
        assert!(ops.contains(&Opcode::Ret));
    }

    #[test]
    fn test_emission_order_globals_functions_strings() {
        let program = lower(
            "int g = 1; const char *s; int main(void) { s = \"hi\"; return g; }",
        );
        let kinds: Vec<u32> = program
            .items
            .iter()
            .map(|item| match item {
                AsmItem::Variable { .. } => 0,
                AsmItem::Function { .. } => 1,
                AsmItem::StringConstant { .. } => 2,
            })
            .collect();
        let mut sorted = kinds.clone();
        sorted.sort_unstable();
        assert_eq!(kinds, sorted, "globals, then functions, then strings");
        assert!(kinds.contains(&2));
    }

    #[test]
    fn test_signed_division_picks_divs() {
        let program = lower("int f(int a, int b) { return a / b; }");
        let ops = function_ops(&program, "f");
        assert!(ops.contains(&Opcode::Divs));
        assert!(!ops.contains(&Opcode::Divu));
    }

    #[test]
    fn test_unsigned_division_picks_divu() {
        let program = lower("unsigned f(unsigned a, unsigned b) { return a / b; }");
        let ops = function_ops(&program, "f");
        assert!(ops.contains(&Opcode::Divu));
    }

    #[test]
    fn test_signed_right_shift_picks_shrs() {
        let program = lower("int f(int a) { return a >> 2; }");
        let ops = function_ops(&program, "f");
        assert!(ops.contains(&Opcode::Shrs));
    }

    #[test]
    fn test_unsigned_compare_picks_cmpu() {
        let program = lower("int f(unsigned a, unsigned b) { return a < b; }");
        let ops = function_ops(&program, "f");
        assert!(ops.contains(&Opcode::Cmpu));
        assert!(!ops.contains(&Opcode::Cmps));
    }

    #[test]
    fn test_char_load_sign_extends() {
        let program = lower("int f(char *p) { return *p; }");
        let ops = function_ops(&program, "f");
        assert!(ops.contains(&Opcode::Ldb));
        assert!(ops.contains(&Opcode::Sxb));
    }

    #[test]
    fn test_unsigned_char_load_does_not_extend() {
        let program = lower("int f(unsigned char *p) { return *p; }");
        let ops = function_ops(&program, "f");
        assert!(ops.contains(&Opcode::Ldb));
        assert!(!ops.contains(&Opcode::Sxb));
    }

    #[test]
    fn test_long_long_add_calls_helper() {
        let program = lower("long long f(long long a, long long b) { return a + b; }");
        let calls = helper_calls(&program, "f");
        assert!(calls.iter().any(|c| c == "__llong_add"), "calls: {:?}", calls);
    }

    #[test]
    fn test_double_mul_calls_helper() {
        let program = lower("double f(double a, double b) { return a * b; }");
        let calls = helper_calls(&program, "f");
        assert!(calls.iter().any(|c| c == "__double_mul"), "calls: {:?}", calls);
    }

    #[test]
    fn test_float_arithmetic_calls_float_family() {
        let program = lower("float f(float a, float b) { return a - b; }");
        let calls = helper_calls(&program, "f");
        assert!(calls.iter().any(|c| c == "__float_sub"), "calls: {:?}", calls);
    }

    fn helper_calls(program: &AsmProgram, name: &str) -> Vec<String> {
        program
            .items
            .iter()
            .find_map(|item| match item {
                AsmItem::Function { name: n, blocks } if n == name => Some(
                    blocks
                        .iter()
                        .flat_map(|b| &b.ins)
                        .filter(|i| i.op == Opcode::Call)
                        .filter_map(|i| match i.operands.first() {
                            Some(Operand::Sym { name, .. }) => Some(name.clone()),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => None,
            })
            .expect("function not found")
    }

    #[test]
    fn test_static_local_renamed() {
        let program = lower("int f(void) { static int n = 3; return n; }");
        let renamed = program.items.iter().any(|item| match item {
            AsmItem::Variable { name, .. } => name.starts_with("__L_") && name.ends_with("_n"),
            _ => false,
        });
        assert!(renamed);
    }

    #[test]
    fn test_string_literal_label_shape() {
        let program = lower("const char *m(void) { return \"x\"; }");
        let has_label = program.items.iter().any(|item| match item {
            AsmItem::StringConstant { name, bytes } => {
                name.starts_with("__S_") && bytes.last() == Some(&0)
            }
            _ => false,
        });
        assert!(has_label);
    }

    #[test]
    fn test_identical_literals_not_merged() {
        let program = lower(
            "const char *a(void) { return \"dup\"; } const char *b(void) { return \"dup\"; }",
        );
        let count = program
            .items
            .iter()
            .filter(|item| matches!(item, AsmItem::StringConstant { .. }))
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_global_data_image() {
        let program = lower("int a[4] = {10, 20, 30};");
        let AsmItem::Variable { data, .. } = &program.items[0] else {
            panic!("expected a variable");
        };
        // Three words and one zero-filled element.
        assert!(matches!(data[0], DataTerm::Word(10)));
        assert!(matches!(data[1], DataTerm::Word(20)));
        assert!(matches!(data[2], DataTerm::Word(30)));
        assert!(matches!(data[3], DataTerm::Zeroes(4)));
    }

    #[test]
    fn test_struct_global_padding() {
        let program = lower("struct S { char c; int i; }; struct S s = { 'a', 5 };");
        let AsmItem::Variable { data, .. } = &program.items[0] else {
            panic!("expected a variable");
        };
        assert!(matches!(&data[0], DataTerm::Bytes(b) if b == &vec![b'a']));
        assert!(matches!(data[1], DataTerm::Zeroes(3)));
        assert!(matches!(data[2], DataTerm::Word(5)));
    }

    #[test]
    fn test_tentative_global_zero_filled() {
        let program = lower("int pending; int main(void) { return pending; }");
        let AsmItem::Variable { name, data } = &program.items[0] else {
            panic!("expected a variable");
        };
        assert_eq!(name, "pending");
        assert!(matches!(data[0], DataTerm::Zeroes(4)));
    }

    #[test]
    fn test_switch_compare_chain() {
        let program = lower(
            "int f(int c) { switch (c) { case 1: return 1; case 2: return 4; default: return 0; } }",
        );
        let ops = function_ops(&program, "f");
        let compares = ops.iter().filter(|op| **op == Opcode::Cmps).count();
        assert_eq!(compares, 2);
        assert!(ops.contains(&Opcode::Jz));
    }

    #[test]
    fn test_call_uses_symbol_reference() {
        let program = lower("int g(void); int f(void) { return g(); }");
        let calls = helper_calls(&program, "f");
        assert_eq!(calls, vec!["g".to_string()]);
    }

    #[test]
    fn test_pointer_scaling_by_shift() {
        let program = lower("int f(int *p, int i) { return p[i]; }");
        let ops = function_ops(&program, "f");
        // Index scaled by 4 via a shift, then added and loaded.
        assert!(ops.contains(&Opcode::Shl));
        assert!(ops.contains(&Opcode::Ldw));
    }
}
