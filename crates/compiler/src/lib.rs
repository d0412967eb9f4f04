//! mica-cc compiler library.
//!
//! Compiles one preprocessed C translation unit (`.i`) to textual
//! assembly for the Mica register VM. The pipeline is a single pass:
//! lex, parse into a typed AST (scopes, records, conversions resolved
//! during parsing), lower to virtual-machine instructions, serialise.
//!
//! ```rust,ignore
//! use mica_cc::{compile_file, Options};
//!
//! let options = Options::default().with_debug_lines(true);
//! compile_file("main.i".as_ref(), "main.s".as_ref(), &options)?;
//! ```
//!
//! The upstream preprocessor, the downstream assembler and linker, the
//! libc that provides the `__llong_*`/`__float_*`/`__double_*` helper
//! routines, and the VM itself are separate tools.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod emit;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod records;
pub mod scope;
pub mod strings;
pub mod types;

pub use codegen::CodeGen;
pub use config::{Dialect, Options, WarningConfig, WarningSet};
pub use error::{CompileError, ErrorKind};
pub use parser::Parser;

use std::fs;
use std::path::Path;

/// Compile an input `.i` file to an assembly file.
pub fn compile_file(input: &Path, output: &Path, options: &Options) -> Result<(), CompileError> {
    let mut options = options.clone();
    if let Some(config_path) = options.warning_config_path.clone() {
        let text = fs::read_to_string(&config_path).map_err(|e| {
            CompileError::io(format!(
                "cannot read warning config '{}': {}",
                config_path.display(),
                e
            ))
        })?;
        let config = WarningConfig::from_toml(&text)?;
        config.apply(&mut options.warnings)?;
    }

    let bytes = fs::read(input).map_err(|e| {
        CompileError::io(format!("cannot read input '{}': {}", input.display(), e))
    })?;
    let filename = input.to_string_lossy();
    let text = compile_bytes(bytes, &filename, &options)?;

    fs::write(output, text).map_err(|e| {
        CompileError::io(format!("cannot write output '{}': {}", output.display(), e))
    })
}

/// Compile source text to assembly text (the test entry point).
pub fn compile_to_assembly(source: &str, options: &Options) -> Result<String, CompileError> {
    compile_bytes(source.as_bytes().to_vec(), "<memory>", options)
}

fn compile_bytes(
    bytes: Vec<u8>,
    filename: &str,
    options: &Options,
) -> Result<String, CompileError> {
    let parser = Parser::new(bytes, filename, options.clone())?;
    let unit = parser.parse_unit()?;
    let mut codegen = CodeGen::new();
    let program = codegen.lower_unit(&unit)?;
    emit::serialize(&program, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> String {
        compile_to_assembly(source, &Options::default()).unwrap()
    }

    fn fails(source: &str) -> CompileError {
        compile_to_assembly(source, &Options::default()).unwrap_err()
    }

    #[test]
    fn test_minimal_program() {
        let text = compile("int main(void) { return 0; }");
        assert!(text.contains("@main"));
        assert!(text.contains("enter"));
        assert!(text.contains("ret"));
    }

    #[test]
    fn test_struct_by_value_return() {
        let source = r#"
            struct P { int x, y; };
            struct P f(void) { struct P a; a.x = 2; a.y = 3; return a; }
            int main(void) {
                struct P a = f();
                if (a.x != 2) return 1;
                if (a.y != 3) return 2;
                return 0;
            }
        "#;
        let text = compile(source);
        assert!(text.contains("@f"));
        assert!(text.contains("@main"));
        assert!(text.contains("call ^f"));
    }

    #[test]
    fn test_struct_initializer_list() {
        let source = r#"
            struct P { int x, y; };
            struct P f(void) { struct P a = {2, 3}; return a; }
            int main(void) { struct P a = f(); return a.x + a.y - 5; }
        "#;
        assert!(compile_to_assembly(source, &Options::default()).is_ok());
    }

    #[test]
    fn test_pointer_arithmetic_program() {
        let source = "int a[4] = {10, 20, 30, 40};\n\
                      int main(void) { int *p = a; return *(p + 2) - 30; }";
        let text = compile(source);
        assert!(text.contains("=a"));
        // p + 2 scales the index by four with a shift.
        assert!(text.contains("shl"));
    }

    #[test]
    fn test_signed_right_shift_program() {
        let source = "int main(void) { int x = -8; return (x >> 2) == -2 ? 0 : 1; }";
        let text = compile(source);
        assert!(text.contains("shrs"));
    }

    #[test]
    fn test_unsigned_comparison_program() {
        // (-1 > 0u): the usual conversions make both unsigned.
        let source = "int main(void) { return (-1 > 0u) ? 0 : 1; }";
        let text = compile(source);
        assert!(text.contains("cmpu"));
    }

    #[test]
    fn test_enum_constants_program() {
        let source = "enum E { A, B = 5, C };\n\
                      int main(void) { return (A == 0 && B == 5 && C == 6) ? 0 : 1; }";
        assert!(compile_to_assembly(source, &Options::default()).is_ok());
    }

    #[test]
    fn test_variadic_function_program() {
        let source = r#"
            typedef char *va_list;
            int sum(int n, ...) {
                va_list ap;
                int total = 0;
                __builtin_va_start(ap, n);
                while (n > 0) {
                    total += __builtin_va_arg(ap, int);
                    n--;
                }
                __builtin_va_end(ap);
                return total;
            }
            int main(void) { return sum(3, 1, 2, 3) - 6; }
        "#;
        let text = compile(source);
        assert!(text.contains("@sum"));
        // Variadic calls pass every argument on the stack.
        assert!(text.contains("push"));
    }

    #[test]
    fn test_long_long_program() {
        let source = r#"
            int main(void) {
                long long a = 1;
                long long b = 2;
                long long c = a + b;
                return (int)c - 3;
            }
        "#;
        let text = compile(source);
        assert!(text.contains("call ^__llong_add"));
    }

    #[test]
    fn test_double_program() {
        let source = r#"
            int main(void) {
                double x = 1.5;
                double y = 2.5;
                return (int)(x + y) - 4;
            }
        "#;
        let text = compile(source);
        assert!(text.contains("call ^__double_add"));
        assert!(text.contains("call ^__double_to_int"));
    }

    #[test]
    fn test_func_name_program() {
        let source = "int main(void) { const char *n = __func__; return n[0] - 'm'; }";
        let text = compile(source);
        assert!(text.contains("\"main\" '00"));
    }

    #[test]
    fn test_goto_and_labels_program() {
        let source = r#"
            int main(void) {
                int n = 0;
            again:
                n++;
                if (n < 3) goto again;
                return n - 3;
            }
        "#;
        let text = compile(source);
        assert!(text.contains(":goto_again"));
        assert!(text.contains("&goto_again"));
    }

    #[test]
    fn test_statement_expression_program() {
        let source = "int main(void) { return ({ int x = 2; x + 1; }) - 3; }";
        assert!(compile_to_assembly(source, &Options::default()).is_ok());
    }

    #[test]
    fn test_fail_function_redeclared() {
        let e = fails("int f(int); int f(long long); int main(void) { return 0; }");
        assert!(e.to_string().contains("conflicting"));
        assert!(e.to_string().contains("f"));
    }

    #[test]
    fn test_fail_struct_redefinition() {
        let e = fails("struct S { int x; }; struct S { int y; };");
        let message = e.to_string();
        assert!(message.contains("redefinition"));
        assert!(message.contains("S"));
    }

    #[test]
    fn test_fail_diagnostic_carries_location() {
        let e = fails("int main(void) { return nope; }");
        let message = e.to_string();
        assert!(message.contains("<memory>"), "got: {}", message);
        assert!(message.contains("nope"), "got: {}", message);
    }

    #[test]
    fn test_compile_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("t.i");
        let output = dir.path().join("t.s");
        std::fs::write(&input, "int main(void) { return 0; }").unwrap();

        compile_file(&input, &output, &Options::default()).unwrap();
        let text = std::fs::read_to_string(&output).unwrap();
        assert!(text.contains("@main"));
    }

    #[test]
    fn test_compile_file_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_file(
            &dir.path().join("absent.i"),
            &dir.path().join("out.s"),
            &Options::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_warning_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("warn.toml");
        let input = dir.path().join("t.i");
        let output = dir.path().join("t.s");
        std::fs::write(&config, "[warnings]\nfloat-to-int = false\n").unwrap();
        std::fs::write(&input, "int x = (int)1.5; int main(void) { return 0; }").unwrap();

        let mut options = Options::default();
        options.warning_config_path = Some(config);
        assert!(compile_file(&input, &output, &options).is_ok());
    }
}
