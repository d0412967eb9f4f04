//! Recursive-descent parser.
//!
//! One function per grammar production, roughly. The parser owns the lexer
//! and the scope stack, applies the usual arithmetic conversions and
//! integer promotions while building the tree, and evaluates constant
//! expressions where the grammar requires them.
//!
//! # Module Structure
//!
//! - `decl.rs`: declaration specifiers, declarators, records, enums,
//!   initialisers, function definitions
//! - `expr.rs`: precedence climbing, conversions, literals, constant
//!   expression evaluation
//! - `stmt.rs`: statements, statement expressions, switch bookkeeping

mod decl;
mod expr;
mod stmt;

use std::rc::Rc;

use crate::ast::TranslationUnit;
use crate::config::{Options, WarningSet};
use crate::error::CompileError;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::scope::{Builtin, ScopeStack, Symbol, SymbolKind};
use crate::strings::{Interner, Name};
use crate::types::Type;

pub struct Parser {
    lexer: Lexer,
    interner: Rc<Interner>,
    scopes: ScopeStack,
    options: Options,
    unit: TranslationUnit,
    fn_ctx: Option<FnContext>,
    switches: Vec<SwitchFrame>,
    /// File-scope variables that may still need zero-filled storage at end
    /// of translation unit.
    tentative: Vec<Rc<Symbol>>,
}

/// Per-function parsing state.
struct FnContext {
    name: Name,
    ret: Rc<Type>,
    variadic: bool,
    /// Synthesised label ids handed out so far (case/default labels).
    next_label: u32,
    /// Goto labels defined and used; checked against each other when the
    /// function body ends.
    labels_defined: Vec<Name>,
    labels_used: Vec<(Name, Rc<Token>)>,
}

/// Bookkeeping for the innermost `switch` being parsed.
struct SwitchFrame {
    cases: Vec<(i64, u32)>,
    default: Option<u32>,
}

impl Parser {
    pub fn new(bytes: Vec<u8>, filename: &str, options: Options) -> Result<Parser, CompileError> {
        let interner = Rc::new(Interner::new());
        let lexer = Lexer::new(bytes, filename, Rc::clone(&interner))?;
        let mut parser = Parser {
            lexer,
            interner,
            scopes: ScopeStack::new(),
            options,
            unit: TranslationUnit::new(),
            fn_ctx: None,
            switches: Vec::new(),
            tentative: Vec::new(),
        };
        parser.register_builtins();
        Ok(parser)
    }

    /// The variadic builtins and `__func__` live in the global scope as
    /// ordinary symbols of kind builtin; the expression parser gives them
    /// bespoke handling.
    fn register_builtins(&mut self) {
        let builtins = [
            ("__builtin_va_start", Builtin::VaStart),
            ("__builtin_va_arg", Builtin::VaArg),
            ("__builtin_va_end", Builtin::VaEnd),
            ("__builtin_va_copy", Builtin::VaCopy),
            ("__func__", Builtin::FuncName),
        ];
        for (name, builtin) in builtins {
            let symbol = Symbol::new(
                SymbolKind::Builtin(builtin),
                self.interner.intern(name),
                Type::int(),
                None,
            );
            symbol.set_hidden();
            self.scopes
                .add_symbol(symbol)
                .expect("builtin registration cannot collide");
        }
    }

    /// Parse the whole translation unit.
    pub fn parse_unit(mut self) -> Result<TranslationUnit, CompileError> {
        while self.lexer.current().kind != TokenKind::End {
            self.parse_file_scope_declaration()?;
        }
        self.flush_tentative_definitions();
        Ok(self.unit)
    }

    /// Emit zero-filled storage for tentative definitions that never got a
    /// real one.
    fn flush_tentative_definitions(&mut self) {
        let pending = std::mem::take(&mut self.tentative);
        for symbol in pending {
            if !symbol.is_tentative() || symbol.is_defined() {
                continue;
            }
            symbol.set_defined();
            let token = symbol
                .token
                .clone()
                .expect("tentative definitions come from source tokens");
            self.unit.globals.push(crate::ast::Global {
                symbol,
                init: None,
                token,
            });
        }
    }

    // ------------------------------------------------------------------
    // Shared lexer shorthands
    // ------------------------------------------------------------------

    fn current(&self) -> &Rc<Token> {
        self.lexer.current()
    }

    fn parse_error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::parse(msg, self.lexer.current())
    }

    fn semantic_error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::semantic(msg, self.lexer.current())
    }

    /// Print a warning and keep compiling.
    fn warn(&self, flag: WarningSet, token: &Rc<Token>, msg: &str) {
        if self.options.warn_enabled(flag) {
            eprintln!("{}:{}: warning: {}", token.file, token.line, msg);
        }
    }

    /// Allocate a synthesised label id in the current function.
    fn alloc_label(&mut self) -> Result<u32, CompileError> {
        let ctx = self
            .fn_ctx
            .as_mut()
            .ok_or_else(|| CompileError::internal("label outside a function"))?;
        let id = ctx.next_label;
        ctx.next_label += 1;
        Ok(id)
    }

    fn current_function_name(&self) -> Option<Name> {
        self.fn_ctx.as_ref().map(|ctx| ctx.name.clone())
    }

    fn return_type(&self) -> Option<Rc<Type>> {
        self.fn_ctx.as_ref().map(|ctx| Rc::clone(&ctx.ret))
    }

    /// Does the current token open a type name (cast, sizeof, parameter)?
    fn starts_type(&self) -> bool {
        let token = self.lexer.current();
        if token.kind != TokenKind::Alphanumeric {
            return false;
        }
        if matches!(
            token.text.as_str(),
            "void"
                | "_Bool"
                | "char"
                | "short"
                | "int"
                | "long"
                | "signed"
                | "unsigned"
                | "float"
                | "double"
                | "struct"
                | "union"
                | "enum"
                | "const"
                | "volatile"
                | "restrict"
                | "__restrict"
                | "_Atomic"
                | "_Alignas"
                | "_Complex"
                | "_Thread_local"
        ) {
            return true;
        }
        token.is_identifier() && self.scopes.find_typedef(&token.text, true).is_some()
    }

    /// Does the current token open a declaration (type name or storage
    /// class)?
    fn starts_declaration(&self) -> bool {
        self.starts_type()
            || matches!(
                self.lexer.current().text.as_str(),
                "typedef" | "extern" | "static" | "auto" | "register" | "inline" | "_Noreturn"
            ) && self.lexer.current().kind == TokenKind::Alphanumeric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<TranslationUnit, CompileError> {
        let parser = Parser::new(source.as_bytes().to_vec(), "test.i", Options::default())?;
        parser.parse_unit()
    }

    #[test]
    fn test_minimal_main() {
        let unit = parse("int main(void) { return 0; }").unwrap();
        assert_eq!(unit.functions.len(), 1);
        let main = unit.find_function("main").unwrap();
        assert_eq!(main.params.len(), 0);
        assert_eq!(main.body.len(), 1);
    }

    #[test]
    fn test_global_and_function() {
        let unit = parse("int counter = 3; int get(void) { return counter; }").unwrap();
        assert_eq!(unit.globals.len(), 1);
        assert_eq!(unit.functions.len(), 1);
        assert!(unit.globals[0].init.is_some());
    }

    #[test]
    fn test_tentative_definition_zero_filled_at_end() {
        let unit = parse("int x; int main(void) { return x; }").unwrap();
        assert_eq!(unit.globals.len(), 1);
        assert!(unit.globals[0].init.is_none());
        assert!(unit.globals[0].symbol.is_defined());
    }

    #[test]
    fn test_tentative_upgraded_by_definition() {
        let unit = parse("int x; int x = 7;").unwrap();
        // One emitted global: the real definition.
        assert_eq!(unit.globals.len(), 1);
        assert!(unit.globals[0].init.is_some());
    }

    #[test]
    fn test_extern_produces_no_storage() {
        let unit = parse("extern int stdin_fd; int main(void) { return stdin_fd; }").unwrap();
        assert_eq!(unit.globals.len(), 0);
    }

    #[test]
    fn test_function_redeclared_with_different_args_fails() {
        let result = parse("int f(int); int f(long long);");
        assert!(result.is_err());
        let message = result.err().unwrap().to_string();
        assert!(message.contains("conflicting"), "got: {}", message);
    }

    #[test]
    fn test_struct_redefinition_fails() {
        let result = parse("struct S { int x; }; struct S { int y; };");
        assert!(result.is_err());
        let message = result.err().unwrap().to_string();
        assert!(message.contains("redefin"), "got: {}", message);
    }

    #[test]
    fn test_duplicate_variable_fails() {
        let result = parse("int main(void) { int x; int x; return 0; }");
        assert!(result.is_err());
    }

    #[test]
    fn test_undeclared_identifier_fails() {
        let result = parse("int main(void) { return nope; }");
        assert!(result.is_err());
    }

    #[test]
    fn test_enum_constants_in_scope() {
        let unit = parse("enum E { A, B = 5, C }; int main(void) { return C; }").unwrap();
        assert_eq!(unit.functions.len(), 1);
    }

    #[test]
    fn test_typedef_and_use() {
        let unit = parse("typedef unsigned int uint; uint g; int main(void) { return g; }");
        assert!(unit.is_ok());
    }

    #[test]
    fn test_typedef_identical_redeclaration_allowed() {
        assert!(parse("typedef int T; typedef int T; T x;").is_ok());
        assert!(parse("typedef int T; typedef long long T;").is_err());
    }

    #[test]
    fn test_statement_expression() {
        let unit = parse("int main(void) { return ({ int x = 2; x + 1; }); }");
        assert!(unit.is_ok());
    }

    #[test]
    fn test_variadic_prototype() {
        let unit = parse("int printf(const char *fmt, ...); int main(void) { return 0; }");
        assert!(unit.is_ok());
    }

    #[test]
    fn test_static_local_hoisted_to_globals() {
        let unit = parse("int bump(void) { static int n = 1; return n; }").unwrap();
        assert_eq!(unit.globals.len(), 1);
        assert_eq!(unit.functions.len(), 1);
    }
}
