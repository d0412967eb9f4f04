//! Statement parsing.
//!
//! Case and default labels are collected into the innermost switch frame
//! as they are parsed, each with a synthesised label id; the code
//! generator numbers its own labels after the parser's.

use std::rc::Rc;

use super::{Parser, SwitchFrame};
use crate::ast::{Expr, ExprKind, Stmt};
use crate::error::CompileError;
use crate::lexer::{Token, TokenKind};
use crate::types::Type;

impl Parser {
    pub(super) fn parse_statement(&mut self) -> Result<Stmt, CompileError> {
        // goto label: an identifier directly followed by ':'.
        if self.current().is_identifier() {
            let token = self.lexer.take()?;
            if self.lexer.is(":") {
                self.lexer.consume()?;
                if let Some(ctx) = self.fn_ctx.as_mut() {
                    if ctx.labels_defined.contains(&token.text) {
                        return Err(CompileError::semantic(
                            format!("duplicate label '{}'", token.text),
                            &token,
                        ));
                    }
                    ctx.labels_defined.push(token.text.clone());
                }
                let body = self.parse_statement()?;
                return Ok(Stmt::Labeled {
                    name: token.text.clone(),
                    body: Box::new(body),
                });
            }
            self.lexer.push_back(token);
        }

        if self.lexer.is("{") {
            return self.parse_block();
        }
        if self.lexer.is("if") {
            return self.parse_if();
        }
        if self.lexer.is("while") {
            return self.parse_while();
        }
        if self.lexer.is("do") {
            return self.parse_do_while();
        }
        if self.lexer.is("for") {
            return self.parse_for();
        }
        if self.lexer.is("switch") {
            return self.parse_switch();
        }
        if self.lexer.is("case") {
            return self.parse_case();
        }
        if self.lexer.is("default") {
            return self.parse_default();
        }
        if self.lexer.is("break") {
            let token = self.lexer.take()?;
            self.lexer.expect(";", "expected ';' after break")?;
            return Ok(Stmt::Break { token });
        }
        if self.lexer.is("continue") {
            let token = self.lexer.take()?;
            self.lexer.expect(";", "expected ';' after continue")?;
            return Ok(Stmt::Continue { token });
        }
        if self.lexer.is("goto") {
            let token = self.lexer.take()?;
            let name = self.lexer.take()?;
            if !name.is_identifier() {
                return Err(CompileError::parse("expected a label after goto", &name));
            }
            self.lexer.expect(";", "expected ';' after goto")?;
            if let Some(ctx) = self.fn_ctx.as_mut() {
                ctx.labels_used.push((name.text.clone(), Rc::clone(&token)));
            }
            return Ok(Stmt::Goto {
                name: name.text.clone(),
                token,
            });
        }
        if self.lexer.is("return") {
            return self.parse_return();
        }
        if self.lexer.accept(";")? {
            return Ok(Stmt::Empty);
        }
        if self.starts_declaration() {
            return self.parse_local_declaration();
        }

        let expr = self.parse_expr()?;
        self.lexer.expect(";", "expected ';' after expression")?;
        Ok(Stmt::Expr(expr))
    }

    fn parse_block(&mut self) -> Result<Stmt, CompileError> {
        self.lexer.expect("{", "expected '{'")?;
        self.scopes.push();
        let mut stmts = Vec::new();
        while !self.lexer.accept("}")? {
            if self.current().kind == TokenKind::End {
                return Err(self.parse_error("unexpected end of input in block"));
            }
            stmts.push(self.parse_statement()?);
        }
        self.scopes.pop()?;
        Ok(Stmt::Block(stmts))
    }

    fn parse_condition(&mut self) -> Result<Expr, CompileError> {
        self.lexer.expect("(", "expected '(' before condition")?;
        let cond = self.parse_expr()?.decay();
        if !cond.ty.is_scalar() {
            return Err(CompileError::semantic(
                "condition must have scalar type",
                &cond.token,
            ));
        }
        let cond = cond.to_predicate();
        self.lexer.expect(")", "expected ')' after condition")?;
        Ok(cond)
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        self.lexer.expect("if", "expected 'if'")?;
        let cond = self.parse_condition()?;
        let then_body = Box::new(self.parse_statement()?);
        let else_body = if self.lexer.accept("else")? {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, CompileError> {
        self.lexer.expect("while", "expected 'while'")?;
        let cond = self.parse_condition()?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn parse_do_while(&mut self) -> Result<Stmt, CompileError> {
        self.lexer.expect("do", "expected 'do'")?;
        let body = Box::new(self.parse_statement()?);
        self.lexer.expect("while", "expected 'while' after do body")?;
        let cond = self.parse_condition()?;
        self.lexer.expect(";", "expected ';' after do-while")?;
        Ok(Stmt::DoWhile { body, cond })
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        self.lexer.expect("for", "expected 'for'")?;
        self.lexer.expect("(", "expected '(' after for")?;
        // C99 scope: a declaration in the init clause is visible in the
        // whole loop.
        self.scopes.push();

        let init = if self.lexer.accept(";")? {
            None
        } else if self.starts_declaration() {
            Some(Box::new(self.parse_local_declaration()?))
        } else {
            let expr = self.parse_expr()?;
            self.lexer.expect(";", "expected ';' after for initialiser")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let cond = if self.lexer.is(";") {
            None
        } else {
            let cond = self.parse_expr()?.decay().to_predicate();
            Some(cond)
        };
        self.lexer.expect(";", "expected ';' after for condition")?;

        let step = if self.lexer.is(")") {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.lexer.expect(")", "expected ')' after for clauses")?;

        let body = Box::new(self.parse_statement()?);
        self.scopes.pop()?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn parse_switch(&mut self) -> Result<Stmt, CompileError> {
        self.lexer.expect("switch", "expected 'switch'")?;
        self.lexer.expect("(", "expected '(' after switch")?;
        let cond = self.parse_expr()?.decay();
        if !cond.ty.is_integer() {
            return Err(CompileError::semantic(
                "switch condition must have integer type",
                &cond.token,
            ));
        }
        // The comparison chain works on 32-bit words; wider conditions are
        // truncated.
        let cond = if cond.ty.is_long_long() {
            cond.cast_to(Type::int())
        } else {
            cond.promote()
        };
        self.lexer.expect(")", "expected ')' after switch condition")?;

        self.switches.push(SwitchFrame {
            cases: Vec::new(),
            default: None,
        });
        let body = Box::new(self.parse_statement()?);
        let frame = self
            .switches
            .pop()
            .expect("switch frame pushed above");
        Ok(Stmt::Switch {
            cond,
            cases: frame.cases,
            default: frame.default,
            body,
        })
    }

    fn parse_case(&mut self) -> Result<Stmt, CompileError> {
        let token = self.lexer.take()?;
        let value = self.parse_const_expr()?;
        self.lexer.expect(":", "expected ':' after case value")?;
        let label = self.alloc_label()?;

        // Compare as 32-bit words: normalise the value's bit pattern.
        let value = value as i32 as i64;
        let frame = self.innermost_switch(&token)?;
        if frame.cases.iter().any(|(v, _)| *v == value) {
            return Err(CompileError::semantic(
                format!("duplicate case value {}", value),
                &token,
            ));
        }
        frame.cases.push((value, label));

        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::Case { label, body })
    }

    fn parse_default(&mut self) -> Result<Stmt, CompileError> {
        let token = self.lexer.take()?;
        self.lexer.expect(":", "expected ':' after default")?;
        let label = self.alloc_label()?;
        let frame = self.innermost_switch(&token)?;
        if frame.default.is_some() {
            return Err(CompileError::semantic(
                "multiple default labels in one switch",
                &token,
            ));
        }
        frame.default = Some(label);
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::Default { label, body })
    }

    fn innermost_switch(
        &mut self,
        token: &Rc<Token>,
    ) -> Result<&mut SwitchFrame, CompileError> {
        self.switches.last_mut().ok_or_else(|| {
            CompileError::semantic("case label outside of a switch", token)
        })
    }

    fn parse_return(&mut self) -> Result<Stmt, CompileError> {
        let token = self.lexer.take()?;
        let ret = self
            .return_type()
            .ok_or_else(|| CompileError::internal("return outside a function"))?;

        if self.lexer.accept(";")? {
            return Ok(Stmt::Return { value: None, token });
        }
        let value = self.parse_expr()?.decay();
        if ret.is_void() {
            return Err(CompileError::semantic(
                "return with a value in a void function",
                &token,
            ));
        }
        let value = self.assign_convert(value, &ret)?;
        self.lexer.expect(";", "expected ';' after return value")?;
        Ok(Stmt::Return {
            value: Some(value),
            token,
        })
    }

    /// GNU statement expression `({ ... })`; the opening parenthesis is
    /// already consumed and the current token is `{`.
    pub(super) fn parse_statement_expression(
        &mut self,
        open: Rc<Token>,
    ) -> Result<Expr, CompileError> {
        self.lexer.expect("{", "expected '{' in statement expression")?;
        self.scopes.push();
        let mut stmts = Vec::new();
        while !self.lexer.accept("}")? {
            if self.current().kind == TokenKind::End {
                return Err(self.parse_error("unexpected end of input in statement expression"));
            }
            stmts.push(self.parse_statement()?);
        }
        self.scopes.pop()?;
        self.lexer
            .expect(")", "expected ')' after statement expression")?;

        // The last expression statement provides the value and type;
        // otherwise the whole expression is void.
        let ty = match stmts.last() {
            Some(Stmt::Expr(expr)) if !expr.ty.is_void() => Rc::clone(&expr.ty),
            _ => Type::void(),
        };
        Ok(Expr::new(ExprKind::StmtExpr(stmts), ty, open))
    }
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

    fn main_body(source: &str) -> Vec<Stmt> {
        let mut unit = parse(source).unwrap();
        unit.functions.remove(0).body
    }

    #[test]
    fn test_control_flow_forms() {
        let source = r#"
            int main(void) {
                int i;
                for (i = 0; i < 10; i++) { if (i == 5) break; else continue; }
                while (i) { i--; }
                do { i++; } while (i < 3);
                goto out;
            out:
                return i;
            }
        "#;
        assert!(parse(source).is_ok());
    }

    #[test]
    fn test_switch_collects_cases() {
        let source = r#"
            int classify(int c) {
                switch (c) {
                case 1: return 10;
                case 2: return 20;
                default: return -1;
                }
            }
        "#;
        let unit = parse(source).unwrap();
        let body = &unit.functions[0].body;
        let Stmt::Switch { cases, default, .. } = &body[0] else {
            panic!("expected a switch statement");
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].0, 1);
        assert_eq!(cases[1].0, 2);
        assert!(default.is_some());
        assert_eq!(unit.functions[0].label_count, 3);
    }

    #[test]
    fn test_duplicate_case_rejected() {
        let source = "int f(int c) { switch (c) { case 1: case 1: return 0; } return 1; }";
        assert!(parse(source).is_err());
    }

    #[test]
    fn test_case_outside_switch_rejected() {
        assert!(parse("int f(void) { case 1: return 0; }").is_err());
    }

    #[test]
    fn test_nested_switch_targets_inner() {
        let source = r#"
            int f(int a, int b) {
                switch (a) {
                case 1:
                    switch (b) { case 9: return 99; }
                    return 1;
                }
                return 0;
            }
        "#;
        let unit = parse(source).unwrap();
        let Stmt::Switch { cases, .. } = &unit.functions[0].body[0] else {
            panic!("expected a switch");
        };
        // The outer switch owns only its own case.
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].0, 1);
    }

    #[test]
    fn test_for_declaration_scoped_to_loop() {
        let source = "int f(void) { for (int i = 0; i < 3; i++) {} return i; }";
        // i is out of scope after the loop.
        assert!(parse(source).is_err());
    }

    #[test]
    fn test_return_conversions() {
        assert!(parse("char f(void) { return 300; }").is_ok());
        assert!(parse("void f(void) { return 1; }").is_err());
        assert!(parse("int f(void) { return; }").is_ok());
    }

    #[test]
    fn test_statement_expression_type() {
        let body = main_body("int main(void) { return ({ 1; 2; 3; }); }");
        let Stmt::Return { value: Some(expr), .. } = &body[0] else {
            panic!("expected return with a value");
        };
        assert!(expr.ty.is_integer() || matches!(expr.kind, ExprKind::Cast(_)));
    }

    #[test]
    fn test_empty_statement_expression_is_void() {
        assert!(parse("int main(void) { return ({ ; }); }").is_err());
    }

    #[test]
    fn test_undefined_goto_label_rejected() {
        assert!(parse("int f(void) { goto nowhere; return 0; }").is_err());
    }

    #[test]
    fn test_duplicate_label_rejected() {
        assert!(parse("int f(void) { x: ; x: ; return 0; }").is_err());
    }

    #[test]
    fn test_labels_are_per_function() {
        let source = "int f(void) { top: return 0; } int g(void) { top: return 1; }";
        assert!(parse(source).is_ok());
    }

    #[test]
    fn test_labels_and_goto() {
        let source = r#"
            int f(void) {
                int n = 0;
            again:
                n++;
                if (n < 3) goto again;
                return n;
            }
        "#;
        assert!(parse(source).is_ok());
    }
}
