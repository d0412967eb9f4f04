//! Compiler error types.
//!
//! One taxonomy for the whole pipeline. Every error is fatal: the driver
//! prints a single diagnostic and exits non-zero. Warnings are not errors;
//! they are printed by the component that detects them and compilation
//! continues.

use std::rc::Rc;

use crate::lexer::Token;

/// Classification of a fatal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Impossible state; indicates a compiler bug.
    Internal,
    /// Malformed byte sequence, unterminated literal, malformed directive.
    Lex,
    /// Unexpected token or disallowed construct.
    Parse,
    /// Type mismatch, duplicate declaration, missing symbol, invalid
    /// specifier combination.
    Semantic,
    /// A recognised construct the compiler deliberately does not support.
    Unsupported,
    /// Input or output file failure.
    Io,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Internal => "internal error",
            _ => "error",
        }
    }
}

/// A fatal compiler diagnostic with optional source attribution.
#[derive(Debug)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    /// Source filename, if known.
    pub file: Option<String>,
    /// 1-based source line, if known.
    pub line: Option<u32>,
    /// Text of the offending token, if any.
    pub token: Option<String>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            file: None,
            line: None,
            token: None,
        }
    }

    /// Attach the location and text of a token to an error.
    pub fn at(mut self, token: &Rc<Token>) -> Self {
        self.file = Some(token.file.to_string());
        self.line = Some(token.line);
        if !token.text.is_empty() {
            self.token = Some(token.text.to_string());
        }
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::new(ErrorKind::Internal, message)
    }

    pub fn lex(message: impl Into<String>, file: &str, line: u32) -> Self {
        let mut e = CompileError::new(ErrorKind::Lex, message);
        e.file = Some(file.to_string());
        e.line = Some(line);
        e
    }

    pub fn parse(message: impl Into<String>, token: &Rc<Token>) -> Self {
        CompileError::new(ErrorKind::Parse, message).at(token)
    }

    pub fn semantic(message: impl Into<String>, token: &Rc<Token>) -> Self {
        CompileError::new(ErrorKind::Semantic, message).at(token)
    }

    pub fn unsupported(message: impl Into<String>, token: &Rc<Token>) -> Self {
        CompileError::new(ErrorKind::Unsupported, message).at(token)
    }

    pub fn io(message: impl Into<String>) -> Self {
        CompileError::new(ErrorKind::Io, message)
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: ", file, line)?,
            (Some(file), None) => write!(f, "{}: ", file)?,
            _ => {}
        }
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        if let Some(token) = &self.token {
            write!(f, " at '{}'", token)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

impl From<std::fmt::Error> for CompileError {
    fn from(e: std::fmt::Error) -> Self {
        CompileError::internal(format!("assembly formatting failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_location() {
        let e = CompileError::new(ErrorKind::Semantic, "duplicate definition");
        assert_eq!(format!("{}", e), "error: duplicate definition");
    }

    #[test]
    fn test_display_internal() {
        let e = CompileError::internal("no current function");
        assert_eq!(format!("{}", e), "internal error: no current function");
    }

    #[test]
    fn test_display_with_file_and_line() {
        let mut e = CompileError::new(ErrorKind::Lex, "unterminated string literal");
        e.file = Some("t.i".to_string());
        e.line = Some(12);
        assert_eq!(format!("{}", e), "t.i:12: error: unterminated string literal");
    }

    #[test]
    fn test_display_with_token() {
        let mut e = CompileError::new(ErrorKind::Parse, "expected ';'");
        e.file = Some("t.i".to_string());
        e.line = Some(3);
        e.token = Some("}".to_string());
        assert_eq!(format!("{}", e), "t.i:3: error: expected ';' at '}'");
    }
}
