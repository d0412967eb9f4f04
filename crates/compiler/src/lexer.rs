//! Lexer for preprocessed C.
//!
//! The input is one translation unit as produced by the preprocessor: no
//! comments, no macros, only `#line` and `#pragma` directives remain. The
//! lexer keeps a single look-ahead token plus a one-token push-back queue
//! for the parser.
//!
//! Line endings: LF and CRLF are accepted, a lone CR is a fatal error.
//! `#line` updates the current filename and line counter so tokens carry
//! the location of the original source, not of the `.i` file.

use std::rc::Rc;

use crate::error::CompileError;
use crate::strings::{Interner, Name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Identifier or keyword.
    Alphanumeric,
    /// Number literal, still in source form; the parser decodes it.
    Number,
    /// Character literal body (escapes undecoded, quotes stripped).
    Character,
    /// String literal body (escapes undecoded, quotes stripped).
    String,
    Punctuation,
    End,
}

/// A token. Shared by the lexer, parser, AST, and code generator through
/// `Rc`, so diagnostics and debug line info can point back at it.
#[derive(Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub text: Name,
    /// Literal prefix (`L`, `u`, `U`, `u8`) glued to a string or character
    /// literal. Recognised so the parser can reject it cleanly.
    pub prefix: Option<Name>,
    pub file: Name,
    /// 1-based line number.
    pub line: u32,
}

impl Token {
    pub fn is_identifier(&self) -> bool {
        self.kind == TokenKind::Alphanumeric && !is_keyword(&self.text)
    }
}

impl PartialEq<str> for Token {
    fn eq(&self, other: &str) -> bool {
        self.text == *other
    }
}

/// C17 keywords plus the GNU spellings this compiler recognises.
pub fn is_keyword(word: &str) -> bool {
    matches!(
        word,
        "auto"
            | "break"
            | "case"
            | "char"
            | "const"
            | "continue"
            | "default"
            | "do"
            | "double"
            | "else"
            | "enum"
            | "extern"
            | "float"
            | "for"
            | "goto"
            | "if"
            | "inline"
            | "int"
            | "long"
            | "register"
            | "restrict"
            | "return"
            | "short"
            | "signed"
            | "sizeof"
            | "static"
            | "struct"
            | "switch"
            | "typedef"
            | "union"
            | "unsigned"
            | "void"
            | "volatile"
            | "while"
            | "_Alignas"
            | "_Alignof"
            | "_Atomic"
            | "_Bool"
            | "_Complex"
            | "_Noreturn"
            | "_Static_assert"
            | "_Thread_local"
            | "__asm__"
            | "__restrict"
            | "__inline"
    )
}

const PUNCT3: &[&str] = &["<<=", ">>=", "..."];
const PUNCT2: &[&str] = &[
    "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=",
];
const PUNCT1: &[u8] = b"+-*/%&|^!~<>=()[]{}.?:,;";

pub struct Lexer {
    bytes: Vec<u8>,
    pos: usize,
    interner: Rc<Interner>,
    file: Name,
    line: u32,
    current: Rc<Token>,
    pushed_back: Option<Rc<Token>>,
}

impl Lexer {
    pub fn new(
        bytes: Vec<u8>,
        filename: &str,
        interner: Rc<Interner>,
    ) -> Result<Self, CompileError> {
        let file = interner.intern(filename);
        let end = Rc::new(Token {
            kind: TokenKind::End,
            text: interner.intern(""),
            prefix: None,
            file: file.clone(),
            line: 1,
        });
        let mut lexer = Lexer {
            bytes,
            pos: 0,
            interner,
            file,
            line: 1,
            current: end,
            pushed_back: None,
        };
        lexer.current = lexer.scan()?;
        Ok(lexer)
    }

    pub fn interner(&self) -> &Rc<Interner> {
        &self.interner
    }

    /// The look-ahead token.
    pub fn current(&self) -> &Rc<Token> {
        &self.current
    }

    /// Advance to the next token.
    pub fn consume(&mut self) -> Result<(), CompileError> {
        self.current = match self.pushed_back.take() {
            Some(token) => token,
            None => self.scan()?,
        };
        Ok(())
    }

    /// Return the current token and advance past it.
    pub fn take(&mut self) -> Result<Rc<Token>, CompileError> {
        let token = Rc::clone(&self.current);
        self.consume()?;
        Ok(token)
    }

    /// Undo one `take`. The queue holds a single token.
    pub fn push_back(&mut self, token: Rc<Token>) {
        debug_assert!(self.pushed_back.is_none(), "push-back queue overflow");
        self.pushed_back = Some(Rc::clone(&self.current));
        self.current = token;
    }

    /// Does the current token spell `s`? Only identifiers, keywords, and
    /// punctuation match; literals never do.
    pub fn is(&self, s: &str) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Alphanumeric | TokenKind::Punctuation
        ) && self.current.text == *s
    }

    /// Consume the current token if it spells `s`.
    pub fn accept(&mut self, s: &str) -> Result<bool, CompileError> {
        if self.is(s) {
            self.consume()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Consume the current token if it spells `s`, otherwise fail with `msg`.
    pub fn expect(&mut self, s: &str, msg: &str) -> Result<Rc<Token>, CompileError> {
        if self.is(s) {
            return self.take();
        }
        Err(CompileError::parse(msg.to_string(), &self.current))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn lex_error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::lex(msg, &self.file, self.line)
    }

    /// Skip whitespace and directives, normalising line endings.
    fn skip_blanks(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(0x0b) | Some(0x0c) => {
                    self.pos += 1;
                }
                Some(b'\r') => {
                    if self.peek_at(1) == Some(b'\n') {
                        self.pos += 2;
                        self.line += 1;
                    } else {
                        return Err(self.lex_error("lone carriage return in input"));
                    }
                }
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some(b'#') => {
                    self.pos += 1;
                    self.directive()?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Handle `#line` and `#pragma`. Anything else surviving preprocessing
    /// is malformed input.
    fn directive(&mut self) -> Result<(), CompileError> {
        while self.peek() == Some(b' ') || self.peek() == Some(b'\t') {
            self.pos += 1;
        }
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        match word {
            "line" => self.line_directive(),
            "pragma" => {
                self.skip_to_line_end()?;
                Ok(())
            }
            _ => Err(self.lex_error(format!("unsupported preprocessor directive '#{}'", word))),
        }
    }

    fn line_directive(&mut self) -> Result<(), CompileError> {
        while self.peek() == Some(b' ') || self.peek() == Some(b'\t') {
            self.pos += 1;
        }
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.lex_error("#line directive without a line number"));
        }
        let digits = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        let number: u32 = digits
            .parse()
            .map_err(|_| self.lex_error("#line number out of range"))?;

        while self.peek() == Some(b' ') || self.peek() == Some(b'\t') {
            self.pos += 1;
        }
        if self.peek() == Some(b'"') {
            self.pos += 1;
            let name_start = self.pos;
            while let Some(b) = self.peek() {
                if b == b'"' || b == b'\n' {
                    break;
                }
                self.pos += 1;
            }
            if self.peek() != Some(b'"') {
                return Err(self.lex_error("unterminated filename in #line directive"));
            }
            let name = std::str::from_utf8(&self.bytes[name_start..self.pos])
                .map_err(|_| self.lex_error("filename in #line directive is not UTF-8"))?;
            self.file = self.interner.intern(name);
            self.pos += 1;
        }
        self.skip_to_line_end()?;
        // The directive names the line that follows it.
        self.line = number;
        Ok(())
    }

    /// Skip to and past the end of the current line without counting it.
    fn skip_to_line_end(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                None => return Ok(()),
                Some(b'\n') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(b'\r') => {
                    if self.peek_at(1) == Some(b'\n') {
                        self.pos += 2;
                        return Ok(());
                    }
                    return Err(self.lex_error("lone carriage return in input"));
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn scan(&mut self) -> Result<Rc<Token>, CompileError> {
        self.skip_blanks()?;
        let line = self.line;
        let file = self.file.clone();

        let Some(b) = self.peek() else {
            return Ok(self.make(TokenKind::End, "", None, file, line));
        };

        if b.is_ascii_alphabetic() || b == b'_' || b == b'$' {
            return self.scan_word(file, line);
        }
        if b.is_ascii_digit() {
            return self.scan_number(file, line);
        }
        if b == b'"' {
            let body = self.scan_quoted(b'"', "string")?;
            return Ok(self.make(TokenKind::String, &body, None, file, line));
        }
        if b == b'\'' {
            let body = self.scan_quoted(b'\'', "character")?;
            return Ok(self.make(TokenKind::Character, &body, None, file, line));
        }
        self.scan_punctuation(file, line)
    }

    fn make(
        &self,
        kind: TokenKind,
        text: &str,
        prefix: Option<Name>,
        file: Name,
        line: u32,
    ) -> Rc<Token> {
        Rc::new(Token {
            kind,
            text: self.interner.intern(text),
            prefix,
            file,
            line,
        })
    }

    fn scan_word(&mut self, file: Name, line: u32) -> Result<Rc<Token>, CompileError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        {
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.lex_error("identifier is not valid UTF-8"))?
            .to_string();

        // A quote glued to an identifier is a literal prefix (L"...").
        if matches!(word.as_str(), "L" | "u" | "U" | "u8") {
            if self.peek() == Some(b'"') {
                let prefix = self.interner.intern(&word);
                let body = self.scan_quoted(b'"', "string")?;
                return Ok(self.make(TokenKind::String, &body, Some(prefix), file, line));
            }
            if self.peek() == Some(b'\'') {
                let prefix = self.interner.intern(&word);
                let body = self.scan_quoted(b'\'', "character")?;
                return Ok(self.make(TokenKind::Character, &body, Some(prefix), file, line));
            }
        }
        Ok(self.make(TokenKind::Alphanumeric, &word, None, file, line))
    }

    fn scan_number(&mut self, file: Name, line: u32) -> Result<Rc<Token>, CompileError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'.' {
                self.pos += 1;
                // Exponent signs belong to the number: 1e+5, 0x1p-3. In a
                // hex literal only p/P starts an exponent (0xE+2 is 0xE + 2).
                let hex = self.bytes[start..].starts_with(b"0x")
                    || self.bytes[start..].starts_with(b"0X");
                let starts_exponent = if hex {
                    matches!(b, b'p' | b'P')
                } else {
                    matches!(b, b'e' | b'E')
                };
                if starts_exponent && matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .unwrap()
            .to_string();
        Ok(self.make(TokenKind::Number, &text, None, file, line))
    }

    /// Scan a quoted literal body. Escapes are left undecoded; the parser
    /// calls [`decode_escapes`] when it needs the bytes.
    fn scan_quoted(&mut self, quote: u8, what: &str) -> Result<String, CompileError> {
        self.pos += 1; // opening quote
        let start = self.pos;
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.lex_error(format!("unterminated {} literal", what)));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    if matches!(self.peek(), None | Some(b'\n') | Some(b'\r')) {
                        return Err(self.lex_error(format!("unterminated {} literal", what)));
                    }
                    self.pos += 1;
                }
                Some(b) if b == quote => break,
                Some(_) => self.pos += 1,
            }
        }
        let body = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.lex_error(format!("{} literal is not valid UTF-8", what)))?
            .to_string();
        self.pos += 1; // closing quote
        Ok(body)
    }

    fn scan_punctuation(&mut self, file: Name, line: u32) -> Result<Rc<Token>, CompileError> {
        for p in PUNCT3 {
            if self.bytes[self.pos..].starts_with(p.as_bytes()) {
                self.pos += 3;
                return Ok(self.make(TokenKind::Punctuation, p, None, file, line));
            }
        }
        for p in PUNCT2 {
            if self.bytes[self.pos..].starts_with(p.as_bytes()) {
                self.pos += 2;
                return Ok(self.make(TokenKind::Punctuation, p, None, file, line));
            }
        }
        let b = self.bump().unwrap();
        if PUNCT1.contains(&b) {
            let s = (b as char).to_string();
            return Ok(self.make(TokenKind::Punctuation, &s, None, file, line));
        }
        Err(self.lex_error(format!("unrecognised byte 0x{:02x} in input", b)))
    }
}

/// Decode the escape sequences of a string or character literal body into
/// raw bytes.
///
/// Accepted escapes: `\a \b \t \n \v \f \r \e \" \' \? \\`, one to three
/// octal digits, and `\xHH`. Unicode escapes are rejected.
pub fn decode_escapes(raw: &str, token: &Rc<Token>) -> Result<Vec<u8>, CompileError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&esc) = bytes.get(i) else {
            return Err(CompileError::parse("dangling backslash in literal", token));
        };
        i += 1;
        match esc {
            b'a' => out.push(7),
            b'b' => out.push(8),
            b't' => out.push(9),
            b'n' => out.push(10),
            b'v' => out.push(11),
            b'f' => out.push(12),
            b'r' => out.push(13),
            b'e' => out.push(27),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'?' => out.push(b'?'),
            b'\\' => out.push(b'\\'),
            b'0'..=b'7' => {
                let mut value = (esc - b'0') as u32;
                let mut digits = 1;
                while digits < 3 && bytes.get(i).is_some_and(|b| (b'0'..=b'7').contains(b)) {
                    value = value * 8 + (bytes[i] - b'0') as u32;
                    i += 1;
                    digits += 1;
                }
                if value > 255 {
                    return Err(CompileError::parse(
                        format!("octal escape \\{:o} does not fit in a byte", value),
                        token,
                    ));
                }
                out.push(value as u8);
            }
            b'x' => {
                let start = i;
                let mut value: u32 = 0;
                while let Some(b) = bytes.get(i) {
                    let digit = match b {
                        b'0'..=b'9' => b - b'0',
                        b'a'..=b'f' => b - b'a' + 10,
                        b'A'..=b'F' => b - b'A' + 10,
                        _ => break,
                    };
                    value = value * 16 + digit as u32;
                    if value > 255 {
                        return Err(CompileError::parse(
                            "hex escape does not fit in a byte",
                            token,
                        ));
                    }
                    i += 1;
                }
                if i == start {
                    return Err(CompileError::parse("\\x escape without hex digits", token));
                }
                out.push(value as u8);
            }
            b'u' | b'U' => {
                return Err(CompileError::unsupported(
                    "unicode escape sequences are not supported",
                    token,
                ));
            }
            other => {
                return Err(CompileError::parse(
                    format!("unknown escape sequence '\\{}'", other as char),
                    token,
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexer(source: &str) -> Lexer {
        Lexer::new(
            source.as_bytes().to_vec(),
            "test.i",
            Rc::new(Interner::new()),
        )
        .unwrap()
    }

    fn all_tokens(source: &str) -> Vec<String> {
        let mut lexer = lexer(source);
        let mut out = Vec::new();
        while lexer.current().kind != TokenKind::End {
            out.push(lexer.current().text.to_string());
            lexer.consume().unwrap();
        }
        out
    }

    #[test]
    fn test_identifiers_and_punctuation() {
        assert_eq!(
            all_tokens("int main(void) { return 0; }"),
            vec!["int", "main", "(", "void", ")", "{", "return", "0", ";", "}"]
        );
    }

    #[test]
    fn test_longest_punctuation_wins() {
        assert_eq!(
            all_tokens("a <<= b >> c >= d"),
            vec!["a", "<<=", "b", ">>", "c", ">=", "d"]
        );
        assert_eq!(all_tokens("x->y ... z"), vec!["x", "->", "y", "...", "z"]);
    }

    #[test]
    fn test_number_globbing() {
        assert_eq!(
            all_tokens("0x1f 1.5e+3 10ull"),
            vec!["0x1f", "1.5e+3", "10ull"]
        );
        // 0xE+2 is three tokens: a hex literal, plus, a decimal literal.
        assert_eq!(all_tokens("0xE+2"), vec!["0xE", "+", "2"]);
    }

    #[test]
    fn test_string_keeps_escapes_raw() {
        let mut lexer = lexer(r#""a\n\"b""#);
        let token = lexer.take().unwrap();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.text.as_str(), r#"a\n\"b"#);
    }

    #[test]
    fn test_line_tracking_and_line_directive() {
        let mut lexer = lexer("a\nb\n#line 10 \"other.c\"\nc\n");
        assert_eq!(lexer.current().line, 1);
        lexer.consume().unwrap();
        assert_eq!(lexer.current().line, 2);
        lexer.consume().unwrap();
        assert_eq!(lexer.current().line, 10);
        assert_eq!(lexer.current().file.as_str(), "other.c");
    }

    #[test]
    fn test_pragma_skipped() {
        assert_eq!(all_tokens("#pragma once\nx"), vec!["x"]);
    }

    #[test]
    fn test_crlf_accepted_lone_cr_rejected() {
        assert_eq!(all_tokens("a\r\nb"), vec!["a", "b"]);
        let result = Lexer::new(b"a\rb".to_vec(), "t.i", Rc::new(Interner::new())).and_then(
            |mut l| {
                l.consume()?;
                Ok(())
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unterminated_string() {
        let result = Lexer::new(b"\"abc".to_vec(), "t.i", Rc::new(Interner::new()));
        assert!(result.is_err());
        let message = result.err().unwrap().to_string();
        assert!(message.contains("unterminated string"));
    }

    #[test]
    fn test_push_back() {
        let mut lexer = lexer("a b c");
        let a = lexer.take().unwrap();
        assert!(lexer.is("b"));
        lexer.push_back(a);
        assert!(lexer.is("a"));
        lexer.consume().unwrap();
        assert!(lexer.is("b"));
        lexer.consume().unwrap();
        assert!(lexer.is("c"));
    }

    #[test]
    fn test_accept_and_expect() {
        let mut lexer = lexer("( )");
        assert!(lexer.accept("(").unwrap());
        assert!(!lexer.accept("(").unwrap());
        assert!(lexer.expect(")", "expected ')'").is_ok());
    }

    #[test]
    fn test_string_prefix_marked() {
        let mut lexer = lexer("L\"wide\"");
        let token = lexer.take().unwrap();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.prefix.as_ref().unwrap().as_str(), "L");
    }

    #[test]
    fn test_decode_escapes() {
        let token = lexer("x").take().unwrap();
        assert_eq!(decode_escapes(r"a\tb", &token).unwrap(), b"a\tb");
        assert_eq!(decode_escapes(r"\101\x42", &token).unwrap(), b"AB");
        assert_eq!(decode_escapes(r"\0", &token).unwrap(), vec![0]);
        assert!(decode_escapes(r"\q", &token).is_err());
        assert!(decode_escapes(r"\u1234", &token).is_err());
    }
}
