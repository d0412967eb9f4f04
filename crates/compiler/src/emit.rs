//! Assembly serialisation.
//!
//! The output is a stream of whitespace-separated terms. Label sigils:
//! `@` defines a symbol (functions, string constants), `=` defines a
//! global variable, `^` references a symbol's address, `&` references an
//! intra-function label, and `:` defines one. Small immediates are
//! decimal, everything else is `0x%08x`. Byte data is written as
//! double-quoted printable runs with `'HH` quoted bytes. Three blank
//! newlines separate the globals.
//!
//! With debug enabled the stream starts with `#line manual`; each source
//! line change becomes `#line N "file"`, and a lone `#` bumps the line by
//! one.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::codegen::{AsmItem, AsmProgram, DataTerm, Ins, Operand};
use crate::config::Options;
use crate::error::CompileError;
use crate::lexer::Token;

pub fn serialize(program: &AsmProgram, options: &Options) -> Result<String, CompileError> {
    let mut emitter = Emitter {
        out: String::new(),
        debug: options.debug_lines,
        last_file: None,
        last_line: 0,
    };
    emitter.program(program)?;
    Ok(emitter.out)
}

struct Emitter {
    out: String,
    debug: bool,
    last_file: Option<String>,
    last_line: u32,
}

impl Emitter {
    fn program(&mut self, program: &AsmProgram) -> Result<(), CompileError> {
        if self.debug {
            writeln!(self.out, "#line manual")?;
        }
        for (i, item) in program.items.iter().enumerate() {
            if i > 0 {
                self.out.push_str("\n\n\n");
            }
            match item {
                AsmItem::Variable { name, data } => {
                    writeln!(self.out, "={}", name)?;
                    self.data(data)?;
                }
                AsmItem::Function { name, blocks } => {
                    writeln!(self.out, "@{}", name)?;
                    for block in blocks {
                        if let Some(label) = &block.label {
                            writeln!(self.out, ":{}", label)?;
                        }
                        for ins in &block.ins {
                            self.instruction(ins)?;
                        }
                    }
                }
                AsmItem::StringConstant { name, bytes } => {
                    writeln!(self.out, "@{}", name)?;
                    writeln!(self.out, "    {}", render_bytes(bytes))?;
                }
            }
        }
        Ok(())
    }

    fn instruction(&mut self, ins: &Ins) -> Result<(), CompileError> {
        if self.debug
            && let Some(token) = &ins.token
        {
            self.line_directive(token)?;
        }
        write!(self.out, "    {}", ins.op.mnemonic())?;
        for operand in &ins.operands {
            match operand {
                Operand::Reg(reg) => write!(self.out, " {}", reg.name())?,
                Operand::Imm(value) => write!(self.out, " {}", value)?,
                Operand::Imm32(value) => {
                    if (-127..=127).contains(value) {
                        write!(self.out, " {}", value)?;
                    } else {
                        write!(self.out, " 0x{:08x}", *value as u32)?;
                    }
                }
                Operand::Sym { sigil, name } => write!(self.out, " {}{}", sigil, name)?,
            }
        }
        self.out.push('\n');
        Ok(())
    }

    fn line_directive(&mut self, token: &Rc<Token>) -> Result<(), CompileError> {
        let file = token.file.as_str();
        let line = token.line;
        let same_file = self.last_file.as_deref() == Some(file);
        if same_file && line == self.last_line {
            return Ok(());
        }
        if same_file && line == self.last_line + 1 {
            writeln!(self.out, "#")?;
        } else {
            writeln!(self.out, "#line {} {:?}", line, file)?;
        }
        self.last_file = Some(file.to_string());
        self.last_line = line;
        Ok(())
    }

    fn data(&mut self, terms: &[DataTerm]) -> Result<(), CompileError> {
        for term in terms {
            match term {
                DataTerm::Word(value) => writeln!(self.out, "    0x{:08x}", value)?,
                DataTerm::Addr(name) => writeln!(self.out, "    ^{}", name)?,
                DataTerm::Bytes(bytes) => writeln!(self.out, "    {}", render_bytes(bytes))?,
                DataTerm::Zeroes(count) => {
                    let words = count / 4;
                    let rest = count % 4;
                    // Keep the image readable: at most eight zero words
                    // per line.
                    let mut written = 0;
                    while written < words {
                        let chunk = (words - written).min(8);
                        let line: Vec<&str> = (0..chunk).map(|_| "0x00000000").collect();
                        writeln!(self.out, "    {}", line.join(" "))?;
                        written += chunk;
                    }
                    if rest > 0 {
                        let line: Vec<&str> = (0..rest).map(|_| "'00").collect();
                        writeln!(self.out, "    {}", line.join(" "))?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Render bytes as printable double-quoted runs with `'HH` escapes for
/// everything else.
fn render_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut run = String::new();
    for &b in bytes {
        let printable = (0x20..=0x7e).contains(&b) && b != b'"' && b != b'\'' && b != b'\\';
        if printable {
            run.push(b as char);
        } else {
            if !run.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push('"');
                out.push_str(&run);
                out.push('"');
                run.clear();
            }
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "'{:02X}", b);
        }
    }
    if !run.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push('"');
        out.push_str(&run);
        out.push('"');
    }
    if out.is_empty() {
        out.push_str("\"\"");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodeGen;
    use crate::parser::Parser;

    fn emit(source: &str, options: &Options) -> String {
        let parser =
            Parser::new(source.as_bytes().to_vec(), "test.i", options.clone()).unwrap();
        let unit = parser.parse_unit().unwrap();
        let mut codegen = CodeGen::new();
        let program = codegen.lower_unit(&unit).unwrap();
        serialize(&program, options).unwrap()
    }

    #[test]
    fn test_render_bytes() {
        assert_eq!(render_bytes(b"hello"), "\"hello\"");
        assert_eq!(render_bytes(b"hi\n"), "\"hi\" '0A");
        assert_eq!(render_bytes(&[0]), "'00");
        assert_eq!(render_bytes(b"a\"b"), "\"a\" '22 \"b\"");
        assert_eq!(render_bytes(b""), "\"\"");
    }

    #[test]
    fn test_function_sigils_and_indentation() {
        let text = emit("int main(void) { return 0; }", &Options::default());
        assert!(text.contains("@main"));
        assert!(text.contains("    enter"));
        assert!(text.contains("    leave"));
        assert!(text.contains("    ret"));
        assert!(!text.contains("#line"));
    }

    #[test]
    fn test_global_variable_sigil() {
        let text = emit("int x = 66000;", &Options::default());
        assert!(text.contains("=x"));
        // 66000 does not fit the small-immediate form.
        assert!(text.contains("0x000101d0"));
    }

    #[test]
    fn test_string_constant_after_functions() {
        let text = emit(
            "const char *m(void) { return \"ok\"; }",
            &Options::default(),
        );
        let fn_pos = text.find("@m").unwrap();
        let str_pos = text.find("@__S_0").unwrap();
        assert!(str_pos > fn_pos);
        assert!(text.contains("\"ok\" '00"));
    }

    #[test]
    fn test_items_separated_by_blank_lines() {
        let text = emit("int a = 1; int b = 2;", &Options::default());
        assert!(text.contains("\n\n\n"));
    }

    #[test]
    fn test_debug_line_directives() {
        let options = Options::default().with_debug_lines(true);
        let text = emit(
            "int main(void)\n{\nint x = 1;\nx = 2;\nreturn x;\n}\n",
            &options,
        );
        assert!(text.starts_with("#line manual"));
        assert!(text.contains("#line 1 \"test.i\""));
        assert!(text.contains("#line 3 \"test.i\""));
        // Statements on successive lines use the shorthand increment.
        assert!(text.lines().any(|l| l == "#"));
    }

    #[test]
    fn test_label_reference_and_definition() {
        let text = emit(
            "int f(int x) { if (x) return 1; return 2; }",
            &Options::default(),
        );
        assert!(text.contains("jz r0 &L"));
        assert!(text.contains(":L"));
    }

    #[test]
    fn test_symbol_address_reference() {
        let text = emit("int g; int f(void) { return g; }", &Options::default());
        assert!(text.contains("imw r0 ^g"));
        assert!(text.contains("add r0 rpp r0"));
    }
}
