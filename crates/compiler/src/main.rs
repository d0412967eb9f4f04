//! mcc - C compiler for the Mica register VM.
//!
//! Takes one preprocessed translation unit and writes textual assembly.
//! The gcc-style spellings `-std=...` and `-fflag` are rewritten into
//! clap-friendly forms before parsing.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "mcc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "C compiler for the Mica VM - compile .i to .s", long_about = None)]
struct Cli {
    /// Preprocessed input file (.i)
    input: Option<PathBuf>,

    /// Output assembly path (defaults to the input with a .s extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit #line debug directives
    #[arg(short = 'g')]
    debug: bool,

    /// Toggle a warning: -f sign-compare, -f no-float-to-int
    #[arg(short = 'f', value_name = "FLAG")]
    flags: Vec<String>,

    /// Language dialect (accepts the -std=c17 spelling too)
    #[arg(long = "std", value_name = "DIALECT")]
    dialect: Option<String>,

    /// Warning configuration file (TOML, [warnings] table)
    #[arg(long, value_name = "PATH")]
    warn_config: Option<PathBuf>,

    /// Generate shell completions and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

/// Rewrite `-std=x` to `--std=x` and `-fno-thing` to `-f no-thing` so the
/// familiar compiler spellings work.
fn rewrite_args() -> Vec<String> {
    let mut out = Vec::new();
    for arg in std::env::args() {
        if let Some(rest) = arg.strip_prefix("-std=") {
            out.push(format!("--std={}", rest));
        } else if let Some(rest) = arg.strip_prefix("-f") {
            if rest.is_empty() {
                out.push(arg);
            } else {
                out.push("-f".to_string());
                out.push(rest.to_string());
            }
        } else {
            out.push(arg);
        }
    }
    out
}

fn main() {
    let cli = Cli::parse_from(rewrite_args());

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "mcc", &mut io::stdout());
        return;
    }

    let Some(input) = cli.input else {
        eprintln!("error: no input file");
        process::exit(1);
    };
    let output = cli
        .output
        .unwrap_or_else(|| input.with_extension("s"));

    let mut options = mica_cc::Options::default().with_debug_lines(cli.debug);
    if let Some(dialect) = &cli.dialect {
        match mica_cc::Dialect::parse(dialect) {
            Ok(dialect) => options.dialect = dialect,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
    }
    for flag in &cli.flags {
        if let Err(e) = options.apply_flag(flag) {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
    options.warning_config_path = cli.warn_config;

    // A panic is a compiler bug; 125 is reserved for internal crashes.
    let result = std::panic::catch_unwind(|| {
        mica_cc::compile_file(&input, &output, &options)
    });
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            eprintln!("{}", e);
            process::exit(1);
        }
        Err(_) => {
            eprintln!("internal error: compiler crashed");
            process::exit(125);
        }
    }
}
