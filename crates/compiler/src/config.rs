//! Compiler options, dialect selection, and warning control.
//!
//! Warnings are a bit set toggled from the command line with repeated
//! `-f` flags (`-f sign-compare`, `-f no-float-to-int`) or loaded from a
//! TOML file whose `[warnings]` table maps warning names to booleans.
//! User settings are merged over the defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::Deserialize;

use crate::error::{CompileError, ErrorKind};

/// Language dialect from `-std=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    C89,
    C99,
    C11,
    C17,
    Gnu89,
    #[default]
    Gnu17,
}

impl Dialect {
    pub fn parse(s: &str) -> Result<Dialect, CompileError> {
        match s {
            "c89" | "c90" | "iso9899:1990" => Ok(Dialect::C89),
            "c99" | "iso9899:1999" => Ok(Dialect::C99),
            "c11" | "iso9899:2011" => Ok(Dialect::C11),
            "c17" | "c18" | "iso9899:2017" => Ok(Dialect::C17),
            "gnu89" | "gnu90" => Ok(Dialect::Gnu89),
            "gnu99" | "gnu11" | "gnu17" | "gnu18" => Ok(Dialect::Gnu17),
            _ => Err(CompileError::new(
                ErrorKind::Semantic,
                format!("unknown dialect '{}'", s),
            )),
        }
    }

    /// Strict ISO dialects reject implicit function declarations from C99
    /// on; the GNU and C89 dialects accept them with a warning.
    pub fn allows_implicit_functions(self) -> bool {
        matches!(self, Dialect::C89 | Dialect::Gnu89 | Dialect::Gnu17)
    }
}

bitflags! {
    /// Individually controllable warnings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WarningSet: u32 {
        /// Implicit floating-to-integer conversion.
        const FLOAT_TO_INT = 1 << 0;
        /// Signed/unsigned comparison resolved in favour of unsigned.
        const SIGN_COMPARE = 1 << 1;
        /// Call to an undeclared function.
        const IMPLICIT_FUNCTION = 1 << 2;
    }
}

impl Default for WarningSet {
    fn default() -> Self {
        WarningSet::FLOAT_TO_INT | WarningSet::IMPLICIT_FUNCTION
    }
}

impl WarningSet {
    pub fn by_name(name: &str) -> Option<WarningSet> {
        match name {
            "float-to-int" => Some(WarningSet::FLOAT_TO_INT),
            "sign-compare" => Some(WarningSet::SIGN_COMPARE),
            "implicit-function" => Some(WarningSet::IMPLICIT_FUNCTION),
            _ => None,
        }
    }
}

/// `[warnings]` table of a warning-config TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct WarningConfig {
    #[serde(default)]
    warnings: HashMap<String, bool>,
}

impl WarningConfig {
    /// Parse a warning configuration from TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self, CompileError> {
        toml::from_str(toml_str).map_err(|e| {
            CompileError::new(
                ErrorKind::Io,
                format!("failed to parse warning config: {}", e),
            )
        })
    }

    /// Apply this configuration over `set`, enabling and disabling the
    /// named warnings.
    pub fn apply(&self, set: &mut WarningSet) -> Result<(), CompileError> {
        for (name, enabled) in &self.warnings {
            let flag = WarningSet::by_name(name).ok_or_else(|| {
                CompileError::new(
                    ErrorKind::Io,
                    format!("unknown warning '{}' in warning config", name),
                )
            })?;
            set.set(flag, *enabled);
        }
        Ok(())
    }
}

/// Options for one compiler invocation.
#[derive(Debug, Clone)]
pub struct Options {
    /// Emit `#line` debug directives into the assembly.
    pub debug_lines: bool,
    pub dialect: Dialect,
    pub warnings: WarningSet,
    /// Warning-config file to merge over the defaults, if any.
    pub warning_config_path: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            debug_lines: false,
            dialect: Dialect::default(),
            warnings: WarningSet::default(),
            warning_config_path: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    pub fn with_debug_lines(mut self, enabled: bool) -> Self {
        self.debug_lines = enabled;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Apply one `-f` flag: a warning name enables it, a `no-` prefix
    /// disables it.
    pub fn apply_flag(&mut self, flag: &str) -> Result<(), CompileError> {
        let (name, enable) = match flag.strip_prefix("no-") {
            Some(rest) => (rest, false),
            None => (flag, true),
        };
        let warning = WarningSet::by_name(name).ok_or_else(|| {
            CompileError::new(ErrorKind::Semantic, format!("unknown flag '-f {}'", flag))
        })?;
        self.warnings.set(warning, enable);
        Ok(())
    }

    pub fn warn_enabled(&self, warning: WarningSet) -> bool {
        self.warnings.contains(warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_warnings() {
        let options = Options::default();
        assert!(options.warn_enabled(WarningSet::FLOAT_TO_INT));
        assert!(options.warn_enabled(WarningSet::IMPLICIT_FUNCTION));
        assert!(!options.warn_enabled(WarningSet::SIGN_COMPARE));
    }

    #[test]
    fn test_flag_toggles() {
        let mut options = Options::default();
        options.apply_flag("sign-compare").unwrap();
        assert!(options.warn_enabled(WarningSet::SIGN_COMPARE));
        options.apply_flag("no-float-to-int").unwrap();
        assert!(!options.warn_enabled(WarningSet::FLOAT_TO_INT));
        assert!(options.apply_flag("no-such-warning").is_err());
    }

    #[test]
    fn test_dialect_parse() {
        assert_eq!(Dialect::parse("c99").unwrap(), Dialect::C99);
        assert_eq!(Dialect::parse("gnu17").unwrap(), Dialect::Gnu17);
        assert_eq!(Dialect::parse("c18").unwrap(), Dialect::C17);
        assert!(Dialect::parse("c2y").is_err());
    }

    #[test]
    fn test_implicit_function_policy() {
        assert!(Dialect::Gnu17.allows_implicit_functions());
        assert!(Dialect::C89.allows_implicit_functions());
        assert!(!Dialect::C99.allows_implicit_functions());
        assert!(!Dialect::C17.allows_implicit_functions());
    }

    #[test]
    fn test_warning_config_toml() {
        let toml = r#"
[warnings]
sign-compare = true
float-to-int = false
"#;
        let config = WarningConfig::from_toml(toml).unwrap();
        let mut set = WarningSet::default();
        config.apply(&mut set).unwrap();
        assert!(set.contains(WarningSet::SIGN_COMPARE));
        assert!(!set.contains(WarningSet::FLOAT_TO_INT));
    }

    #[test]
    fn test_warning_config_unknown_name() {
        let config = WarningConfig::from_toml("[warnings]\nbogus = true\n").unwrap();
        let mut set = WarningSet::default();
        assert!(config.apply(&mut set).is_err());
    }
}
