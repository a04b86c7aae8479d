//! Structured diagnostics for the transpilation pipeline (`spec.md` §7).
//!
//! Shape mirrors the teacher's `depyler_core::error` module: an `ErrorKind`
//! enum plus a context-accumulating wrapper, rendered with the `error: `
//! prefix `spec.md` requires.

use std::fmt;
use thiserror::Error;

use crate::bytecode::CodeObject;

/// Where in the module graph a diagnostic originated.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub module: String,
    pub offset: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{}@{}", self.module, offset),
            None => write!(f, "{}", self.module),
        }
    }
}

/// One error kind per `spec.md` §7.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("unrecognized bytecode sequence")]
    UnrecognizedBytecode,

    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),

    #[error("unknown constant type '{0}'")]
    UnknownConstantType(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("import '{name}' not found from '{from}'")]
    ImportNotFound { name: String, from: String },

    #[error("assertion failure: {0}")]
    AssertionFailure(String),
}

/// A context-carrying transpilation error. Every fatal condition in the
/// pipeline is surfaced as one of these and discards partial output (§7:
/// "The transpiler does not attempt recovery; any failure discards partial
/// output").
#[derive(Debug, Error)]
pub struct TranspileError {
    pub kind: ErrorKind,
    pub location: Option<SourceLocation>,
    pub context: Vec<String>,
    pub disassembly: Option<String>,
}

impl TranspileError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            location: None,
            context: Vec::new(),
            disassembly: None,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context.push(ctx.into());
        self
    }

    /// Attaches a disassembly dump of the offending code object, matching
    /// the original implementation's `print(dis.dis(fn))` diagnostics.
    pub fn with_disassembly(mut self, code: &CodeObject) -> Self {
        self.disassembly = Some(crate::loader::disassemble(code));
        self
    }
}

impl fmt::Display for TranspileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}", self.kind)?;
        if let Some(loc) = &self.location {
            write!(f, " at {loc}")?;
        }
        if let Some(dis) = &self.disassembly {
            write!(f, "\nthe full disassembly of the offending code object:\n{dis}")?;
        }
        for ctx in &self.context {
            write!(f, "\nerror:   {ctx}")?;
        }
        Ok(())
    }
}

pub type TranspileResult<T> = Result<T, TranspileError>;

impl From<anyhow::Error> for TranspileError {
    fn from(err: anyhow::Error) -> Self {
        TranspileError::new(ErrorKind::AssertionFailure(err.to_string()))
    }
}

/// Builds a [`TranspileError`] with optional trailing context strings.
#[macro_export]
macro_rules! transpile_error {
    ($kind:expr) => {
        $crate::error::TranspileError::new($kind)
    };
    ($kind:expr, $($ctx:expr),+ $(,)?) => {{
        let mut err = $crate::error::TranspileError::new($kind);
        $(err = err.with_context($ctx);)+
        err
    }};
}

/// Returns early with a [`TranspileError`].
#[macro_export]
macro_rules! transpile_bail {
    ($kind:expr) => {
        return Err($crate::transpile_error!($kind))
    };
    ($kind:expr, $($ctx:expr),+ $(,)?) => {
        return Err($crate::transpile_error!($kind, $($ctx),+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_has_prefix() {
        let err = TranspileError::new(ErrorKind::UnknownOpcode("FOO".into()));
        assert!(format!("{err}").starts_with("error: "));
    }

    #[test]
    fn error_with_location_renders_module_and_offset() {
        let err = TranspileError::new(ErrorKind::UnrecognizedBytecode).with_location(
            SourceLocation {
                module: "__main__".into(),
                offset: Some(12),
            },
        );
        let rendered = format!("{err}");
        assert!(rendered.contains("__main__@12"));
    }

    #[test]
    fn error_context_is_ordered() {
        let err = TranspileError::new(ErrorKind::AssertionFailure("x".into()))
            .with_context("first")
            .with_context("second");
        assert_eq!(err.context, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn macro_builds_with_context() {
        let err = transpile_error!(ErrorKind::UnrecognizedBytecode, "while scanning imports");
        assert_eq!(err.context.len(), 1);
    }
}
