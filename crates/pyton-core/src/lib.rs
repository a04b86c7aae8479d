//! # Pyton Core — Transpilation Engine
//!
//! Converts compiled bytecode for a high-level dynamic scripting language
//! into a freestanding C translation unit, linkable into a bootable
//! bare-metal kernel image.
//!
//! ## Architecture
//!
//! The pipeline, leaves first:
//!
//! 1. **Loader** ([`loader`]) — compiles source text into a [`bytecode::CodeObject`] tree.
//! 2. **Import scanner** ([`import_scanner`]) — recognizes import bytecode patterns.
//! 3. **Extern scanner** ([`extern_scanner`]) — recognizes `@extern` FFI declarations.
//! 4. **Simplifier** ([`simplifier`]) — finds instruction ranges the lowerer must skip.
//! 5. **Interner** ([`interner`]) — memoizes constants to stable C symbols.
//! 6. **Lowerer** ([`lowerer`]) — lowers one code object's instructions to C statements.
//! 7. **Translation unit** ([`unit`]) — drives recursive translation and final assembly.
//!
//! [`PytonPipeline`] is the high-level entry point tying all seven stages
//! together.

pub mod bytecode;
pub mod error;
pub mod extern_scanner;
pub mod import_scanner;
pub mod interner;
pub mod loader;
pub mod lowerer;
pub mod mangle;
pub mod simplifier;
pub mod unit;

use std::path::{Path, PathBuf};

use anyhow::Context;

pub use error::{ErrorKind, TranspileError, TranspileResult};
pub use unit::TranslationUnit;

/// Knobs the pipeline exposes beyond the entry-point path itself.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Root directory for resolving import targets. Defaults to the entry
    /// file's sibling directory (`spec.md` §6).
    pub module_root: Option<PathBuf>,
}

/// The main transpilation pipeline: source path in, C translation unit text
/// out.
///
/// # Examples
///
/// ```no_run
/// use pyton_core::PytonPipeline;
///
/// let pipeline = PytonPipeline::new();
/// let c_source = pipeline.transpile("entry.py".as_ref()).unwrap();
/// assert!(c_source.contains("pyton_runtime.h"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PytonPipeline {
    config: PipelineConfig,
}

impl PytonPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Runs the full pipeline against `entry_path` and returns the emitted C
    /// translation unit text (`spec.md` §6's "Output").
    ///
    /// Any fatal diagnostic discards partial output (`spec.md` §7): on
    /// failure the caller gets the structured error, never a half-written
    /// string.
    pub fn transpile(&self, entry_path: &Path) -> anyhow::Result<String> {
        tracing::info!(entry = %entry_path.display(), "starting transpilation");
        let mut unit = TranslationUnit::new().with_module_root(self.config.module_root.clone());
        let result = unit
            .transpile(entry_path)
            .with_context(|| format!("failed to transpile '{}'", entry_path.display()))?;
        tracing::info!(
            modules = unit.modules.len(),
            "transpilation finished"
        );
        Ok(result)
    }

    /// Loads `entry_path`'s top-level code object without running the rest
    /// of the pipeline — the engine behind `pyton dump-bytecode`.
    pub fn load_entry(&self, entry_path: &Path) -> anyhow::Result<std::rc::Rc<bytecode::CodeObject>> {
        let source = std::fs::read_to_string(entry_path)
            .with_context(|| format!("could not read '{}'", entry_path.display()))?;
        loader::load_module(&source, mangle::MAIN_MODULE)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pipeline_transpiles_hello_world() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.py");
        fs::write(&entry, "print(\"hi\")\n").unwrap();

        let pipeline = PytonPipeline::new();
        let out = pipeline.transpile(&entry).unwrap();
        assert!(out.contains("pyglobal__print"));
    }

    #[test]
    fn pipeline_surfaces_unsupported_feature_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.py");
        fs::write(&entry, "import other\n").unwrap();
        fs::write(dir.path().join("other.py"), "pass\n").unwrap();

        let pipeline = PytonPipeline::new();
        let err = pipeline.transpile(&entry).unwrap_err();
        assert!(err.to_string().contains("failed to transpile"));
    }

    #[test]
    fn load_entry_exposes_the_raw_code_object() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.py");
        fs::write(&entry, "print(\"hi\")\n").unwrap();

        let pipeline = PytonPipeline::new();
        let code = pipeline.load_entry(&entry).unwrap();
        assert!(code.is_module());
    }
}
