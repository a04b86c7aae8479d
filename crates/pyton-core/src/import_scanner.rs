//! Import-bytecode pattern recognition (`spec.md` §4.1).
//!
//! Grounded on `get_all_imports`/`resolve_import` in
//! `examples/original_source/pyton/sdk/importing.py`.

use std::path::{Path, PathBuf};

use crate::bytecode::{CodeObject, Const, Opcode};
use crate::error::{ErrorKind, SourceLocation, TranspileError, TranspileResult};

/// One recognized import occurrence. `range` is the *instruction-index*
/// interval (inclusive) the scanner matched, so the lowerer can skip it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportDescriptor {
    Full {
        name: String,
        alias: String,
        range: (usize, usize),
    },
    Selective {
        name: String,
        targets: Vec<(String, String)>,
        range: (usize, usize),
    },
}

impl ImportDescriptor {
    pub fn name(&self) -> &str {
        match self {
            ImportDescriptor::Full { name, .. } => name,
            ImportDescriptor::Selective { name, .. } => name,
        }
    }

    pub fn range(&self) -> (usize, usize) {
        match self {
            ImportDescriptor::Full { range, .. } => *range,
            ImportDescriptor::Selective { range, .. } => *range,
        }
    }
}

/// Scans `code`'s instruction stream for every `IMPORT_NAME` anchor and
/// classifies each occurrence as a full or selective import.
pub fn scan_imports(code: &CodeObject) -> TranspileResult<Vec<ImportDescriptor>> {
    let body = &code.instructions;
    let mut imports = Vec::new();

    for i in 0..body.len() {
        if body[i].opcode != Opcode::ImportName {
            continue;
        }

        let unrecognized = || {
            TranspileError::new(ErrorKind::UnrecognizedBytecode)
                .with_context(format!("while scanning the import anchor at instruction {i}"))
                .with_disassembly(code)
        };

        if i < 2 {
            return Err(unrecognized());
        }
        if body[i - 2].opcode != Opcode::LoadConst || body[i - 1].opcode != Opcode::LoadConst {
            return Err(unrecognized());
        }

        let level = const_at(code, body[i - 2].arg, &unrecognized)?;
        let Const::Int(level) = level else {
            return Err(unrecognized());
        };
        if level != 0 {
            return Err(TranspileError::new(ErrorKind::UnsupportedFeature(
                "relative imports".to_string(),
            ))
            .with_location(SourceLocation {
                module: code.qualname.clone(),
                offset: Some(body[i - 2].offset),
            }));
        }

        let fromlist = const_at(code, body[i - 1].arg, &unrecognized)?;
        let import_name = name_at(code, body[i].arg, &unrecognized)?.to_string();

        if let Some(full) = as_full_import(code, body, i, &fromlist, &import_name) {
            imports.push(full);
            continue;
        }
        if let Some(selective) = as_selective_import(code, body, i, &fromlist, &import_name)? {
            imports.push(selective);
            continue;
        }

        return Err(unrecognized());
    }

    Ok(imports)
}

fn const_at(
    code: &CodeObject,
    arg: Option<i64>,
    unrecognized: &impl Fn() -> TranspileError,
) -> TranspileResult<Const> {
    let idx = arg.ok_or_else(unrecognized)? as usize;
    code.consts.get(idx).cloned().ok_or_else(unrecognized)
}

fn name_at<'a>(
    code: &'a CodeObject,
    arg: Option<i64>,
    unrecognized: &impl Fn() -> TranspileError,
) -> TranspileResult<&'a str> {
    let idx = arg.ok_or_else(unrecognized)? as usize;
    code.names.get(idx).map(String::as_str).ok_or_else(unrecognized)
}

/// `import something [as alias]`: `fromlist is None` and the instruction
/// right after `IMPORT_NAME` is a single `STORE_NAME`.
fn as_full_import(
    code: &CodeObject,
    body: &[crate::bytecode::Instruction],
    i: usize,
    fromlist: &Const,
    import_name: &str,
) -> Option<ImportDescriptor> {
    if !matches!(fromlist, Const::None) {
        return None;
    }
    let next = body.get(i + 1)?;
    if next.opcode != Opcode::StoreName {
        return None;
    }
    let alias = code.names.get(next.arg? as usize)?.clone();
    Some(ImportDescriptor::Full {
        name: import_name.to_string(),
        alias,
        range: (i - 2, i + 1),
    })
}

/// `from something import abc[, cba as aaa]`: `fromlist` is a tuple;
/// alternating `IMPORT_FROM`/`STORE_NAME` pairs follow, terminated by a
/// `POP_TOP`.
fn as_selective_import(
    code: &CodeObject,
    body: &[crate::bytecode::Instruction],
    i: usize,
    fromlist: &Const,
    import_name: &str,
) -> TranspileResult<Option<ImportDescriptor>> {
    if !matches!(fromlist, Const::Tuple(_)) {
        return Ok(None);
    }

    let mut cursor = i;
    let mut targets = Vec::new();

    loop {
        let Some(after) = body.get(cursor + 1) else {
            return Ok(None);
        };
        if after.opcode == Opcode::PopTop {
            break;
        }
        let Some(from_instr) = body.get(cursor + 1) else {
            return Ok(None);
        };
        let Some(store_instr) = body.get(cursor + 2) else {
            return Ok(None);
        };
        if from_instr.opcode != Opcode::ImportFrom || store_instr.opcode != Opcode::StoreName {
            return Ok(None);
        }

        let unrecognized = || {
            TranspileError::new(ErrorKind::UnrecognizedBytecode)
                .with_context(format!("while scanning a selective import near instruction {cursor}"))
                .with_disassembly(code)
        };
        let origin = name_at(code, from_instr.arg, &unrecognized)?.to_string();
        let alias = name_at(code, store_instr.arg, &unrecognized)?.to_string();
        targets.push((origin, alias));
        cursor += 2;
    }

    Ok(Some(ImportDescriptor::Selective {
        name: import_name.to_string(),
        targets,
        range: (i - 2, cursor + 1),
    }))
}

/// Resolves `name` (e.g. `other.sub`) to a sibling source path of
/// `importer_path`, replacing dotted components with path separators and
/// appending the fixed `.py` source extension (`spec.md` §4.1).
pub fn resolve_import(importer_path: &Path, name: &str) -> TranspileResult<PathBuf> {
    let base = importer_path.parent().unwrap_or_else(|| Path::new("."));
    resolve_import_in(base, importer_path, name)
}

/// As [`resolve_import`], but resolves against an explicit search root
/// rather than `importer_path`'s own directory — used when
/// [`crate::PipelineConfig::module_root`] overrides the default.
pub fn resolve_import_in(base: &Path, importer_path: &Path, name: &str) -> TranspileResult<PathBuf> {
    let name_path = name.replace('.', "/");
    let path = base.join(format!("{name_path}.py"));

    if !path.exists() {
        return Err(TranspileError::new(ErrorKind::ImportNotFound {
            name: name.to_string(),
            from: importer_path.display().to_string(),
        })
        .with_context(format!("resolved target path was {}", path.display())));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_module;

    #[test]
    fn selective_import_range_spans_level_to_pop() {
        let code = load_module("from other import abc\nabc()\n", "<module>").unwrap();
        let imports = scan_imports(&code).unwrap();
        assert_eq!(imports.len(), 1);
        match &imports[0] {
            ImportDescriptor::Selective { name, targets, .. } => {
                assert_eq!(name, "other");
                assert_eq!(targets, &[("abc".to_string(), "abc".to_string())]);
            }
            other => panic!("expected a selective import, got {other:?}"),
        }
    }

    #[test]
    fn full_import_is_recognized_but_left_to_the_lowerer_to_reject() {
        let code = load_module("import other\n", "<module>").unwrap();
        let imports = scan_imports(&code).unwrap();
        assert_eq!(imports.len(), 1);
        assert!(matches!(imports[0], ImportDescriptor::Full { .. }));
    }

    #[test]
    fn multi_target_selective_import_orders_targets() {
        let code = load_module("from other import abc\nfrom other import cba\nabc()\ncba()\n", "<module>").unwrap();
        let imports = scan_imports(&code).unwrap();
        assert_eq!(imports.len(), 2);
    }

    #[test]
    fn resolve_import_fails_for_missing_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.py");
        std::fs::write(&entry, "pass\n").unwrap();
        let err = resolve_import(&entry, "missing").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ImportNotFound { .. }));
    }

    #[test]
    fn resolve_import_finds_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.py");
        std::fs::write(&entry, "pass\n").unwrap();
        std::fs::write(dir.path().join("other.py"), "pass\n").unwrap();
        let resolved = resolve_import(&entry, "other").unwrap();
        assert_eq!(resolved, dir.path().join("other.py"));
    }
}
