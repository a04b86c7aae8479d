//! `@extern` FFI-declaration pattern recognition (`spec.md` §4.2).
//!
//! Grounded on `get_all_externs`/`create_marshalling_stub` in
//! `examples/original_source/pyton/sdk/interop.py`.

use indexmap::IndexMap;

use crate::bytecode::{CodeObject, Const, Opcode};
use crate::error::{ErrorKind, TranspileError, TranspileResult};

/// One of the six interop tags a value may cross the FFI boundary as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropType {
    Int,
    Str,
    Float,
    Bool,
    None,
    Obj,
}

impl InteropType {
    fn from_type_name(name: Option<&str>) -> Self {
        match name {
            None => InteropType::None,
            Some("int") => InteropType::Int,
            Some("str") => InteropType::Str,
            Some("float") => InteropType::Float,
            Some("bool") => InteropType::Bool,
            Some(_) => InteropType::Obj,
        }
    }

    /// The C type an interop value marshals to/from, per §6's runtime
    /// contract.
    pub fn c_type(self) -> &'static str {
        match self {
            InteropType::Bool => "bool",
            InteropType::Float => "double",
            InteropType::Int => "int64_t",
            InteropType::None => "void",
            InteropType::Obj => "pyobj_t*",
            InteropType::Str => "string_t",
        }
    }
}

/// `{ symbol, params, return, range }` (`spec.md` §3's "Extern descriptor").
#[derive(Debug, Clone)]
pub struct ExternDescriptor {
    pub symbol: String,
    pub params: IndexMap<String, InteropType>,
    pub return_type: InteropType,
    pub range: (usize, usize),
}

impl ExternDescriptor {
    pub fn c_name(&self) -> String {
        format!("_extern_{}", self.symbol)
    }
}

/// Scans `code`'s instruction stream for every `@extern` function-definition
/// footprint and extracts its type annotations.
pub fn scan_externs(code: &CodeObject) -> TranspileResult<Vec<ExternDescriptor>> {
    let body = &code.instructions;
    let mut externs = Vec::new();

    let mut i = 0;
    while i < body.len() {
        if let Some(found) = scan_single(code, body, i)? {
            externs.push(found);
        }
        i += 1;
    }

    Ok(externs)
}

fn scan_single(
    code: &CodeObject,
    body: &[crate::bytecode::Instruction],
    start: usize,
) -> TranspileResult<Option<ExternDescriptor>> {
    let anchor = &body[start];
    if anchor.opcode != Opcode::LoadName {
        return Ok(None);
    }
    let Some(name) = anchor.arg.and_then(|idx| code.names.get(idx as usize)) else {
        return Ok(None);
    };
    if name != "extern" {
        return Ok(None);
    }

    let mut i = start + 1;
    let mut annotations: IndexMap<String, InteropType> = IndexMap::new();

    loop {
        let Some(name_instr) = body.get(i) else {
            return Ok(None);
        };
        let Some(type_instr) = body.get(i + 1) else {
            return Ok(None);
        };
        if name_instr.opcode != Opcode::LoadConst
            || !matches!(type_instr.opcode, Opcode::LoadName | Opcode::LoadConst)
        {
            break;
        }

        let pname = match name_instr.arg.and_then(|idx| code.consts.get(idx as usize)) {
            Some(Const::Str(s)) => s.clone(),
            _ => break,
        };
        let ptype = match type_instr.opcode {
            Opcode::LoadName => {
                let type_name = type_instr.arg.and_then(|idx| code.names.get(idx as usize));
                InteropType::from_type_name(type_name.map(String::as_str))
            }
            Opcode::LoadConst => match type_instr.arg.and_then(|idx| code.consts.get(idx as usize)) {
                Some(Const::None) => InteropType::None,
                _ => break,
            },
            _ => unreachable!(),
        };

        annotations.insert(pname, ptype);
        i += 1;
    }

    let expect = [
        Opcode::BuildTuple,
        Opcode::LoadConst,
        Opcode::MakeFunction,
        Opcode::SetFunctionAttribute,
        Opcode::Call,
        Opcode::StoreName,
    ];
    for (offset, op) in expect.iter().enumerate() {
        match body.get(i + offset) {
            Some(instr) if instr.opcode == *op => continue,
            _ => return Ok(None),
        }
    }

    let end = i + expect.len() - 1;
    let store_instr = &body[end];
    let symbol = store_instr
        .arg
        .and_then(|idx| code.names.get(idx as usize))
        .ok_or_else(|| {
            TranspileError::new(ErrorKind::UnrecognizedBytecode)
                .with_context("@extern STORE_NAME had no name index")
                .with_disassembly(code)
        })?
        .clone();

    let return_type = annotations.shift_remove("return").unwrap_or(InteropType::None);
    Ok(Some(ExternDescriptor {
        symbol,
        params: annotations,
        return_type,
        range: (start, end),
    }))
}

/// Generates the extern declaration and `PY_DEFINE` marshalling stub for
/// `extern` (`spec.md` §4.2). Returns `Err` if `return_type` is `OBJ`, which
/// is legal as a parameter type but forbidden as a return type.
pub fn generate_marshalling_stub(extern_: &ExternDescriptor) -> TranspileResult<Vec<String>> {
    if matches!(extern_.return_type, InteropType::Obj) {
        return Err(TranspileError::new(ErrorKind::UnsupportedFeature(
            "OBJ as an extern return type".to_string(),
        )));
    }

    let ret = extern_.return_type.c_type();
    let decl_params = extern_
        .params
        .iter()
        .map(|(name, ty)| format!("{} {name}", ty.c_type()))
        .collect::<Vec<_>>()
        .join(", ");
    let call_params = extern_
        .params
        .keys()
        .map(|name| format!("arg_{name}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut lines = vec![format!("extern {ret} {}({decl_params});", extern_.symbol), String::new()];
    lines.push(format!("PY_DEFINE({}) {{", extern_.c_name()));
    lines.push(format!("    ASSERT(argc == {});", extern_.params.len()));
    lines.push("    ENSURE_NOT_NULL(argv);".to_string());
    for (i, (name, ty)) in extern_.params.iter().enumerate() {
        lines.push(format!("    {} arg_{name} = argv[{i}];", ty.c_type()));
    }
    lines.push(format!("    {ret} ret = {}({call_params});", extern_.symbol));
    lines.push(match extern_.return_type {
        InteropType::Int => "    return MARSHALLED_INT(ret);".to_string(),
        InteropType::Str => "    return MARSHALLED_STR(ret);".to_string(),
        InteropType::Bool => "    return MARSHALLED_BOOL(ret);".to_string(),
        InteropType::Float => "    return MARSHALLED_FLOAT(ret);".to_string(),
        InteropType::None => "    return WITH_RESULT(&py_none);".to_string(),
        InteropType::Obj => unreachable!("rejected above"),
    });
    lines.push("}".to_string());
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_module;

    #[test]
    fn extern_scanner_extracts_symbol_and_types() {
        let code = load_module("@extern\ndef foo(x: int) -> bool:\n    ...\n", "<module>").unwrap();
        let externs = scan_externs(&code).unwrap();
        assert_eq!(externs.len(), 1);
        assert_eq!(externs[0].symbol, "foo");
        assert_eq!(externs[0].return_type, InteropType::Bool);
        assert_eq!(externs[0].params.get("x"), Some(&InteropType::Int));
    }

    #[test]
    fn marshalling_stub_rejects_obj_return() {
        let extern_ = ExternDescriptor {
            symbol: "foo".to_string(),
            params: IndexMap::new(),
            return_type: InteropType::Obj,
            range: (0, 0),
        };
        let err = generate_marshalling_stub(&extern_).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedFeature(_)));
    }

    #[test]
    fn marshalling_stub_emits_assert_and_call() {
        let extern_ = ExternDescriptor {
            symbol: "foo".to_string(),
            params: IndexMap::from([("x".to_string(), InteropType::Int)]),
            return_type: InteropType::Bool,
            range: (0, 0),
        };
        let lines = generate_marshalling_stub(&extern_).unwrap();
        assert!(lines.iter().any(|l| l.contains("ASSERT(argc == 1)")));
        assert!(lines.iter().any(|l| l.contains("MARSHALLED_BOOL")));
    }
}
