//! Bytecode simplification: instruction-index ranges the lowerer must skip
//! (`spec.md` §4.3).
//!
//! Grounded on `simplify_bytecode` in
//! `examples/original_source/pyton/sdk/simplification.py`.

use crate::bytecode::{CodeObject, Const, Opcode};

/// Returns the (inclusive) instruction-index ranges that must be elided from
/// the emitted body: `__static_attributes__` metadata writes, and annotation-
/// tuple construction ahead of a `SET_FUNCTION_ATTRIBUTE 0x04`.
pub fn simplify_bytecode(code: &CodeObject) -> Vec<(usize, usize)> {
    let body = &code.instructions;
    let mut ranges = Vec::new();

    for idx in 0..body.len().saturating_sub(1) {
        let i1 = &body[idx];
        let i2 = &body[idx + 1];

        let i1_is_tuple_const = i1.opcode == Opcode::LoadConst
            && i1
                .arg
                .and_then(|a| code.consts.get(a as usize))
                .is_some_and(|c| matches!(c, Const::Tuple(_)));
        let i2_is_static_attrs = i2.opcode == Opcode::StoreName
            && i2
                .arg
                .and_then(|a| code.names.get(a as usize))
                .is_some_and(|n| n == "__static_attributes__");

        if i1_is_tuple_const && i2_is_static_attrs {
            ranges.push((idx, idx + 1));
        }
    }

    for idx in 0..body.len() {
        if body[idx].opcode != Opcode::SetFunctionAttribute || body[idx].arg != Some(0x04) {
            continue;
        }
        if idx < 3 {
            continue;
        }
        if body[idx - 1].opcode != Opcode::MakeFunction || body[idx - 2].opcode != Opcode::LoadConst {
            continue;
        }
        let build_tuple_idx = idx - 3;
        if body[build_tuple_idx].opcode != Opcode::BuildTuple {
            continue;
        }

        let mut start = build_tuple_idx;
        while start > 0 && matches!(body[start - 1].opcode, Opcode::LoadConst | Opcode::LoadName) {
            start -= 1;
        }

        ranges.push((start, build_tuple_idx));
        ranges.push((idx, idx));
    }

    ranges
}

/// Whether instruction index `idx` falls inside any of `ranges`.
pub fn is_elided(ranges: &[(usize, usize)], idx: usize) -> bool {
    ranges.iter().any(|(start, end)| idx >= *start && idx <= *end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_module;

    #[test]
    fn extern_annotation_tuple_construction_is_elided() {
        let code = load_module("@extern\ndef foo(x: int) -> bool:\n    ...\n", "<module>").unwrap();
        let ranges = simplify_bytecode(&code);
        assert!(!ranges.is_empty());

        let set_attr_idx = code
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::SetFunctionAttribute)
            .unwrap();
        assert!(is_elided(&ranges, set_attr_idx));

        let make_function_idx = code
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::MakeFunction)
            .unwrap();
        assert!(!is_elided(&ranges, make_function_idx));
    }

    #[test]
    fn plain_function_without_annotations_has_no_elided_ranges() {
        let code = load_module("def foo():\n    pass\n", "<module>").unwrap();
        assert!(simplify_bytecode(&code).is_empty());
    }
}
