//! Per-opcode lowering of a single code object into C statements
//! (`spec.md` §4.5).
//!
//! Grounded line-by-line on the `match instr.opname` block of
//! `TranslationUnit.translate` in
//! `examples/original_source/pyton/sdk/transpiler.py`. Stack-cursor
//! bookkeeping, label numbering, and exception-region tracking all mirror
//! that function; only the per-opcode bodies are split out here so the
//! driving loop in `unit.rs` stays readable.

use crate::bytecode::{binop, cmp, CodeObject, Opcode};
use crate::error::{ErrorKind, SourceLocation, TranspileError, TranspileResult};
use crate::mangle::mangle_global;

const STACK_PUSH: &str = "stack[++stack_current]";
const STACK_POP: &str = "stack[stack_current--]";

/// Computes the label name (`L1`, `L2`, ...) for every offset that is either
/// a jump target or an exception-table endpoint/handler, sorted by offset.
pub struct Labels {
    offsets: Vec<usize>,
}

impl Labels {
    pub fn compute(code: &CodeObject) -> Self {
        let mut offsets: Vec<usize> = code
            .instructions
            .iter()
            .filter_map(|i| i.jump_target)
            .collect();
        for entry in &code.exception_table {
            offsets.push(entry.start);
            offsets.push(entry.end);
            offsets.push(entry.target);
        }
        offsets.sort_unstable();
        offsets.dedup();
        Self { offsets }
    }

    pub fn at(&self, offset: usize) -> Option<String> {
        self.offsets
            .iter()
            .position(|&o| o == offset)
            .map(|idx| format!("L{}", idx + 1))
    }
}

/// Everything the lowerer needs to know about the enclosing scope that isn't
/// already on `CodeObject` itself.
pub struct LowerContext<'a> {
    pub module: &'a str,
    pub is_module: bool,
    pub is_class_body: bool,
    /// Instruction-index ranges to skip entirely (imports, externs, and
    /// `spec.md` §4.3 simplifications) — already resolved by the caller.
    pub elided: &'a [(usize, usize)],
    /// `const_symbols[i]` is the already-interned C expression (e.g.
    /// `&const_7` or `&py_true`) for `code.consts[i]`, resolved once up front
    /// by the translation unit so that constants shared across code objects
    /// (`spec.md` §4.4) reference a single symbol rather than a per-code
    /// index.
    pub const_symbols: &'a [String],
}

/// Lowers every instruction of `code` into C statement lines, honoring
/// `ctx.elided` ranges and tracking the currently-active exception handler.
pub fn lower_instructions(code: &CodeObject, ctx: &LowerContext<'_>) -> TranspileResult<Vec<String>> {
    let labels = Labels::compute(code);
    let mut body = Vec::new();
    let mut stack_current: i64 = -1;
    let mut prev_handler_region: Option<String> = None;

    for (instr_idx, instr) in code.instructions.iter().enumerate() {
        body.push(format!("// {}: {}", instr.offset, instr.opcode.mnemonic()));

        if let Some(label) = labels.at(instr.offset) {
            body.push(format!("{label}:"));
        }

        let entry = code.exception_entry_at(instr.offset);
        if let Some(entry) = entry {
            let handler_label = labels
                .at(entry.target)
                .expect("exception handler target is always a label offset");
            if prev_handler_region.as_deref() != Some(handler_label.as_str()) {
                body.push(format!(
                    "// Exception region: {} to {}, target {}, depth {}, lasti: {}",
                    entry.start,
                    entry.end,
                    entry.target,
                    entry.depth,
                    if entry.lasti { "yes" } else { "no" }
                ));
                body.push("#undef PY__EXCEPTION_HANDLER_LABEL".to_string());
                body.push(format!("#define PY__EXCEPTION_HANDLER_LABEL {handler_label}"));
                prev_handler_region = Some(handler_label);
            }
        } else if prev_handler_region.is_some() {
            body.push("// No exception handler for this region".to_string());
            body.push("#undef PY__EXCEPTION_HANDLER_LABEL".to_string());
            body.push("#define PY__EXCEPTION_HANDLER_LABEL L_uncaught_exception".to_string());
            prev_handler_region = None;
        }

        let exc_depth = entry.map(|e| e.depth).unwrap_or(0);
        let exc_lasti: i64 = entry.map(|_| instr.offset as i64).unwrap_or(-1);

        if ctx.elided.iter().any(|(s, e)| instr_idx >= *s && instr_idx <= *e) {
            body.push(String::new());
            continue;
        }

        lower_one(code, ctx, instr, &labels, exc_depth, exc_lasti, &mut stack_current, &mut body)?;
        body.push(String::new());
    }

    Ok(body)
}

#[allow(clippy::too_many_arguments)]
fn lower_one(
    code: &CodeObject,
    ctx: &LowerContext<'_>,
    instr: &crate::bytecode::Instruction,
    labels: &Labels,
    exc_depth: u32,
    exc_lasti: i64,
    stack_current: &mut i64,
    body: &mut Vec<String>,
) -> TranspileResult<()> {
    let push = |sc: &mut i64| {
        *sc += 1;
    };
    let pop = |sc: &mut i64, n: i64| {
        *sc -= n;
    };

    let loc = |offset: usize| SourceLocation {
        module: ctx.module.to_string(),
        offset: Some(offset),
    };
    let unknown_opcode = || {
        TranspileError::new(ErrorKind::UnknownOpcode(instr.opcode.mnemonic().to_string()))
            .with_location(loc(instr.offset))
            .with_disassembly(code)
    };

    match instr.opcode {
        Opcode::Resume | Opcode::Nop => {}
        Opcode::PushNull => {
            push(stack_current);
            body.push(format!("{STACK_PUSH} = NULL;"));
        }
        Opcode::LoadName => {
            let name = name_arg(code, instr)?;
            push(stack_current);
            if ctx.is_module {
                body.push(format!("{STACK_PUSH} = NOT_NULL({});", mangle_global(ctx.module, name)));
            } else if ctx.is_class_body {
                body.push(format!("PY_OPCODE_LOAD_NAME_CLASS({name});"));
            } else {
                body.push(format!(
                    "{STACK_PUSH} = loc_{name} != NULL ? loc_{name} : NOT_NULL({});",
                    mangle_global(ctx.module, name)
                ));
            }
        }
        Opcode::LoadConst | Opcode::ReturnConst => {
            let idx = instr.arg.ok_or_else(unknown_opcode)? as usize;
            let symbol = ctx.const_symbols.get(idx).ok_or_else(unknown_opcode)?;
            if instr.opcode == Opcode::LoadConst {
                push(stack_current);
                body.push(format!("{STACK_PUSH} = {symbol};"));
            } else {
                body.push(format!("return WITH_RESULT({symbol});"));
            }
        }
        Opcode::LoadGlobal => {
            let arg = instr.arg.ok_or_else(unknown_opcode)?;
            let name = code
                .names
                .get((arg >> 1) as usize)
                .ok_or_else(unknown_opcode)?;
            push(stack_current);
            body.push(format!("{STACK_PUSH} = {};", mangle_global(ctx.module, name)));
            if (arg & 1) == 1 {
                body.push(format!("{STACK_PUSH} = NULL;"));
            }
        }
        Opcode::LoadFast => {
            let idx = instr.arg.ok_or_else(unknown_opcode)? as usize;
            let name = code.varnames.get(idx).ok_or_else(unknown_opcode)?;
            push(stack_current);
            if !ctx.is_class_body {
                body.push(format!("{STACK_PUSH} = loc_{name};"));
            } else {
                body.push(format!("{STACK_PUSH} = NOT_NULL(py_get_attribute(self, \"{name}\"));"));
            }
        }
        Opcode::LoadFastLoadFast => {
            let arg = instr.arg.ok_or_else(unknown_opcode)?;
            let first = code
                .varnames
                .get((arg >> 4) as usize)
                .ok_or_else(unknown_opcode)?;
            let second = code
                .varnames
                .get((arg & 15) as usize)
                .ok_or_else(unknown_opcode)?;
            push(stack_current);
            push(stack_current);
            if !ctx.is_class_body {
                body.push(format!("{STACK_PUSH} = loc_{first};"));
                body.push(format!("{STACK_PUSH} = loc_{second};"));
            } else {
                body.push(format!("{STACK_PUSH} = NOT_NULL(py_get_attribute(self, \"{first}\"));"));
                body.push(format!("{STACK_PUSH} = NOT_NULL(py_get_attribute(self, \"{second}\"));"));
            }
        }
        Opcode::StoreName => {
            let name = name_arg(code, instr)?;
            if ctx.is_module {
                body.push(format!("{} = {STACK_POP};", mangle_global(ctx.module, name)));
            } else if ctx.is_class_body {
                body.push(format!("py_set_attribute(self, STR(\"{name}\"), {STACK_POP});"));
            } else {
                body.push(format!("loc_{name} = {STACK_POP};"));
            }
            pop(stack_current, 1);
        }
        Opcode::StoreFast => {
            let idx = instr.arg.ok_or_else(unknown_opcode)? as usize;
            let name = code.varnames.get(idx).ok_or_else(unknown_opcode)?;
            if !ctx.is_class_body {
                body.push(format!("loc_{name} = (pyobj_t*)({STACK_POP});"));
            } else {
                body.push(format!("py_set_attribute(self, STR(\"{name}\"), {STACK_POP});"));
            }
            pop(stack_current, 1);
        }
        Opcode::LoadAttr => {
            let arg = instr.arg.ok_or_else(unknown_opcode)?;
            let name = code
                .names
                .get((arg >> 1) as usize)
                .ok_or_else(unknown_opcode)?;
            if (arg & 1) == 0 {
                body.push(format!("PY_OPCODE_LOAD_ATTR(\"{name}\");"));
            } else {
                body.push(format!("PY_OPCODE_LOAD_ATTR_CALLABLE(\"{name}\");"));
                push(stack_current);
            }
        }
        Opcode::StoreAttr => {
            let arg = instr.arg.ok_or_else(unknown_opcode)?;
            let name = code.names.get(arg as usize).ok_or_else(unknown_opcode)?;
            body.push(format!("PY_OPCODE_STORE_ATTR(\"{name}\");"));
            pop(stack_current, 2);
        }
        Opcode::Call => {
            let argc = instr.arg.ok_or_else(unknown_opcode)?;
            body.push(format!("PY_OPCODE_CALL({argc}, {exc_depth}, {exc_lasti});"));
            pop(stack_current, argc + 2);
            push(stack_current);
        }
        Opcode::ReturnValue => {
            body.push("return WITH_RESULT(stack[stack_current]);".to_string());
        }
        Opcode::CompareOp => {
            let arg = instr.arg.ok_or_else(unknown_opcode)?;
            let (selector, coerce) = cmp::decode(arg);
            let op = cmp_macro_name(selector).ok_or_else(unknown_opcode)?;
            body.push(format!(
                "PY_OPCODE_COMPARISON({op}, {}, {exc_depth}, {exc_lasti});",
                if coerce { "true" } else { "false" }
            ));
            pop(stack_current, 1);
        }
        Opcode::BinaryOp => {
            let arg = instr.arg.ok_or_else(unknown_opcode)?;
            let op = binop_macro_name(arg).ok_or_else(unknown_opcode)?;
            body.push(format!("PY_OPCODE_OPERATION({op}, {exc_depth}, {exc_lasti});"));
            pop(stack_current, 1);
        }
        Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
            let target = instr.jump_target.ok_or_else(unknown_opcode)?;
            let label = labels.at(target).ok_or_else(unknown_opcode)?;
            let macro_name = if instr.opcode == Opcode::PopJumpIfFalse {
                "PY_OPCODE_POP_JUMP_IF_FALSE"
            } else {
                "PY_OPCODE_POP_JUMP_IF_TRUE"
            };
            body.push(format!("{macro_name}({label});"));
            pop(stack_current, 1);
        }
        Opcode::JumpBackward | Opcode::JumpBackwardNoInterrupt => {
            let target = instr.jump_target.ok_or_else(unknown_opcode)?;
            let label = labels.at(target).ok_or_else(unknown_opcode)?;
            body.push(format!("goto {label};"));
        }
        Opcode::GetIter => {
            body.push(format!("PY_OPCODE_GET_ITER({exc_depth}, {exc_lasti});"));
        }
        Opcode::ForIter => {
            let target = instr.jump_target.ok_or_else(unknown_opcode)?;
            let label = labels.at(target).ok_or_else(unknown_opcode)?;
            body.push(format!("PY_OPCODE_FOR_ITER({label}, {exc_depth}, {exc_lasti});"));
            push(stack_current);
        }
        Opcode::EndFor | Opcode::PopExcept | Opcode::PopTop => {
            body.push("stack_current--;".to_string());
            pop(stack_current, 1);
        }
        Opcode::RaiseVarargs => {
            let argc = instr.arg.ok_or_else(unknown_opcode)?;
            match argc {
                0 => body.push(format!("RAISE_CATCHABLE(caught_exception, {exc_depth}, {exc_lasti});")),
                1 => {
                    body.push(format!("RAISE_CATCHABLE({STACK_POP}, {exc_depth}, {exc_lasti});"));
                    pop(stack_current, 1);
                }
                other => {
                    return Err(TranspileError::new(ErrorKind::UnsupportedFeature(format!(
                        "RAISE_VARARGS with argc = {other}"
                    )))
                    .with_location(loc(instr.offset)));
                }
            }
        }
        Opcode::PushExcInfo => {
            body.push("PY_OPCODE_PUSH_EXC_INFO();".to_string());
            push(stack_current);
        }
        Opcode::Reraise => {
            // spec.md §9 open question (c): the operand is decoded but left
            // unconsumed, matching the original's commented-out stack pop.
            body.push(format!("RAISE_CATCHABLE({STACK_POP}, {exc_depth}, {exc_lasti});"));
            pop(stack_current, 1);
        }
        Opcode::CheckExcMatch => {
            body.push("PY_OPCODE_CHECK_EXC_MATCH();".to_string());
        }
        Opcode::MakeFunction => {
            body.push("// (already a function)".to_string());
        }
        Opcode::SetFunctionAttribute => {
            let flag = instr.arg.ok_or_else(unknown_opcode)?;
            match flag {
                0x01 | 0x02 => {
                    return Err(TranspileError::new(ErrorKind::UnsupportedFeature(
                        "default arguments".to_string(),
                    ))
                    .with_location(loc(instr.offset)));
                }
                0x04 => body.push("PY_OPCODE_SET_FUNC_ATTR_ANNOTATIONS();".to_string()),
                0x08 => {
                    return Err(TranspileError::new(ErrorKind::UnsupportedFeature(
                        "closures / free-variable cells".to_string(),
                    ))
                    .with_location(loc(instr.offset)));
                }
                other => {
                    return Err(TranspileError::new(ErrorKind::UnknownOpcode(format!(
                        "SET_FUNCTION_ATTRIBUTE flag 0x{other:X}"
                    )))
                    .with_location(loc(instr.offset)));
                }
            }
        }
        Opcode::LoadBuildClass => {
            push(stack_current);
            body.push(format!("{STACK_PUSH} = {};", mangle_global("__main__", "__build_class__")));
        }
        Opcode::Copy => {
            let n = instr.arg.ok_or_else(unknown_opcode)?;
            body.push(format!("PY_OPCODE_COPY({n});"));
            push(stack_current);
        }
        Opcode::Swap => {
            let n = instr.arg.ok_or_else(unknown_opcode)?;
            body.push(format!("PY_OPCODE_SWAP({n});"));
        }
        Opcode::ImportName | Opcode::ImportFrom | Opcode::BuildTuple => {
            return Err(unknown_opcode());
        }
    }

    Ok(())
}

fn name_arg<'a>(code: &'a CodeObject, instr: &crate::bytecode::Instruction) -> TranspileResult<&'a str> {
    let idx = instr.arg.ok_or_else(|| {
        TranspileError::new(ErrorKind::AssertionFailure(format!(
            "{} had no operand",
            instr.opcode.mnemonic()
        )))
    })?;
    code.names.get(idx as usize).map(String::as_str).ok_or_else(|| {
        TranspileError::new(ErrorKind::AssertionFailure(format!(
            "{} operand {idx} out of range for the names table",
            instr.opcode.mnemonic()
        )))
    })
}

fn cmp_macro_name(selector: i64) -> Option<&'static str> {
    Some(match selector {
        cmp::LT => "lt",
        cmp::LE => "lte",
        cmp::EQ => "equ",
        cmp::NE => "neq",
        cmp::GT => "gt",
        cmp::GE => "gte",
        _ => return None,
    })
}

/// `spec.md` §9 open question (a): `NB_TRUE_DIVIDE`/`NB_INPLACE_TRUE_DIVIDE`
/// deliberately alias the floor-division macro, matching the original's
/// `# TODO!` comment.
fn binop_macro_name(arg: i64) -> Option<&'static str> {
    Some(match arg {
        binop::ADD => "add",
        binop::AND => "and",
        binop::FLOOR_DIVIDE => "floordiv",
        binop::LSHIFT => "lsh",
        binop::MULTIPLY => "mul",
        binop::REMAINDER => "rem",
        binop::OR => "or",
        binop::POWER => "pow",
        binop::RSHIFT => "rsh",
        binop::SUBTRACT => "sub",
        binop::TRUE_DIVIDE => "floordiv",
        binop::XOR => "xor",
        binop::INPLACE_ADD => "iadd",
        binop::INPLACE_AND => "iand",
        binop::INPLACE_FLOOR_DIVIDE => "ifloordiv",
        binop::INPLACE_LSHIFT => "ilsh",
        binop::INPLACE_MULTIPLY => "imul",
        binop::INPLACE_REMAINDER => "irem",
        binop::INPLACE_OR => "ior",
        binop::INPLACE_POWER => "ipow",
        binop::INPLACE_RSHIFT => "irsh",
        binop::INPLACE_SUBTRACT => "isub",
        binop::INPLACE_TRUE_DIVIDE => "ifloordiv",
        binop::INPLACE_XOR => "ixor",
        binop::SUBSCR => "subscr",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_module;

    /// Tests below don't exercise the interner, so stub out a symbol per
    /// constant slot that mirrors what a real intern pass would produce.
    fn dummy_const_symbols(code: &CodeObject) -> Vec<String> {
        (0..code.consts.len()).map(|i| format!("&const_{i}")).collect()
    }

    #[test]
    fn labels_cover_jump_targets() {
        let code = load_module("while True:\n    pass\n", "<module>").unwrap();
        let labels = Labels::compute(&code);
        for instr in &code.instructions {
            if let Some(target) = instr.jump_target {
                assert!(labels.at(target).is_some());
            }
        }
    }

    #[test]
    fn hello_world_references_not_null_global() {
        let code = load_module("print(\"hi\")\n", "<module>").unwrap();
        let symbols = dummy_const_symbols(&code);
        let ctx = LowerContext {
            module: "__main__",
            is_module: true,
            is_class_body: false,
            elided: &[],
            const_symbols: &symbols,
        };
        let body = lower_instructions(&code, &ctx).unwrap();
        assert!(body.iter().any(|l| l.contains("NOT_NULL(pyglobal__print)")));
    }

    #[test]
    fn try_except_toggles_handler_label() {
        let source = "try:\n    raise X\nexcept X:\n    pass\n";
        let code = load_module(source, "<module>").unwrap();
        let symbols = dummy_const_symbols(&code);
        let ctx = LowerContext {
            module: "__main__",
            is_module: true,
            is_class_body: false,
            elided: &[],
            const_symbols: &symbols,
        };
        let body = lower_instructions(&code, &ctx).unwrap();
        assert!(body.iter().any(|l| l.contains("#define PY__EXCEPTION_HANDLER_LABEL L")));
        assert!(body
            .iter()
            .any(|l| l == "#define PY__EXCEPTION_HANDLER_LABEL L_uncaught_exception"));
        assert!(body.iter().any(|l| l.contains("PY_OPCODE_PUSH_EXC_INFO")));
    }

    #[test]
    fn class_body_store_name_sets_attribute() {
        let code = load_module("class K:\n    x = 1\n", "<module>").unwrap();
        let class_code = code
            .consts
            .iter()
            .find_map(|c| match c {
                crate::bytecode::Const::Code(c) if c.name == "K" => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        let symbols = dummy_const_symbols(&class_code);
        let ctx = LowerContext {
            module: "__main__",
            is_module: false,
            is_class_body: true,
            elided: &[],
            const_symbols: &symbols,
        };
        let body = lower_instructions(&class_code, &ctx).unwrap();
        assert!(body.iter().any(|l| l.contains("py_set_attribute(self, STR(\"x\")")));
    }

    #[test]
    fn raise_varargs_argc_two_is_unsupported() {
        // Not reachable from this crate's own loader, but the lowerer must
        // still reject it defensively per spec.md §7.
        let mut code = load_module("raise X\n", "<module>").unwrap();
        for instr in &mut code.instructions {
            if instr.opcode == Opcode::RaiseVarargs {
                instr.arg = Some(2);
            }
        }
        let symbols = dummy_const_symbols(&code);
        let ctx = LowerContext {
            module: "__main__",
            is_module: true,
            is_class_body: false,
            elided: &[],
            const_symbols: &symbols,
        };
        let err = lower_instructions(&code, &ctx).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedFeature(_)));
    }
}
