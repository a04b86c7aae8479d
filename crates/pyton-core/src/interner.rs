//! Constant interning (`spec.md` §4.4): memoizes Pyton constants to stable
//! global C symbols, recursing into nested code objects through
//! [`TranslationUnit::translate`].
//!
//! Grounded on `TranslationUnit.get_or_create_const` in
//! `examples/original_source/pyton/sdk/transpiler.py`.

use std::path::Path;

use crate::bytecode::{CodeObject, Const, Opcode};
use crate::error::{ErrorKind, TranspileError, TranspileResult};
use crate::unit::TranslationUnit;

impl TranslationUnit {
    /// Interns every entry of `code.consts`, returning the C expression each
    /// slot resolves to (in the same order). Entries already seen elsewhere
    /// in the run (by value, per `Const::key`) resolve to the same symbol.
    pub(crate) fn intern_consts(
        &mut self,
        code: &CodeObject,
        source_path: &Path,
        module: &str,
    ) -> TranspileResult<Vec<String>> {
        let mut symbols = Vec::with_capacity(code.consts.len());
        for (idx, const_) in code.consts.iter().enumerate() {
            symbols.push(self.get_or_create_const(const_, code, idx, source_path, module)?);
        }
        Ok(symbols)
    }

    /// `intern(const, context) -> symbol` (`spec.md` §4.4). `enclosing` and
    /// `const_idx` are only needed to resolve the class-body-vs-function
    /// question for `Const::Code`.
    pub(crate) fn get_or_create_const(
        &mut self,
        const_: &Const,
        enclosing: &CodeObject,
        const_idx: usize,
        source_path: &Path,
        module: &str,
    ) -> TranspileResult<String> {
        match const_ {
            Const::Bool(true) => return Ok("&py_true".to_string()),
            Const::Bool(false) => return Ok("&py_false".to_string()),
            Const::None => return Ok("&py_none".to_string()),
            _ => {}
        }

        let key = const_.key();
        if let Some(symbol) = self.known_consts.get(&key) {
            return Ok(format!("&{symbol}"));
        }

        let symbol = format!("const_{}", self.next_const_id);
        self.next_const_id += 1;
        // Reserve the key before recursing (tuples intern their elements,
        // code constants translate their body) so a constant can never be
        // assigned two symbols even if reached again during that recursion.
        self.known_consts.insert(key, symbol.clone());

        match const_ {
            Const::Bool(_) | Const::None => unreachable!("handled above"),
            Const::Int(i) => {
                self.const_definitions.push(format!(
                    "static pyobj_t {symbol} = {{ .type = &py_type_int, .as_int = {i} }};"
                ));
            }
            Const::Float(f) => {
                self.const_definitions.push(format!(
                    "static pyobj_t {symbol} = {{ .type = &py_type_float, .as_float = {f:?} }};"
                ));
            }
            Const::Str(s) => {
                let escaped = escape_c_string(s);
                self.const_definitions.push(format!(
                    "static pyobj_t {symbol} = {{ .type = &py_type_str, .as_str = STR(\"{escaped}\") }};"
                ));
            }
            Const::Tuple(items) => {
                let mut element_symbols = Vec::with_capacity(items.len());
                for item in items {
                    element_symbols.push(self.get_or_create_const(item, enclosing, const_idx, source_path, module)?);
                }
                let array_symbol = format!("{symbol}_elements");
                self.const_definitions.push(format!(
                    "static pyobj_t* {array_symbol}[] = {{ {} }};",
                    element_symbols.join(", ")
                ));
                self.const_definitions.push(format!(
                    "static pyobj_t {symbol} = {{ .type = &py_type_tuple, .as_list = {{ .elements = {array_symbol}, .length = {len}, .capacity = {len} }} }};",
                    len = items.len()
                ));
            }
            Const::Code(nested) => {
                let is_class_body = const_is_class_body(enclosing, const_idx);
                let mangled = self.translate(nested.clone(), source_path, module, is_class_body)?;
                self.const_definitions.push(format!(
                    "static pyobj_t {symbol} = {{ .type = &py_type_function, .as_function = (pyfn_t){mangled} }};"
                ));
            }
        }

        Ok(format!("&{symbol}"))
    }
}

/// `spec.md` §4.4: a code constant is a class body iff, scanning
/// `enclosing`'s instruction stream forward, the first `LOAD_CONST` whose
/// operand is `const_idx` appears after a `LOAD_BUILD_CLASS`.
fn const_is_class_body(enclosing: &CodeObject, const_idx: usize) -> bool {
    let load_pos = enclosing
        .instructions
        .iter()
        .position(|instr| instr.opcode == Opcode::LoadConst && instr.arg == Some(const_idx as i64));
    let Some(load_pos) = load_pos else {
        return false;
    };
    enclosing.instructions[..load_pos]
        .iter()
        .any(|instr| instr.opcode == Opcode::LoadBuildClass)
}

fn escape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => {} // stripped, matching `spec.md` §4.4
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

/// Surfaces an unrecognized constant type as a fatal diagnostic with
/// disassembly (`spec.md` §4.4, §7). Not currently reachable from this
/// crate's own loader (every `Const` variant is implemented above), but kept
/// as the designated failure path for a future constant kind.
#[allow(dead_code)]
fn unknown_constant_type(code: &CodeObject, type_name: &str) -> TranspileError {
    TranspileError::new(ErrorKind::UnknownConstantType(type_name.to_string())).with_disassembly(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_module;
    use std::path::PathBuf;

    #[test]
    fn identical_string_constants_intern_to_the_same_symbol() {
        let code = load_module("print(\"hi\")\nprint(\"hi\")\n", "<module>").unwrap();
        let mut unit = TranslationUnit::new();
        let symbols = unit.intern_consts(&code, &PathBuf::from("main.py"), "__main__").unwrap();
        let str_symbols: Vec<&String> = symbols
            .iter()
            .zip(code.consts.iter())
            .filter(|(_, c)| matches!(c, Const::Str(s) if s == "hi"))
            .map(|(s, _)| s)
            .collect();
        assert_eq!(str_symbols.len(), 2);
        assert_eq!(str_symbols[0], str_symbols[1]);
    }

    #[test]
    fn distinct_constants_get_distinct_symbols() {
        let code = load_module("print(\"hi\")\nprint(\"bye\")\n", "<module>").unwrap();
        let mut unit = TranslationUnit::new();
        let symbols = unit.intern_consts(&code, &PathBuf::from("main.py"), "__main__").unwrap();
        let unique: std::collections::HashSet<_> = symbols.iter().collect();
        assert_eq!(unique.len(), symbols.len());
    }

    #[test]
    fn booleans_and_none_use_fixed_runtime_symbols() {
        let code = load_module("x = True\ny = None\n", "<module>").unwrap();
        let mut unit = TranslationUnit::new();
        let symbols = unit.intern_consts(&code, &PathBuf::from("main.py"), "__main__").unwrap();
        assert!(symbols.contains(&"&py_true".to_string()));
        assert!(symbols.contains(&"&py_none".to_string()));
    }

    #[test]
    fn class_body_code_constant_is_detected_after_load_build_class() {
        let code = load_module("class K:\n    x = 1\n", "<module>").unwrap();
        let class_idx = code
            .instructions
            .iter()
            .position(|i| {
                i.opcode == Opcode::LoadConst
                    && i.arg
                        .and_then(|a| code.consts.get(a as usize))
                        .is_some_and(|c| matches!(c, Const::Code(c) if c.name == "K"))
            })
            .and_then(|pos| code.instructions[pos].arg)
            .unwrap() as usize;
        assert!(const_is_class_body(&code, class_idx));
    }
}
