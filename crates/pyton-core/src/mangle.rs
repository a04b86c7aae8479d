//! Identifier mangling (`spec.md` §3's invariants, §8's name-derivation rules).
//!
//! Grounded on `TranslationUnit.mangle`/`mangle_global`/`sanitize_identifier`
//! in `examples/original_source/pyton/sdk/transpiler.py`.

pub const MAIN_MODULE: &str = "__main__";

/// Replaces every non-`[A-Za-z0-9_]` byte with a double underscore, matching
/// the original's `re.sub(r"[^_A-Za-z0-9]", "__", x)`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push_str("__");
        }
    }
    out
}

/// `pyfn__<module>_<sanitized-qualname>` (`spec.md` §8).
pub fn mangle_function(module: &str, qualname: &str) -> String {
    format!("pyfn__{module}_{}", sanitize_identifier(qualname))
}

/// `pyglobal__<sanitized-N>` for `__main__`, `pyglobal__<M>_<sanitized-N>`
/// otherwise (`spec.md` §3, §8).
pub fn mangle_global(module: &str, name: &str) -> String {
    if module == MAIN_MODULE {
        format!("pyglobal__{}", sanitize_identifier(name))
    } else {
        format!("pyglobal__{module}_{}", sanitize_identifier(name))
    }
}

/// The preprocessor guard used to mark a `__main__` global as "well-known"
/// (i.e. inheritable by importing modules); see §3's "well-known global".
pub fn wellknown_global_macro(name: &str) -> String {
    format!("PY_GLOBAL_{}_WELLKNOWN", sanitize_identifier(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_non_alphanumeric() {
        assert_eq!(sanitize_identifier("a.b"), "a__b");
        assert_eq!(sanitize_identifier("<module>"), "__module__");
    }

    #[test]
    fn main_module_globals_omit_prefix() {
        assert_eq!(mangle_global(MAIN_MODULE, "print"), "pyglobal__print");
    }

    #[test]
    fn non_main_module_globals_carry_prefix() {
        assert_eq!(mangle_global("other", "abc"), "pyglobal__other_abc");
    }

    #[test]
    fn function_mangling_sanitizes_qualname() {
        assert_eq!(mangle_function("other", "foo"), "pyfn__other_foo");
        assert_eq!(mangle_function("other", "K.method"), "pyfn__other_K__method");
    }
}
