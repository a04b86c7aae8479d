//! The instruction/code-object data model the rest of the pipeline operates on.
//!
//! This is deliberately Pyton's own model (see `SPEC_FULL.md` §0) rather than
//! a binding to a specific host bytecode format: the [`loader`](crate::loader)
//! populates it from Python source, and every later stage (scanners,
//! simplifier, interner, lowerer) only ever sees these types.

use std::fmt;
use std::rc::Rc;

/// One bytecode opcode. Mnemonics match `spec.md` §4.5's table; operand
/// shapes match the original implementation's CPython 3.13 target ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Resume,
    Nop,
    PushNull,
    LoadName,
    StoreName,
    LoadConst,
    ReturnConst,
    LoadGlobal,
    LoadFast,
    LoadFastLoadFast,
    StoreFast,
    LoadAttr,
    StoreAttr,
    Call,
    ReturnValue,
    CompareOp,
    BinaryOp,
    PopJumpIfFalse,
    PopJumpIfTrue,
    JumpBackward,
    JumpBackwardNoInterrupt,
    ForIter,
    GetIter,
    EndFor,
    RaiseVarargs,
    PushExcInfo,
    PopExcept,
    Reraise,
    CheckExcMatch,
    MakeFunction,
    SetFunctionAttribute,
    LoadBuildClass,
    Copy,
    Swap,
    PopTop,
    /// Anchor opcode for the import scanner (`spec.md` §4.1).
    ImportName,
    ImportFrom,
    /// Anchor opcode for tuple-construction in the extern-decorator and
    /// class-body patterns (`spec.md` §4.2, §4.3).
    BuildTuple,
}

impl Opcode {
    /// The textual mnemonic, used in disassembly dumps and `#comment`s in
    /// emitted C.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Resume => "RESUME",
            Opcode::Nop => "NOP",
            Opcode::PushNull => "PUSH_NULL",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::StoreName => "STORE_NAME",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::ReturnConst => "RETURN_CONST",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::LoadFastLoadFast => "LOAD_FAST_LOAD_FAST",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::StoreAttr => "STORE_ATTR",
            Opcode::Call => "CALL",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::CompareOp => "COMPARE_OP",
            Opcode::BinaryOp => "BINARY_OP",
            Opcode::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Opcode::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Opcode::JumpBackward => "JUMP_BACKWARD",
            Opcode::JumpBackwardNoInterrupt => "JUMP_BACKWARD_NO_INTERRUPT",
            Opcode::ForIter => "FOR_ITER",
            Opcode::GetIter => "GET_ITER",
            Opcode::EndFor => "END_FOR",
            Opcode::RaiseVarargs => "RAISE_VARARGS",
            Opcode::PushExcInfo => "PUSH_EXC_INFO",
            Opcode::PopExcept => "POP_EXCEPT",
            Opcode::Reraise => "RERAISE",
            Opcode::CheckExcMatch => "CHECK_EXC_MATCH",
            Opcode::MakeFunction => "MAKE_FUNCTION",
            Opcode::SetFunctionAttribute => "SET_FUNCTION_ATTRIBUTE",
            Opcode::LoadBuildClass => "LOAD_BUILD_CLASS",
            Opcode::Copy => "COPY",
            Opcode::Swap => "SWAP",
            Opcode::PopTop => "POP_TOP",
            Opcode::ImportName => "IMPORT_NAME",
            Opcode::ImportFrom => "IMPORT_FROM",
            Opcode::BuildTuple => "BUILD_TUPLE",
        }
    }
}

/// A single instruction: opcode, optional operand, byte offset, and (for
/// branching opcodes) its jump target offset. Matches `spec.md` §3's
/// "Instruction" data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: Option<i64>,
    pub offset: usize,
    pub jump_target: Option<usize>,
}

impl Instruction {
    pub fn new(opcode: Opcode, arg: Option<i64>, offset: usize) -> Self {
        Self {
            opcode,
            arg,
            offset,
            jump_target: None,
        }
    }

    pub fn with_jump_target(mut self, target: usize) -> Self {
        self.jump_target = Some(target);
        self
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>5}: {}", self.offset, self.opcode.mnemonic())?;
        if let Some(arg) = self.arg {
            write!(f, " {arg}")?;
        }
        if let Some(target) = self.jump_target {
            write!(f, " -> {target}")?;
        }
        Ok(())
    }
}

/// Half-open bytecode range, handler target, and entry depth for a single
/// exception-table row. Matches `spec.md` §3's "Exception-table entry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub depth: u32,
    pub lasti: bool,
}

/// Flag bits carried on a code object. Only the two bits Pyton ever
/// inspects are modeled; `spec.md` doesn't require the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeFlags(u8);

impl CodeFlags {
    pub const EMPTY: Self = Self(0);
    pub const VARARGS: Self = Self(0b01);
    pub const VARKEYWORDS: Self = Self(0b10);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// `BINARY_OP` operand values. Numbers match CPython 3.11+'s `NB_*` table in
/// `Python/bytecodes.c`: in-place variants are the non-in-place index plus 13,
/// with `NB_SUBSCR` trailing as the odd one out.
pub mod binop {
    pub const ADD: i64 = 0;
    pub const AND: i64 = 1;
    pub const FLOOR_DIVIDE: i64 = 2;
    pub const LSHIFT: i64 = 3;
    pub const MULTIPLY: i64 = 5;
    pub const REMAINDER: i64 = 6;
    pub const OR: i64 = 7;
    pub const POWER: i64 = 8;
    pub const RSHIFT: i64 = 9;
    pub const SUBTRACT: i64 = 10;
    pub const TRUE_DIVIDE: i64 = 11;
    pub const XOR: i64 = 12;
    pub const INPLACE_ADD: i64 = 13;
    pub const INPLACE_AND: i64 = 14;
    pub const INPLACE_FLOOR_DIVIDE: i64 = 15;
    pub const INPLACE_LSHIFT: i64 = 16;
    pub const INPLACE_MULTIPLY: i64 = 18;
    pub const INPLACE_REMAINDER: i64 = 19;
    pub const INPLACE_OR: i64 = 20;
    pub const INPLACE_POWER: i64 = 21;
    pub const INPLACE_RSHIFT: i64 = 22;
    pub const INPLACE_SUBTRACT: i64 = 23;
    pub const INPLACE_TRUE_DIVIDE: i64 = 24;
    pub const INPLACE_XOR: i64 = 25;
    pub const SUBSCR: i64 = 26;

    /// `spec.md` §9 open question (a): true-divide and its in-place form are
    /// deliberately left aliased to floor-division's macro downstream; the
    /// operand values above still distinguish them so that decision lives in
    /// the lowerer, not here.
    pub fn is_inplace(code: i64) -> bool {
        (INPLACE_ADD..=INPLACE_XOR).contains(&code)
    }
}

/// `COMPARE_OP` operand layout: comparison selector in bits 5+, boolean-coerce
/// flag in bit 4. Matches CPython 3.13's `instr.arg >> 5` / `instr.arg & 16`
/// decode in `examples/original_source/pyton/sdk/transpiler.py`. Selector
/// order matches `dis.cmp_op`'s `<, <=, ==, !=, >, >=`.
pub mod cmp {
    pub const LT: i64 = 0;
    pub const LE: i64 = 1;
    pub const EQ: i64 = 2;
    pub const NE: i64 = 3;
    pub const GT: i64 = 4;
    pub const GE: i64 = 5;

    pub fn encode(selector: i64, coerce_bool: bool) -> i64 {
        (selector << 5) | if coerce_bool { 16 } else { 0 }
    }

    pub fn decode(arg: i64) -> (i64, bool) {
        (arg >> 5, (arg & 16) != 0)
    }
}

/// A compiled constant. `Code` holds a reference-counted nested code object
/// so the constant table can point back into the code-object tree without
/// duplicating it.
#[derive(Debug, Clone)]
pub enum Const {
    Bool(bool),
    None,
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Const>),
    Code(Rc<CodeObject>),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::None, Const::None) => true,
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            (Const::Tuple(a), Const::Tuple(b)) => a == b,
            // Every code object the loader produces is distinct; two code
            // constants are only "the same constant" if they're the same
            // allocation, matching CPython's effectively-by-identity
            // behavior for code objects in this pipeline.
            (Const::Code(a), Const::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Const {}

/// Stable key used by the constant interner (`interner.rs`); mirrors
/// [`Const`]'s shape but is hashable, which `f64` is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Bool(bool),
    None,
    Int(i64),
    Float(u64),
    Str(String),
    Tuple(Vec<ConstKey>),
    Code(usize),
}

impl Const {
    /// Computes the interning key for this constant. Nested tuples recurse;
    /// code constants key on their `Rc` allocation address.
    pub fn key(&self) -> ConstKey {
        match self {
            Const::Bool(b) => ConstKey::Bool(*b),
            Const::None => ConstKey::None,
            Const::Int(i) => ConstKey::Int(*i),
            Const::Float(f) => ConstKey::Float(f.to_bits()),
            Const::Str(s) => ConstKey::Str(s.clone()),
            Const::Tuple(items) => ConstKey::Tuple(items.iter().map(Const::key).collect()),
            Const::Code(code) => ConstKey::Code(Rc::as_ptr(code) as usize),
        }
    }
}

/// A single unit of compiled bytecode: a function body, class body, or
/// module body. Matches `spec.md` §3's "Code object" exactly.
#[derive(Debug, Clone)]
pub struct CodeObject {
    /// `<module>` for module-level code; the bare name otherwise.
    pub name: String,
    /// Dotted qualified name (e.g. `MyClass.method`), used for mangling.
    pub qualname: String,
    pub first_line: u32,
    pub stack_size: u32,
    pub consts: Vec<Const>,
    /// Names referenced by attribute/global lookup opcodes.
    pub names: Vec<String>,
    /// Local variable names, in declaration order; the first `arg_count`
    /// entries are the positional parameters (including `self`).
    pub varnames: Vec<String>,
    pub arg_count: usize,
    pub flags: CodeFlags,
    pub instructions: Vec<Instruction>,
    pub exception_table: Vec<ExceptionTableEntry>,
}

impl CodeObject {
    pub fn is_module(&self) -> bool {
        self.name == "<module>"
    }

    /// Finds the exception-table entry (if any) covering `offset`.
    pub fn exception_entry_at(&self, offset: usize) -> Option<&ExceptionTableEntry> {
        self.exception_table
            .iter()
            .find(|entry| entry.start <= offset && offset <= entry.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_key_distinguishes_int_and_float() {
        assert_ne!(Const::Int(1).key(), Const::Float(1.0).key());
    }

    #[test]
    fn const_key_stable_for_equal_strings() {
        assert_eq!(
            Const::Str("abc".into()).key(),
            Const::Str("abc".into()).key()
        );
    }

    #[test]
    fn const_key_distinguishes_distinct_code_objects() {
        let a = Rc::new(make_empty_code("a"));
        let b = Rc::new(make_empty_code("a"));
        assert_ne!(Const::Code(a).key(), Const::Code(b).key());
    }

    #[test]
    fn const_key_same_for_shared_code_object() {
        let a = Rc::new(make_empty_code("a"));
        assert_eq!(Const::Code(a.clone()).key(), Const::Code(a).key());
    }

    #[test]
    fn code_flags_roundtrip() {
        let mut flags = CodeFlags::EMPTY;
        assert!(!flags.contains(CodeFlags::VARARGS));
        flags.insert(CodeFlags::VARARGS);
        assert!(flags.contains(CodeFlags::VARARGS));
        assert!(!flags.contains(CodeFlags::VARKEYWORDS));
    }

    #[test]
    fn exception_entry_lookup_is_inclusive() {
        let mut code = make_empty_code("<module>");
        code.exception_table.push(ExceptionTableEntry {
            start: 2,
            end: 6,
            target: 8,
            depth: 1,
            lasti: false,
        });
        assert!(code.exception_entry_at(2).is_some());
        assert!(code.exception_entry_at(6).is_some());
        assert!(code.exception_entry_at(7).is_none());
    }

    fn make_empty_code(name: &str) -> CodeObject {
        CodeObject {
            name: name.to_string(),
            qualname: name.to_string(),
            first_line: 1,
            stack_size: 1,
            consts: vec![],
            names: vec![],
            varnames: vec![],
            arg_count: 0,
            flags: CodeFlags::EMPTY,
            instructions: vec![],
            exception_table: vec![],
        }
    }
}
