//! Compiles Python source text into Pyton's own [`CodeObject`] tree
//! (`SPEC_FULL.md` §0).
//!
//! There is no published crate that exposes CPython-exact bytecode for an
//! arbitrary host Rust program, so this module plays the role `compile()`
//! plays in the original implementation: it walks a real Python AST (via
//! `rustpython_parser`/`rustpython_ast`, the same crates the teacher already
//! depends on) and emits instruction sequences shaped exactly the way
//! `spec.md` §4.1 (imports), §4.2 (`@extern`), and §4.4 (class bodies via
//! `LOAD_BUILD_CLASS`) describe, so every later pipeline stage operates on
//! the same bytecode shapes the spec was written against.
//!
//! Supported surface is a deliberate subset of Python: the statement and
//! expression forms `spec.md`'s scenarios exercise, plus whatever real
//! CPython codegen they imply (e.g. the `PUSH_NULL` calling convention, or
//! `__build_class__`'s argument order). Anything outside that subset is a
//! fatal [`ErrorKind::UnsupportedFeature`], in keeping with §9's "fail loudly
//! on unrecognized shapes".

use std::rc::Rc;

use rustpython_parser::ast;
use rustpython_parser::Parse;

use crate::bytecode::{binop, cmp, CodeFlags, CodeObject, Const, ExceptionTableEntry, Instruction, Opcode};
use crate::error::{ErrorKind, SourceLocation, TranspileError, TranspileResult};

/// Parses `source` and lowers it into the module's top-level code object.
/// `module_label` is used only for diagnostics (it need not be a real path).
pub fn load_module(source: &str, module_label: &str) -> TranspileResult<Rc<CodeObject>> {
    let suite = ast::Suite::parse(source, module_label).map_err(|e| {
        TranspileError::new(ErrorKind::AssertionFailure(format!("parse error: {e}"))).with_location(
            SourceLocation {
                module: module_label.to_string(),
                offset: None,
            },
        )
    })?;
    let mut builder = CodeBuilder::new("<module>".to_string(), "<module>".to_string(), 0, false);
    compile_block(&mut builder, &suite)?;
    builder.emit_implicit_return_none();
    Ok(Rc::new(builder.finish()))
}

/// Renders a code object's instruction stream and exception table for
/// diagnostics (the original implementation's `print(dis.dis(fn))`).
pub fn disassemble(code: &CodeObject) -> String {
    let mut out = format!("{} (qualname={})\n", code.name, code.qualname);
    for instr in &code.instructions {
        out.push_str(&format!("{instr}\n"));
    }
    if !code.exception_table.is_empty() {
        out.push_str("exception table:\n");
        for entry in &code.exception_table {
            out.push_str(&format!(
                "  [{}, {}] -> {} (depth {}{})\n",
                entry.start,
                entry.end,
                entry.target,
                entry.depth,
                if entry.lasti { ", lasti" } else { "" }
            ));
        }
    }
    out
}

// ---------------------------------------------------------------------
// Code object construction
// ---------------------------------------------------------------------

struct PendingInstr {
    opcode: Opcode,
    arg: Option<i64>,
    jump_label: Option<usize>,
}

struct PendingExceptionEntry {
    start_idx: usize,
    end_idx: usize,
    handler_label: usize,
    depth: u32,
}

/// Builds a single [`CodeObject`], resolving labels to offsets on [`finish`].
///
/// [`finish`]: CodeBuilder::finish
struct CodeBuilder {
    name: String,
    qualname: String,
    arg_count: usize,
    is_function: bool,
    flags: CodeFlags,
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    instrs: Vec<PendingInstr>,
    labels: Vec<Option<usize>>,
    pending_exceptions: Vec<PendingExceptionEntry>,
    cur_stack: i64,
    max_stack: i64,
    loop_stack: Vec<(usize, usize)>,
}

impl CodeBuilder {
    fn new(name: String, qualname: String, arg_count: usize, is_function: bool) -> Self {
        let mut builder = Self {
            name,
            qualname,
            arg_count,
            is_function,
            flags: CodeFlags::EMPTY,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            instrs: Vec::new(),
            labels: Vec::new(),
            pending_exceptions: Vec::new(),
            cur_stack: -1,
            max_stack: 0,
            loop_stack: Vec::new(),
        };
        builder.emit(Opcode::Resume, None);
        builder
    }

    fn intern_name(&mut self, name: &str) -> i64 {
        intern_str(&mut self.names, name)
    }

    fn declare_varname(&mut self, name: &str) {
        if !self.varnames.iter().any(|v| v == name) {
            self.varnames.push(name.to_string());
        }
    }

    fn varname_index(&self, name: &str) -> Option<i64> {
        self.varnames.iter().position(|v| v == name).map(|i| i as i64)
    }

    fn intern_const(&mut self, value: Const) -> i64 {
        if let Some(idx) = self.consts.iter().position(|c| *c == value) {
            return idx as i64;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as i64
    }

    fn push(&mut self) {
        self.cur_stack += 1;
        self.max_stack = self.max_stack.max(self.cur_stack + 1);
    }

    fn pop(&mut self, n: i64) {
        self.cur_stack -= n;
    }

    fn emit(&mut self, opcode: Opcode, arg: Option<i64>) -> usize {
        self.instrs.push(PendingInstr {
            opcode,
            arg,
            jump_label: None,
        });
        self.instrs.len() - 1
    }

    fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn bind_label(&mut self, label: usize) {
        self.labels[label] = Some(self.instrs.len());
    }

    fn emit_jump(&mut self, opcode: Opcode, label: usize) -> usize {
        self.instrs.push(PendingInstr {
            opcode,
            arg: None,
            jump_label: Some(label),
        });
        self.instrs.len() - 1
    }

    /// Emits the (`NULL`/self-prefixed) `CALL` of `argc` positional
    /// arguments, accounting for the two prefix slots already pushed by the
    /// caller (either `PUSH_NULL` + callable, or a callable-variant
    /// `LOAD_ATTR`'s bound-method pair).
    fn emit_call(&mut self, argc: i64) {
        self.emit(Opcode::Call, Some(argc));
        self.pop(argc + 2);
        self.push();
    }

    fn emit_implicit_return_none(&mut self) {
        let none_idx = self.intern_const(Const::None);
        self.emit(Opcode::ReturnConst, Some(none_idx));
    }

    fn finish(self) -> CodeObject {
        let CodeBuilder {
            name,
            qualname,
            arg_count,
            flags,
            consts,
            names,
            varnames,
            instrs,
            labels,
            pending_exceptions,
            max_stack,
            ..
        } = self;

        let resolved_labels: Vec<usize> = labels
            .into_iter()
            .map(|bound| bound.expect("every label allocated by the loader must be bound"))
            .collect();

        let instructions: Vec<Instruction> = instrs
            .into_iter()
            .enumerate()
            .map(|(idx, pending)| {
                let offset = idx * 2;
                let mut instr = Instruction::new(pending.opcode, pending.arg, offset);
                if let Some(label) = pending.jump_label {
                    instr = instr.with_jump_target(resolved_labels[label] * 2);
                }
                instr
            })
            .collect();

        let exception_table = pending_exceptions
            .into_iter()
            .map(|entry| ExceptionTableEntry {
                start: entry.start_idx * 2,
                end: entry.end_idx * 2,
                target: resolved_labels[entry.handler_label] * 2,
                depth: entry.depth,
                lasti: false,
            })
            .collect();

        CodeObject {
            name,
            qualname,
            first_line: 1,
            stack_size: max_stack.max(1) as u32,
            consts,
            names,
            varnames,
            arg_count,
            flags,
            instructions,
            exception_table,
        }
    }
}

fn intern_str(pool: &mut Vec<String>, value: &str) -> i64 {
    if let Some(idx) = pool.iter().position(|existing| existing == value) {
        return idx as i64;
    }
    pool.push(value.to_string());
    (pool.len() - 1) as i64
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

// ---------------------------------------------------------------------
// Local-variable pre-pass
// ---------------------------------------------------------------------

/// Scans a function body for assignment targets ahead of codegen, mirroring
/// CPython's symbol-table pass: every name a function assigns is local for
/// its *entire* body, even before the first assignment lexically appears.
fn collect_locals(params: &[String], body: &[ast::Stmt]) -> Vec<String> {
    let mut locals = params.to_vec();
    walk_locals(body, &mut locals);
    locals
}

fn walk_locals(stmts: &[ast::Stmt], locals: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            ast::Stmt::Assign(a) => {
                if let Some(ast::Expr::Name(n)) = a.targets.first() {
                    push_unique(locals, n.id.to_string());
                }
            }
            ast::Stmt::AugAssign(a) => {
                if let ast::Expr::Name(n) = a.target.as_ref() {
                    push_unique(locals, n.id.to_string());
                }
            }
            ast::Stmt::For(f) => {
                if let ast::Expr::Name(n) = f.target.as_ref() {
                    push_unique(locals, n.id.to_string());
                }
                walk_locals(&f.body, locals);
                walk_locals(&f.orelse, locals);
            }
            ast::Stmt::If(i) => {
                walk_locals(&i.body, locals);
                walk_locals(&i.orelse, locals);
            }
            ast::Stmt::While(w) => {
                walk_locals(&w.body, locals);
                walk_locals(&w.orelse, locals);
            }
            ast::Stmt::Try(t) => {
                walk_locals(&t.body, locals);
                for handler in &t.handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    walk_locals(&handler.body, locals);
                }
                walk_locals(&t.orelse, locals);
                walk_locals(&t.finalbody, locals);
            }
            ast::Stmt::FunctionDef(f) => push_unique(locals, f.name.to_string()),
            ast::Stmt::ClassDef(c) => push_unique(locals, c.name.to_string()),
            ast::Stmt::Import(imp) => {
                for alias in &imp.names {
                    let stored = alias
                        .asname
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| first_component(alias.name.as_str()));
                    push_unique(locals, stored);
                }
            }
            ast::Stmt::ImportFrom(imp) => {
                for alias in &imp.names {
                    let stored = alias.asname.as_ref().unwrap_or(&alias.name).to_string();
                    push_unique(locals, stored);
                }
            }
            _ => {}
        }
    }
}

fn first_component(dotted: &str) -> String {
    dotted.split('.').next().unwrap_or(dotted).to_string()
}

// ---------------------------------------------------------------------
// Statement compilation
// ---------------------------------------------------------------------

fn compile_block(builder: &mut CodeBuilder, stmts: &[ast::Stmt]) -> TranspileResult<()> {
    for stmt in stmts {
        compile_stmt(builder, stmt)?;
    }
    Ok(())
}

fn unsupported(what: impl Into<String>) -> TranspileError {
    TranspileError::new(ErrorKind::UnsupportedFeature(what.into()))
}

fn compile_stmt(builder: &mut CodeBuilder, stmt: &ast::Stmt) -> TranspileResult<()> {
    match stmt {
        ast::Stmt::FunctionDef(f) => compile_function_def(builder, f),
        ast::Stmt::AsyncFunctionDef(_) => Err(unsupported("async function definitions")),
        ast::Stmt::ClassDef(c) => compile_class_def(builder, c),
        ast::Stmt::Return(r) => compile_return(builder, r),
        ast::Stmt::Assign(a) => compile_assign(builder, a),
        ast::Stmt::AugAssign(a) => compile_aug_assign(builder, a),
        ast::Stmt::AnnAssign(a) => compile_ann_assign(builder, a),
        ast::Stmt::If(i) => compile_if(builder, i),
        ast::Stmt::While(w) => compile_while(builder, w),
        ast::Stmt::For(f) => compile_for(builder, f),
        ast::Stmt::Try(t) => compile_try(builder, t),
        ast::Stmt::Raise(r) => compile_raise(builder, r),
        ast::Stmt::Import(imp) => compile_import(builder, imp),
        ast::Stmt::ImportFrom(imp) => compile_import_from(builder, imp),
        ast::Stmt::Expr(e) => {
            compile_expr(builder, &e.value)?;
            builder.emit(Opcode::PopTop, None);
            builder.pop(1);
            Ok(())
        }
        ast::Stmt::Pass(_) => Ok(()),
        ast::Stmt::Break(_) => {
            let (_, break_label) = *builder
                .loop_stack
                .last()
                .ok_or_else(|| unsupported("break outside a loop"))?;
            builder.emit_jump(Opcode::JumpBackward, break_label);
            Ok(())
        }
        ast::Stmt::Continue(_) => {
            let (continue_label, _) = *builder
                .loop_stack
                .last()
                .ok_or_else(|| unsupported("continue outside a loop"))?;
            builder.emit_jump(Opcode::JumpBackward, continue_label);
            Ok(())
        }
        other => Err(unsupported(format!("statement form {other:?}"))),
    }
}

fn compile_return(builder: &mut CodeBuilder, r: &ast::StmtReturn) -> TranspileResult<()> {
    match &r.value {
        None => builder.emit_implicit_return_none(),
        Some(value) => match value.as_ref() {
            ast::Expr::Constant(c) => {
                let konst = constant_to_const(&c.value)?;
                let idx = builder.intern_const(konst);
                builder.emit(Opcode::ReturnConst, Some(idx));
            }
            other => {
                compile_expr(builder, other)?;
                builder.emit(Opcode::ReturnValue, None);
                builder.pop(1);
            }
        },
    }
    Ok(())
}

fn compile_assign(builder: &mut CodeBuilder, a: &ast::StmtAssign) -> TranspileResult<()> {
    if a.targets.len() != 1 {
        return Err(unsupported("multiple assignment targets"));
    }
    compile_expr(builder, &a.value)?;
    store_target(builder, &a.targets[0])
}

fn compile_ann_assign(builder: &mut CodeBuilder, a: &ast::StmtAnnAssign) -> TranspileResult<()> {
    let Some(value) = &a.value else {
        // A bare annotation (`x: int`) declares a name without binding it;
        // nothing executes at module/function scope.
        return Ok(());
    };
    compile_expr(builder, value)?;
    store_target(builder, &a.target)
}

fn store_target(builder: &mut CodeBuilder, target: &ast::Expr) -> TranspileResult<()> {
    match target {
        ast::Expr::Name(n) => {
            let (opcode, idx) = resolve_store(builder, n.id.as_str());
            builder.emit(opcode, Some(idx));
            builder.pop(1);
            Ok(())
        }
        ast::Expr::Attribute(attr) => {
            compile_expr(builder, &attr.value)?;
            let name_idx = builder.intern_name(attr.attr.as_str());
            builder.emit(Opcode::StoreAttr, Some(name_idx));
            builder.pop(2);
            Ok(())
        }
        other => Err(unsupported(format!("assignment target {other:?}"))),
    }
}

fn compile_aug_assign(builder: &mut CodeBuilder, a: &ast::StmtAugAssign) -> TranspileResult<()> {
    let op = binop_code(&a.op, true)?;
    match a.target.as_ref() {
        ast::Expr::Name(n) => {
            let (load_op, idx) = resolve_load(builder, n.id.as_str())?;
            builder.emit(load_op, Some(idx));
            builder.push();
            compile_expr(builder, &a.value)?;
            builder.emit(Opcode::BinaryOp, Some(op));
            builder.pop(1);
            let (store_op, store_idx) = resolve_store(builder, n.id.as_str());
            builder.emit(store_op, Some(store_idx));
            builder.pop(1);
            Ok(())
        }
        ast::Expr::Attribute(attr) => {
            compile_expr(builder, &attr.value)?;
            let name_idx = builder.intern_name(attr.attr.as_str());
            builder.emit(Opcode::LoadAttr, Some(name_idx << 1));
            compile_expr(builder, &a.value)?;
            builder.emit(Opcode::BinaryOp, Some(op));
            builder.pop(1);
            compile_expr(builder, &attr.value)?;
            builder.emit(Opcode::StoreAttr, Some(name_idx));
            builder.pop(2);
            Ok(())
        }
        other => Err(unsupported(format!("augmented-assignment target {other:?}"))),
    }
}

fn compile_if(builder: &mut CodeBuilder, i: &ast::StmtIf) -> TranspileResult<()> {
    compile_expr(builder, &i.test)?;
    let else_label = builder.new_label();
    builder.emit_jump(Opcode::PopJumpIfFalse, else_label);
    builder.pop(1);
    compile_block(builder, &i.body)?;

    let body_terminates = matches!(i.body.last(), Some(ast::Stmt::Return(_)) | Some(ast::Stmt::Raise(_)));

    if i.orelse.is_empty() {
        builder.bind_label(else_label);
        return Ok(());
    }

    if body_terminates {
        builder.bind_label(else_label);
        compile_block(builder, &i.orelse)?;
    } else {
        let end_label = builder.new_label();
        builder.emit_jump(Opcode::JumpBackward, end_label);
        builder.bind_label(else_label);
        compile_block(builder, &i.orelse)?;
        builder.bind_label(end_label);
    }
    Ok(())
}

fn compile_while(builder: &mut CodeBuilder, w: &ast::StmtWhile) -> TranspileResult<()> {
    if !w.orelse.is_empty() {
        return Err(unsupported("while/else"));
    }
    let test_label = builder.new_label();
    builder.bind_label(test_label);
    let end_label = builder.new_label();

    compile_expr(builder, &w.test)?;
    builder.emit_jump(Opcode::PopJumpIfFalse, end_label);
    builder.pop(1);

    builder.loop_stack.push((test_label, end_label));
    compile_block(builder, &w.body)?;
    builder.loop_stack.pop();

    builder.emit_jump(Opcode::JumpBackward, test_label);
    builder.bind_label(end_label);
    Ok(())
}

fn compile_for(builder: &mut CodeBuilder, f: &ast::StmtFor) -> TranspileResult<()> {
    if !f.orelse.is_empty() {
        return Err(unsupported("for/else"));
    }
    let ast::Expr::Name(target_name) = f.target.as_ref() else {
        return Err(unsupported("for-loop target other than a bare name"));
    };

    compile_expr(builder, &f.iter)?;
    builder.emit(Opcode::GetIter, None);

    let loop_start = builder.new_label();
    let loop_end = builder.new_label();
    builder.bind_label(loop_start);
    builder.emit_jump(Opcode::ForIter, loop_end);
    builder.push();

    let (store_op, store_idx) = resolve_store(builder, target_name.id.as_str());
    builder.emit(store_op, Some(store_idx));
    builder.pop(1);

    builder.loop_stack.push((loop_start, loop_end));
    compile_block(builder, &f.body)?;
    builder.loop_stack.pop();

    builder.emit_jump(Opcode::JumpBackwardNoInterrupt, loop_start);
    builder.bind_label(loop_end);
    builder.emit(Opcode::EndFor, None);
    builder.pop(1);
    Ok(())
}

fn compile_try(builder: &mut CodeBuilder, t: &ast::StmtTry) -> TranspileResult<()> {
    if !t.orelse.is_empty() || !t.finalbody.is_empty() {
        return Err(unsupported("try/else or try/finally"));
    }
    if t.handlers.is_empty() {
        return Err(unsupported("try without any except handler"));
    }

    let depth = (builder.cur_stack + 1).max(0) as u32;
    let start_idx = builder.instrs.len();
    compile_block(builder, &t.body)?;
    let end_idx = builder.instrs.len() - 1;

    let after_label = builder.new_label();
    builder.emit_jump(Opcode::JumpBackward, after_label);

    let handler_label = builder.new_label();
    builder.bind_label(handler_label);
    builder.pending_exceptions.push(PendingExceptionEntry {
        start_idx,
        end_idx,
        handler_label,
        depth,
    });

    builder.emit(Opcode::PushExcInfo, None);
    builder.push();

    let handler_count = t.handlers.len();
    for (i, handler) in t.handlers.iter().enumerate() {
        let ast::ExceptHandler::ExceptHandler(handler) = handler;
        let is_last = i + 1 == handler_count;
        let next_label = if is_last { None } else { Some(builder.new_label()) };

        if let Some(exc_type) = &handler.type_ {
            if is_last {
                return Err(unsupported("bare except must be the last handler"));
            }
            compile_expr(builder, exc_type)?;
            builder.emit(Opcode::CheckExcMatch, None);
            let skip_label = next_label.expect("typed handler always has a fallthrough label");
            builder.emit_jump(Opcode::PopJumpIfFalse, skip_label);
            builder.pop(1);
        }

        compile_block(builder, &handler.body)?;
        builder.emit_jump(Opcode::JumpBackward, after_label);

        if let Some(next_label) = next_label {
            builder.bind_label(next_label);
        } else if handler.type_.is_some() {
            // Exhausted every typed handler with no match: propagate.
            builder.emit(Opcode::Reraise, Some(0));
        }
    }

    builder.bind_label(after_label);
    builder.emit(Opcode::PopExcept, None);
    builder.pop(1);
    Ok(())
}

fn compile_raise(builder: &mut CodeBuilder, r: &ast::StmtRaise) -> TranspileResult<()> {
    if r.cause.is_some() {
        return Err(unsupported("raise ... from ... (cause)"));
    }
    match &r.exc {
        None => {
            builder.emit(Opcode::RaiseVarargs, Some(0));
        }
        Some(exc) => {
            compile_expr(builder, exc)?;
            builder.emit(Opcode::RaiseVarargs, Some(1));
            builder.pop(1);
        }
    }
    Ok(())
}

fn compile_import(builder: &mut CodeBuilder, imp: &ast::StmtImport) -> TranspileResult<()> {
    for alias in &imp.names {
        let level_idx = builder.intern_const(Const::Int(0));
        builder.emit(Opcode::LoadConst, Some(level_idx));
        builder.push();
        let fromlist_idx = builder.intern_const(Const::None);
        builder.emit(Opcode::LoadConst, Some(fromlist_idx));
        builder.push();

        let name_idx = builder.intern_name(alias.name.as_str());
        builder.emit(Opcode::ImportName, Some(name_idx));
        builder.pop(2);
        builder.push();

        let stored = alias
            .asname
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| first_component(alias.name.as_str()));
        let (store_op, store_idx) = resolve_store(builder, &stored);
        builder.emit(store_op, Some(store_idx));
        builder.pop(1);
    }
    Ok(())
}

fn compile_import_from(builder: &mut CodeBuilder, imp: &ast::StmtImportFrom) -> TranspileResult<()> {
    if imp.level.map(|l| l.to_u32()).unwrap_or(0) != 0 {
        return Err(unsupported("relative imports"));
    }
    let module = imp
        .module
        .as_ref()
        .ok_or_else(|| unsupported("from-import with no module name"))?;

    let level_idx = builder.intern_const(Const::Int(0));
    builder.emit(Opcode::LoadConst, Some(level_idx));
    builder.push();

    let fromlist = Const::Tuple(imp.names.iter().map(|a| Const::Str(a.name.to_string())).collect());
    let fromlist_idx = builder.intern_const(fromlist);
    builder.emit(Opcode::LoadConst, Some(fromlist_idx));
    builder.push();

    let module_idx = builder.intern_name(module.as_str());
    builder.emit(Opcode::ImportName, Some(module_idx));
    builder.pop(2);
    builder.push();

    for alias in &imp.names {
        let origin_idx = builder.intern_name(alias.name.as_str());
        builder.emit(Opcode::ImportFrom, Some(origin_idx));
        builder.push();

        let stored = alias.asname.as_ref().unwrap_or(&alias.name).to_string();
        let (store_op, store_idx) = resolve_store(builder, &stored);
        builder.emit(store_op, Some(store_idx));
        builder.pop(1);
    }

    builder.emit(Opcode::PopTop, None);
    builder.pop(1);
    Ok(())
}

// ---------------------------------------------------------------------
// Function and class definitions
// ---------------------------------------------------------------------

enum AnnotationType<'a> {
    None,
    Name(&'a str),
}

fn annotation_type(expr: &ast::Expr) -> TranspileResult<AnnotationType<'_>> {
    match expr {
        ast::Expr::Constant(c) if matches!(c.value, ast::Constant::None) => Ok(AnnotationType::None),
        ast::Expr::Name(n) => Ok(AnnotationType::Name(n.id.as_str())),
        other => Err(unsupported(format!("extern annotation form {other:?}"))),
    }
}

fn compile_function_def(builder: &mut CodeBuilder, f: &ast::StmtFunctionDef) -> TranspileResult<()> {
    if !f.args.posonlyargs.is_empty() || !f.args.kwonlyargs.is_empty() {
        return Err(unsupported("positional-only or keyword-only parameters"));
    }
    if f.args.args.iter().any(|a| a.default.is_some()) {
        return Err(unsupported("default arguments"));
    }

    let is_extern = match f.decorator_list.as_slice() {
        [] => false,
        [ast::Expr::Name(n)] if n.id.as_str() == "extern" => true,
        _ => return Err(unsupported("decorators other than a bare @extern")),
    };

    let mut params: Vec<String> = f.args.args.iter().map(|a| a.def.arg.to_string()).collect();
    let mut flags = CodeFlags::EMPTY;
    if let Some(vararg) = &f.args.vararg {
        params.push(vararg.arg.to_string());
        flags.insert(CodeFlags::VARARGS);
    }
    if let Some(kwarg) = &f.args.kwarg {
        params.push(kwarg.arg.to_string());
        flags.insert(CodeFlags::VARKEYWORDS);
    }

    let qualname = format!("{}.{}", builder.qualname, f.name.as_str());
    let arg_count = f.args.args.len();
    let mut nested = CodeBuilder::new(f.name.to_string(), qualname, arg_count, true);
    nested.flags = flags;
    for param in &params {
        nested.declare_varname(param);
    }
    // Params are declared above in source order; the locals pre-pass adds
    // every other assigned name in first-use order.
    for local in collect_locals(&params, &f.body) {
        nested.declare_varname(&local);
    }
    compile_block(&mut nested, &f.body)?;
    nested.emit_implicit_return_none();
    let code_obj = Rc::new(nested.finish());

    let mut annotations: Vec<(String, AnnotationType)> = Vec::new();
    for arg in &f.args.args {
        if let Some(ann) = &arg.def.annotation {
            annotations.push((arg.def.arg.to_string(), annotation_type(ann)?));
        }
    }
    if let Some(ret) = &f.returns {
        annotations.push(("return".to_string(), annotation_type(ret)?));
    }

    if is_extern {
        builder.emit(Opcode::PushNull, None);
        builder.push();
        let extern_idx = builder.intern_name("extern");
        builder.emit(Opcode::LoadName, Some(extern_idx));
        builder.push();
        emit_annotation_pairs(builder, &annotations);
        let code_idx = builder.intern_const(Const::Code(code_obj));
        builder.emit(Opcode::LoadConst, Some(code_idx));
        builder.push();
        builder.emit(Opcode::MakeFunction, None);
        builder.emit(Opcode::SetFunctionAttribute, Some(0x04));
        builder.pop(1);
        builder.emit_call(1);
        let (store_op, store_idx) = resolve_store(builder, f.name.as_str());
        builder.emit(store_op, Some(store_idx));
        builder.pop(1);
        return Ok(());
    }

    if annotations.is_empty() {
        let code_idx = builder.intern_const(Const::Code(code_obj));
        builder.emit(Opcode::LoadConst, Some(code_idx));
        builder.push();
        builder.emit(Opcode::MakeFunction, None);
    } else {
        emit_annotation_pairs(builder, &annotations);
        let code_idx = builder.intern_const(Const::Code(code_obj));
        builder.emit(Opcode::LoadConst, Some(code_idx));
        builder.push();
        builder.emit(Opcode::MakeFunction, None);
        builder.emit(Opcode::SetFunctionAttribute, Some(0x04));
        builder.pop(1);
    }
    let (store_op, store_idx) = resolve_store(builder, f.name.as_str());
    builder.emit(store_op, Some(store_idx));
    builder.pop(1);
    Ok(())
}

fn emit_annotation_pairs(builder: &mut CodeBuilder, annotations: &[(String, AnnotationType)]) {
    for (name, ty) in annotations {
        let pname_idx = builder.intern_const(Const::Str(name.clone()));
        builder.emit(Opcode::LoadConst, Some(pname_idx));
        builder.push();
        match ty {
            AnnotationType::None => {
                let none_idx = builder.intern_const(Const::None);
                builder.emit(Opcode::LoadConst, Some(none_idx));
            }
            AnnotationType::Name(type_name) => {
                let type_idx = builder.intern_name(type_name);
                builder.emit(Opcode::LoadName, Some(type_idx));
            }
        }
        builder.push();
    }
    let count = (annotations.len() * 2) as i64;
    builder.emit(Opcode::BuildTuple, Some(count));
    builder.pop(count);
    builder.push();
}

fn compile_class_def(builder: &mut CodeBuilder, c: &ast::StmtClassDef) -> TranspileResult<()> {
    if !c.keywords.is_empty() {
        return Err(unsupported("class keyword arguments (e.g. metaclass=)"));
    }

    builder.emit(Opcode::PushNull, None);
    builder.push();
    builder.emit(Opcode::LoadBuildClass, None);
    builder.push();

    let qualname = if builder.name == "<module>" {
        c.name.to_string()
    } else {
        format!("{}.{}", builder.qualname, c.name.as_str())
    };
    let mut nested = CodeBuilder::new(c.name.to_string(), qualname, 0, false);
    compile_block(&mut nested, &c.body)?;
    nested.emit_implicit_return_none();
    let class_code = Rc::new(nested.finish());

    let code_idx = builder.intern_const(Const::Code(class_code));
    builder.emit(Opcode::LoadConst, Some(code_idx));
    builder.push();
    builder.emit(Opcode::MakeFunction, None);

    let name_idx = builder.intern_const(Const::Str(c.name.to_string()));
    builder.emit(Opcode::LoadConst, Some(name_idx));
    builder.push();

    for base in &c.bases {
        compile_expr(builder, base)?;
    }

    let argc = 2 + c.bases.len() as i64;
    builder.emit_call(argc);

    let (store_op, store_idx) = resolve_store(builder, c.name.as_str());
    builder.emit(store_op, Some(store_idx));
    builder.pop(1);
    Ok(())
}

// ---------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------

fn compile_expr(builder: &mut CodeBuilder, expr: &ast::Expr) -> TranspileResult<()> {
    match expr {
        ast::Expr::Constant(c) => {
            let konst = constant_to_const(&c.value)?;
            let idx = builder.intern_const(konst);
            builder.emit(Opcode::LoadConst, Some(idx));
            builder.push();
            Ok(())
        }
        ast::Expr::Name(n) => {
            let (opcode, idx) = resolve_load(builder, n.id.as_str())?;
            builder.emit(opcode, Some(idx));
            builder.push();
            Ok(())
        }
        ast::Expr::Attribute(attr) => {
            compile_expr(builder, &attr.value)?;
            let name_idx = builder.intern_name(attr.attr.as_str());
            builder.emit(Opcode::LoadAttr, Some(name_idx << 1));
            Ok(())
        }
        ast::Expr::BinOp(b) => {
            compile_expr(builder, &b.left)?;
            compile_expr(builder, &b.right)?;
            let code = binop_code(&b.op, false)?;
            builder.emit(Opcode::BinaryOp, Some(code));
            builder.pop(1);
            Ok(())
        }
        ast::Expr::Compare(c) => compile_compare(builder, c),
        ast::Expr::Call(call) => compile_call(builder, call),
        ast::Expr::Tuple(t) => {
            for elt in &t.elts {
                compile_expr(builder, elt)?;
            }
            let count = t.elts.len() as i64;
            builder.emit(Opcode::BuildTuple, Some(count));
            builder.pop(count);
            builder.push();
            Ok(())
        }
        ast::Expr::Subscript(s) => {
            compile_expr(builder, &s.value)?;
            compile_expr(builder, &s.slice)?;
            builder.emit(Opcode::BinaryOp, Some(binop::SUBSCR));
            builder.pop(1);
            Ok(())
        }
        other => Err(unsupported(format!("expression form {other:?}"))),
    }
}

fn compile_compare(builder: &mut CodeBuilder, c: &ast::ExprCompare) -> TranspileResult<()> {
    if c.ops.len() != 1 || c.comparators.len() != 1 {
        return Err(unsupported("chained comparisons (a < b < c)"));
    }
    compile_expr(builder, &c.left)?;
    compile_expr(builder, &c.comparators[0])?;
    let selector = cmp_selector(&c.ops[0])?;
    builder.emit(Opcode::CompareOp, Some(cmp::encode(selector, true)));
    builder.pop(1);
    Ok(())
}

fn compile_call(builder: &mut CodeBuilder, call: &ast::ExprCall) -> TranspileResult<()> {
    if !call.keywords.is_empty() {
        return Err(unsupported("keyword arguments in a call"));
    }

    match call.func.as_ref() {
        ast::Expr::Attribute(attr) => {
            compile_expr(builder, &attr.value)?;
            let name_idx = builder.intern_name(attr.attr.as_str());
            builder.emit(Opcode::LoadAttr, Some((name_idx << 1) | 1));
            builder.push();
        }
        other => {
            builder.emit(Opcode::PushNull, None);
            builder.push();
            compile_expr(builder, other)?;
        }
    }

    for arg in &call.args {
        compile_expr(builder, arg)?;
    }
    builder.emit_call(call.args.len() as i64);
    Ok(())
}

fn constant_to_const(c: &ast::Constant) -> TranspileResult<Const> {
    match c {
        ast::Constant::None => Ok(Const::None),
        ast::Constant::Bool(b) => Ok(Const::Bool(*b)),
        ast::Constant::Int(i) => {
            let value: i64 = i
                .try_into()
                .map_err(|_| unsupported("integer literal does not fit in 64 bits"))?;
            Ok(Const::Int(value))
        }
        ast::Constant::Float(f) => Ok(Const::Float(*f)),
        ast::Constant::Str(s) => Ok(Const::Str(s.to_string())),
        ast::Constant::Tuple(items) => {
            let parts = items.iter().map(constant_to_const).collect::<TranspileResult<Vec<_>>>()?;
            Ok(Const::Tuple(parts))
        }
        other => Err(TranspileError::new(ErrorKind::UnknownConstantType(format!("{other:?}")))),
    }
}

fn binop_code(op: &ast::Operator, inplace: bool) -> TranspileResult<i64> {
    use ast::Operator::*;
    let code = match (op, inplace) {
        (Add, false) => binop::ADD,
        (Add, true) => binop::INPLACE_ADD,
        (Sub, false) => binop::SUBTRACT,
        (Sub, true) => binop::INPLACE_SUBTRACT,
        (Mult, false) => binop::MULTIPLY,
        (Mult, true) => binop::INPLACE_MULTIPLY,
        (Div, false) => binop::TRUE_DIVIDE,
        (Div, true) => binop::INPLACE_TRUE_DIVIDE,
        (FloorDiv, false) => binop::FLOOR_DIVIDE,
        (FloorDiv, true) => binop::INPLACE_FLOOR_DIVIDE,
        (Mod, false) => binop::REMAINDER,
        (Mod, true) => binop::INPLACE_REMAINDER,
        (Pow, false) => binop::POWER,
        (Pow, true) => binop::INPLACE_POWER,
        (LShift, false) => binop::LSHIFT,
        (LShift, true) => binop::INPLACE_LSHIFT,
        (RShift, false) => binop::RSHIFT,
        (RShift, true) => binop::INPLACE_RSHIFT,
        (BitAnd, false) => binop::AND,
        (BitAnd, true) => binop::INPLACE_AND,
        (BitOr, false) => binop::OR,
        (BitOr, true) => binop::INPLACE_OR,
        (BitXor, false) => binop::XOR,
        (BitXor, true) => binop::INPLACE_XOR,
        (MatMult, _) => return Err(unsupported("matrix-multiplication operator")),
    };
    Ok(code)
}

fn cmp_selector(op: &ast::CmpOp) -> TranspileResult<i64> {
    use ast::CmpOp::*;
    match op {
        Lt => Ok(cmp::LT),
        LtE => Ok(cmp::LE),
        Eq => Ok(cmp::EQ),
        NotEq => Ok(cmp::NE),
        Gt => Ok(cmp::GT),
        GtE => Ok(cmp::GE),
        Is | IsNot | In | NotIn => Err(unsupported("identity/membership comparisons")),
    }
}

// ---------------------------------------------------------------------
// Scope-dependent name resolution
// ---------------------------------------------------------------------

/// `LOAD_NAME`/`LOAD_FAST`/`LOAD_GLOBAL` choice per `spec.md` §4.5: module
/// and class-body scope always address the names table; function scope
/// addresses a local slot when the name is assigned somewhere in the body,
/// else falls back to a global lookup (there is no way to write to a global
/// from function scope without a `global` declaration, which this subset
/// doesn't support, so loads are the only place this fallback applies).
fn resolve_load(builder: &mut CodeBuilder, name: &str) -> TranspileResult<(Opcode, i64)> {
    if builder.is_function {
        if let Some(idx) = builder.varname_index(name) {
            return Ok((Opcode::LoadFast, idx));
        }
        let idx = builder.intern_name(name);
        return Ok((Opcode::LoadGlobal, idx << 1));
    }
    Ok((Opcode::LoadName, builder.intern_name(name)))
}

fn resolve_store(builder: &mut CodeBuilder, name: &str) -> (Opcode, i64) {
    if builder.is_function {
        if let Some(idx) = builder.varname_index(name) {
            return (Opcode::StoreFast, idx);
        }
        // The locals pre-pass declares every assigned name before codegen
        // runs, so this only happens for synthetic stores the pre-pass
        // doesn't see (there are none in this subset); declare it lazily
        // rather than silently falling back to STORE_NAME, which `STORE_FAST`
        // emitters above already assume doesn't happen for locals.
        builder.declare_varname(name);
        let idx = builder.varname_index(name).expect("just declared");
        return (Opcode::StoreFast, idx);
    }
    (Opcode::StoreName, builder.intern_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_world_emits_one_string_const_and_print_call() {
        let code = load_module("print(\"hi\")\n", "<module>").expect("loads");
        assert!(code.consts.iter().any(|c| matches!(c, Const::Str(s) if s == "hi")));
        assert!(code.names.iter().any(|n| n == "print"));
        assert!(code
            .instructions
            .iter()
            .any(|i| i.opcode == Opcode::Call));
    }

    #[test]
    fn selective_import_emits_import_name_and_import_from() {
        let code = load_module("from other import abc\nabc()\n", "<module>").expect("loads");
        assert!(code.instructions.iter().any(|i| i.opcode == Opcode::ImportName));
        assert!(code.instructions.iter().any(|i| i.opcode == Opcode::ImportFrom));
        assert!(code.instructions.iter().any(|i| i.opcode == Opcode::PopTop));
    }

    #[test]
    fn full_import_is_still_recognizable_to_the_scanner() {
        let code = load_module("import other\n", "<module>").expect("loads");
        let import_idx = code
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::ImportName)
            .expect("import anchor present");
        assert_eq!(code.instructions[import_idx - 1].opcode, Opcode::LoadConst);
        assert_eq!(code.instructions[import_idx - 2].opcode, Opcode::LoadConst);
        assert_eq!(code.instructions[import_idx + 1].opcode, Opcode::StoreName);
    }

    #[test]
    fn class_body_references_load_build_class() {
        let code = load_module("class K:\n    x = 1\n", "<module>").expect("loads");
        assert!(code.instructions.iter().any(|i| i.opcode == Opcode::LoadBuildClass));
    }

    #[test]
    fn extern_decorator_emits_annotation_pairs_and_call() {
        let code = load_module("@extern\ndef foo(x: int) -> bool:\n    ...\n", "<module>").expect("loads");
        let extern_load = code
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::LoadName && code.names[i.arg.unwrap() as usize] == "extern")
            .expect("extern anchor present");
        assert_eq!(code.instructions[extern_load + 1].opcode, Opcode::LoadConst);
        let set_attr_idx = code
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::SetFunctionAttribute)
            .expect("SET_FUNCTION_ATTRIBUTE present");
        assert_eq!(code.instructions[set_attr_idx + 1].opcode, Opcode::Call);
        assert_eq!(code.instructions[set_attr_idx + 2].opcode, Opcode::StoreName);
    }

    #[test]
    fn try_except_produces_an_exception_table_entry() {
        let source = "try:\n    raise X\nexcept X:\n    pass\n";
        let code = load_module(source, "<module>").expect("loads");
        assert_eq!(code.exception_table.len(), 1);
        let entry = &code.exception_table[0];
        assert!(entry.start < entry.end);
        let handler = code
            .instructions
            .iter()
            .find(|i| i.offset == entry.target)
            .expect("handler label resolves to a real instruction");
        assert_eq!(handler.opcode, Opcode::PushExcInfo);
    }

    #[test]
    fn for_loop_closes_with_end_for() {
        let code = load_module("for i in xs:\n    pass\n", "<module>").expect("loads");
        assert_eq!(code.instructions.last().map(|i| i.opcode), Some(Opcode::EndFor));
    }

    #[test]
    fn default_arguments_are_rejected() {
        let err = load_module("def f(x=1):\n    pass\n", "<module>").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedFeature(_)));
    }

    #[test]
    fn relative_imports_are_rejected() {
        let err = load_module("from . import x\n", "<module>").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedFeature(_)));
    }
}
