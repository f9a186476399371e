use byteorder::{ByteOrder, LittleEndian};

use crate::ast::{Expr, FunctionDef, Module, Stmt};
use crate::error::DeslateError;
use crate::opcode::Op;
use crate::unit::{CodeUnit, Const, ExceptionEntry, LineEntry, UNIT_FLAG_MODULE};

/// Host compiler: lowers ASTs to CodeUnits. Emission sticks to the fixed
/// idiom catalog the reconstructor recognizes, which is what keeps
/// compile-then-decompile total.
struct CodeBuilder {
    name: String,
    origin: String,
    first_line: u32,
    flags: u32,
    param_count: u16,
    code: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<String>,
    varnames: Vec<String>,
    nested: Vec<CodeUnit>,
    exc_table: Vec<ExceptionEntry>,
    lines: Vec<LineEntry>,
    last_line: u32,
    locals: Vec<String>,
    loop_stack: Vec<LoopCtx>,
    finally_depth: usize,
}

struct LoopCtx {
    start: usize,
    break_jumps: Vec<usize>,
}

impl CodeBuilder {
    fn new(name: &str, origin: &str, first_line: u32) -> Self {
        Self {
            name: name.to_string(),
            origin: origin.to_string(),
            first_line,
            flags: 0,
            param_count: 0,
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            nested: Vec::new(),
            exc_table: Vec::new(),
            lines: Vec::new(),
            last_line: 0,
            locals: Vec::new(),
            loop_stack: Vec::new(),
            finally_depth: 0,
        }
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn set_line(&mut self, line: u32) {
        if line != 0 && line != self.last_line {
            self.lines.push(LineEntry { offset: self.here() as u32, line });
            self.last_line = line;
        }
    }

    fn emit(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    fn emit_u8(&mut self, op: Op, v: u8) {
        self.code.push(op as u8);
        self.code.push(v);
    }

    fn emit_u16(&mut self, op: Op, v: u16) {
        self.code.push(op as u8);
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.code.extend_from_slice(&b);
    }

    /// Emits a jump with a placeholder target; returns the operand position
    /// for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.code.push(op as u8);
        let pos = self.code.len();
        self.code.extend_from_slice(&[0, 0]);
        pos
    }

    fn emit_jump_to(&mut self, op: Op, target: usize) -> Result<(), DeslateError> {
        let pos = self.emit_jump(op);
        self.patch_jump_to(pos, target)
    }

    fn patch_jump(&mut self, pos: usize) -> Result<(), DeslateError> {
        let target = self.here();
        self.patch_jump_to(pos, target)
    }

    fn patch_jump_to(&mut self, pos: usize, target: usize) -> Result<(), DeslateError> {
        if target > u16::MAX as usize {
            return Err(DeslateError::compile("unit exceeds the 64 KiB code limit"));
        }
        LittleEndian::write_u16(&mut self.code[pos..pos + 2], target as u16);
        Ok(())
    }

    fn const_idx(&mut self, c: Const) -> Result<u16, DeslateError> {
        if let Some(i) = self.consts.iter().position(|x| *x == c) {
            return Ok(i as u16);
        }
        if self.consts.len() > u16::MAX as usize {
            return Err(DeslateError::compile("constant pool overflow"));
        }
        self.consts.push(c);
        Ok((self.consts.len() - 1) as u16)
    }

    fn name_idx(&mut self, name: &str) -> Result<u16, DeslateError> {
        if let Some(i) = self.names.iter().position(|x| x == name) {
            return Ok(i as u16);
        }
        if self.names.len() > u16::MAX as usize {
            return Err(DeslateError::compile("name pool overflow"));
        }
        self.names.push(name.to_string());
        Ok((self.names.len() - 1) as u16)
    }

    fn var_idx(&self, name: &str) -> Result<u16, DeslateError> {
        self.varnames
            .iter()
            .position(|x| x == name)
            .map(|i| i as u16)
            .ok_or_else(|| DeslateError::compile(format!("unknown local '{name}'")))
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|l| l == name)
    }

    fn emit_load(&mut self, name: &str) -> Result<(), DeslateError> {
        if self.is_local(name) {
            let idx = self.var_idx(name)?;
            self.emit_u16(Op::LoadFast, idx);
        } else {
            let idx = self.name_idx(name)?;
            self.emit_u16(Op::LoadName, idx);
        }
        Ok(())
    }

    fn emit_store(&mut self, name: &str) -> Result<(), DeslateError> {
        if self.is_local(name) {
            let idx = self.var_idx(name)?;
            self.emit_u16(Op::StoreFast, idx);
        } else {
            let idx = self.name_idx(name)?;
            self.emit_u16(Op::StoreName, idx);
        }
        Ok(())
    }

    fn compile_expr(&mut self, e: &Expr) -> Result<(), DeslateError> {
        match e {
            Expr::Name(n) => self.emit_load(n)?,
            Expr::Literal(c) => {
                let idx = self.const_idx(c.clone())?;
                self.emit_u16(Op::LoadConst, idx);
            }
            Expr::BinOp { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_u8(Op::BinaryOp, op.code());
            }
            Expr::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.emit_u8(Op::UnaryOp, op.code());
            }
            Expr::Compare { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_u8(Op::CompareOp, op.code());
            }
            Expr::BoolOp { op, values } => {
                if values.len() < 2 {
                    return Err(DeslateError::compile("boolean chain needs two operands"));
                }
                let jump_op = match op {
                    crate::ast::BoolOpKind::And => Op::JumpIfFalseOrPop,
                    crate::ast::BoolOpKind::Or => Op::JumpIfTrueOrPop,
                };
                let mut shorts = Vec::new();
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        shorts.push(self.emit_jump(jump_op));
                    }
                    self.compile_expr(v)?;
                }
                for pos in shorts {
                    self.patch_jump(pos)?;
                }
            }
            Expr::Call { func, args } => {
                if args.len() > u8::MAX as usize {
                    return Err(DeslateError::compile("too many call arguments"));
                }
                self.compile_expr(func)?;
                for a in args {
                    self.compile_expr(a)?;
                }
                self.emit_u8(Op::Call, args.len() as u8);
            }
            Expr::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.name_idx(attr)?;
                self.emit_u16(Op::LoadAttr, idx);
            }
            Expr::Subscript { value, index } => {
                self.compile_expr(value)?;
                self.compile_expr(index)?;
                self.emit(Op::LoadSubscr);
            }
            Expr::List(items) => {
                for it in items {
                    self.compile_expr(it)?;
                }
                self.emit_u16(Op::BuildList, items.len() as u16);
            }
            Expr::Tuple(items) => {
                for it in items {
                    self.compile_expr(it)?;
                }
                self.emit_u16(Op::BuildTuple, items.len() as u16);
            }
            Expr::ListComp { elt, target, iter, ifs } => {
                self.emit_u16(Op::BuildList, 0);
                self.compile_expr(iter)?;
                self.emit(Op::GetIter);
                let head = self.here();
                let exhaust = self.emit_jump(Op::ForIter);
                self.emit_store(target)?;
                for cond in ifs {
                    self.compile_expr(cond)?;
                    self.emit_jump_to(Op::PopJumpIfFalse, head)?;
                }
                self.compile_expr(elt)?;
                self.emit_u16(Op::ListAppend, 2);
                self.emit_jump_to(Op::Jump, head)?;
                self.patch_jump(exhaust)?;
            }
        }
        Ok(())
    }

    /// Compiles a statement list; true when the list ends on a path that
    /// never falls through (return/raise/break/continue on every arm).
    fn compile_stmts(&mut self, stmts: &[Stmt]) -> Result<bool, DeslateError> {
        let mut terminated = false;
        for s in stmts {
            terminated = self.compile_stmt(s)?;
        }
        Ok(terminated)
    }

    fn compile_stmt(&mut self, s: &Stmt) -> Result<bool, DeslateError> {
        match s {
            Stmt::Expr { value, line } => {
                self.set_line(*line);
                self.compile_expr(value)?;
                self.emit(Op::PopTop);
            }
            Stmt::Assign { target, value, line } => {
                self.set_line(*line);
                match target {
                    Expr::Name(n) => {
                        self.compile_expr(value)?;
                        self.emit_store(n)?;
                    }
                    Expr::Subscript { value: obj, index } => {
                        self.compile_expr(value)?;
                        self.compile_expr(obj)?;
                        self.compile_expr(index)?;
                        self.emit(Op::StoreSubscr);
                    }
                    other => {
                        return Err(DeslateError::compile(format!(
                            "unsupported assignment target: {other}"
                        )));
                    }
                }
            }
            Stmt::Return { value, line } => {
                self.set_line(*line);
                if self.finally_depth > 0 {
                    return Err(DeslateError::compile(
                        "return out of a finally-protected region is not supported",
                    ));
                }
                match value {
                    Some(v) => {
                        self.compile_expr(v)?;
                        self.emit(Op::ReturnValue);
                    }
                    None => self.emit(Op::ReturnNone),
                }
                return Ok(true);
            }
            Stmt::Raise { exc, line } => {
                self.set_line(*line);
                match exc {
                    Some(e) => {
                        self.compile_expr(e)?;
                        self.emit_u8(Op::Raise, 1);
                    }
                    None => self.emit_u8(Op::Raise, 0),
                }
                return Ok(true);
            }
            Stmt::Break { line } => {
                self.set_line(*line);
                if self.finally_depth > 0 {
                    return Err(DeslateError::compile(
                        "break out of a finally-protected region is not supported",
                    ));
                }
                if self.loop_stack.is_empty() {
                    return Err(DeslateError::compile("break outside loop"));
                }
                let pos = self.emit_jump(Op::Jump);
                if let Some(ctx) = self.loop_stack.last_mut() {
                    ctx.break_jumps.push(pos);
                }
                return Ok(true);
            }
            Stmt::Continue { line } => {
                self.set_line(*line);
                if self.finally_depth > 0 {
                    return Err(DeslateError::compile(
                        "continue out of a finally-protected region is not supported",
                    ));
                }
                let start = match self.loop_stack.last() {
                    Some(ctx) => ctx.start,
                    None => return Err(DeslateError::compile("continue outside loop")),
                };
                self.emit_jump_to(Op::Jump, start)?;
                return Ok(true);
            }
            Stmt::If { test, body, orelse, line } => {
                self.set_line(*line);
                self.compile_expr(test)?;
                let j_else = self.emit_jump(Op::PopJumpIfFalse);
                let body_term = self.compile_stmts(body)?;
                if orelse.is_empty() {
                    self.patch_jump(j_else)?;
                    return Ok(false);
                }
                let j_end = if body_term { None } else { Some(self.emit_jump(Op::Jump)) };
                self.patch_jump(j_else)?;
                let else_term = self.compile_stmts(orelse)?;
                if let Some(pos) = j_end {
                    self.patch_jump(pos)?;
                }
                return Ok(body_term && else_term);
            }
            Stmt::While { test, body, line } => {
                self.set_line(*line);
                let start = self.here();
                // `while True` compiles with no header test at all.
                let j_exit = if matches!(test, Expr::Literal(Const::Bool(true))) {
                    None
                } else {
                    self.compile_expr(test)?;
                    Some(self.emit_jump(Op::PopJumpIfFalse))
                };
                self.loop_stack.push(LoopCtx { start, break_jumps: Vec::new() });
                self.compile_stmts(body)?;
                self.emit_jump_to(Op::Jump, start)?;
                let ctx = match self.loop_stack.pop() {
                    Some(c) => c,
                    None => return Err(DeslateError::compile("loop stack corrupted")),
                };
                if let Some(pos) = j_exit {
                    self.patch_jump(pos)?;
                }
                for pos in ctx.break_jumps {
                    self.patch_jump(pos)?;
                }
            }
            Stmt::Try { body, handlers, finalbody, line } => {
                return self.compile_try(body, handlers, finalbody, *line);
            }
            Stmt::FunctionDef(def) => {
                self.set_line(def.line);
                self.compile_def(def)?;
            }
        }
        Ok(false)
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        handlers: &[crate::ast::ExceptHandler],
        finalbody: &[Stmt],
        line: u32,
    ) -> Result<bool, DeslateError> {
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(DeslateError::compile("try needs a handler or a finally block"));
        }
        self.set_line(line);
        if !finalbody.is_empty() {
            self.finally_depth += 1;
        }

        let t_start = self.here();
        let body_term = self.compile_stmts(body)?;
        let t_end = self.here();
        let j_join = if body_term { None } else { Some(self.emit_jump(Op::Jump)) };

        let mut join_jumps: Vec<usize> = Vec::new();
        if let Some(pos) = j_join {
            join_jumps.push(pos);
        }

        if !handlers.is_empty() {
            let h_start = self.here();
            let mut saw_bare = false;
            for h in handlers {
                if saw_bare {
                    return Err(DeslateError::compile("handler after bare except"));
                }
                // Handler entry: the caught exception is on the stack.
                let j_next = match &h.typ {
                    Some(t) => {
                        self.set_line(h.line);
                        self.compile_expr(t)?;
                        self.emit(Op::CheckExcMatch);
                        Some(self.emit_jump(Op::PopJumpIfFalse))
                    }
                    None => {
                        saw_bare = true;
                        self.set_line(h.line);
                        None
                    }
                };
                match &h.name {
                    Some(n) => self.emit_store(n)?,
                    None => self.emit(Op::PopTop),
                }
                let h_term = self.compile_stmts(&h.body)?;
                if !h_term {
                    join_jumps.push(self.emit_jump(Op::Jump));
                }
                if let Some(pos) = j_next {
                    self.patch_jump(pos)?;
                }
            }
            if !saw_bare {
                self.emit(Op::Reraise);
            }
            self.exc_table.push(ExceptionEntry {
                start: t_start as u32,
                end: t_end as u32,
                handler: h_start as u32,
            });
        }

        let join = self.here();
        for pos in join_jumps {
            self.patch_jump_to(pos, join)?;
        }

        if !finalbody.is_empty() {
            self.finally_depth -= 1;
            self.compile_stmts(finalbody)?;
            let j_out = self.emit_jump(Op::Jump);
            let cleanup = self.here();
            self.compile_stmts(finalbody)?;
            self.emit(Op::Reraise);
            self.patch_jump(j_out)?;
            self.exc_table.push(ExceptionEntry {
                start: t_start as u32,
                end: join as u32,
                handler: cleanup as u32,
            });
        }
        Ok(false)
    }

    fn compile_def(&mut self, def: &FunctionDef) -> Result<(), DeslateError> {
        let unit = compile_function(def, &self.origin)?;
        if self.nested.len() >= u8::MAX as usize {
            return Err(DeslateError::compile("too many nested definitions"));
        }
        let unit_idx = self.nested.len() as u8;
        self.nested.push(unit);

        let n_defaults = def.params.iter().filter(|p| p.default.is_some()).count();
        if n_defaults > u8::MAX as usize {
            return Err(DeslateError::compile("too many parameter defaults"));
        }
        // Defaults must trail the required parameters and are evaluated in
        // declaration order at definition time.
        let first_default = def.params.len() - n_defaults;
        for (i, p) in def.params.iter().enumerate() {
            match (&p.default, i >= first_default) {
                (Some(d), true) => self.compile_expr(d)?,
                (None, false) => {}
                _ => {
                    return Err(DeslateError::compile(format!(
                        "non-default parameter '{}' follows a defaulted one",
                        p.name
                    )));
                }
            }
        }
        self.code.push(Op::MakeFunction as u8);
        self.code.push(unit_idx);
        self.code.push(n_defaults as u8);
        self.emit_store(&def.name)?;
        Ok(())
    }

    fn finish(mut self, module: bool) -> CodeUnit {
        if module {
            self.flags |= UNIT_FLAG_MODULE;
        }
        self.emit(Op::ReturnNone);
        CodeUnit {
            name: self.name,
            origin: self.origin,
            first_line: self.first_line,
            flags: self.flags,
            param_count: self.param_count,
            code: self.code,
            consts: self.consts,
            names: self.names,
            varnames: self.varnames,
            nested: self.nested,
            exc_table: self.exc_table,
            lines: self.lines,
        }
    }
}

fn collect_comp_targets(e: &Expr, out: &mut Vec<String>) {
    match e {
        Expr::Name(_) | Expr::Literal(_) => {}
        Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
            collect_comp_targets(left, out);
            collect_comp_targets(right, out);
        }
        Expr::UnaryOp { operand, .. } => collect_comp_targets(operand, out),
        Expr::BoolOp { values, .. } => {
            for v in values {
                collect_comp_targets(v, out);
            }
        }
        Expr::Call { func, args } => {
            collect_comp_targets(func, out);
            for a in args {
                collect_comp_targets(a, out);
            }
        }
        Expr::Attribute { value, .. } => collect_comp_targets(value, out),
        Expr::Subscript { value, index } => {
            collect_comp_targets(value, out);
            collect_comp_targets(index, out);
        }
        Expr::List(items) | Expr::Tuple(items) => {
            for it in items {
                collect_comp_targets(it, out);
            }
        }
        Expr::ListComp { elt, target, iter, ifs } => {
            if !out.contains(target) {
                out.push(target.clone());
            }
            collect_comp_targets(elt, out);
            collect_comp_targets(iter, out);
            for c in ifs {
                collect_comp_targets(c, out);
            }
        }
    }
}

fn scan_stmt_exprs(s: &Stmt, out: &mut Vec<String>) {
    match s {
        Stmt::Expr { value, .. } => collect_comp_targets(value, out),
        Stmt::Assign { target, value, .. } => {
            collect_comp_targets(target, out);
            collect_comp_targets(value, out);
        }
        Stmt::Return { value: Some(v), .. } => collect_comp_targets(v, out),
        Stmt::Return { value: None, .. } | Stmt::Break { .. } | Stmt::Continue { .. } => {}
        Stmt::Raise { exc, .. } => {
            if let Some(e) = exc {
                collect_comp_targets(e, out);
            }
        }
        Stmt::If { test, body, orelse, .. } => {
            collect_comp_targets(test, out);
            for s in body.iter().chain(orelse) {
                scan_stmt_exprs(s, out);
            }
        }
        Stmt::While { test, body, .. } => {
            collect_comp_targets(test, out);
            for s in body {
                scan_stmt_exprs(s, out);
            }
        }
        Stmt::Try { body, handlers, finalbody, .. } => {
            for s in body.iter().chain(finalbody) {
                scan_stmt_exprs(s, out);
            }
            for h in handlers {
                if let Some(t) = &h.typ {
                    collect_comp_targets(t, out);
                }
                for s in &h.body {
                    scan_stmt_exprs(s, out);
                }
            }
        }
        Stmt::FunctionDef(_) => {}
    }
}

/// Names bound within a function body, in first-binding order: assignment
/// targets, except-clause names, comprehension targets, nested def names.
fn assigned_names(stmts: &[Stmt], out: &mut Vec<String>) {
    let mut push = |name: &str, out: &mut Vec<String>| {
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    };
    for s in stmts {
        match s {
            Stmt::Assign { target: Expr::Name(n), .. } => push(n, out),
            Stmt::If { body, orelse, .. } => {
                assigned_names(body, out);
                assigned_names(orelse, out);
            }
            Stmt::While { body, .. } => assigned_names(body, out),
            Stmt::Try { body, handlers, finalbody, .. } => {
                assigned_names(body, out);
                for h in handlers {
                    if let Some(n) = &h.name {
                        push(n, out);
                    }
                    assigned_names(&h.body, out);
                }
                assigned_names(finalbody, out);
            }
            Stmt::FunctionDef(def) => push(&def.name, out),
            _ => {}
        }
        scan_stmt_exprs(s, out);
    }
}

pub fn compile_function(def: &FunctionDef, origin: &str) -> Result<CodeUnit, DeslateError> {
    if def.params.len() > u16::MAX as usize {
        return Err(DeslateError::compile("too many parameters"));
    }
    let mut b = CodeBuilder::new(&def.name, origin, def.line);
    b.param_count = def.params.len() as u16;

    for p in &def.params {
        if b.locals.iter().any(|l| l == &p.name) {
            return Err(DeslateError::compile(format!("duplicate parameter '{}'", p.name)));
        }
        b.locals.push(p.name.clone());
        b.varnames.push(p.name.clone());
    }
    let mut bound = Vec::new();
    assigned_names(&def.body, &mut bound);
    for n in bound {
        if !b.locals.iter().any(|l| l == &n) {
            b.locals.push(n.clone());
            b.varnames.push(n);
        }
    }

    b.compile_stmts(&def.body)?;
    Ok(b.finish(false))
}

pub fn compile_module(module: &Module, origin: &str) -> Result<CodeUnit, DeslateError> {
    let mut b = CodeBuilder::new("<module>", origin, 1);
    b.compile_stmts(&module.body)?;
    Ok(b.finish(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, BoolOpKind, CmpOp, ExceptHandler, Param, UnaryOp};
    use crate::instr::decode_instructions;
    use crate::opcode::Op;

    fn ops_of(unit: &CodeUnit) -> Vec<Op> {
        decode_instructions(unit).unwrap().into_iter().map(|i| i.op).collect()
    }

    #[test]
    fn expression_statement_compiles_and_pops() {
        let m = Module {
            body: vec![Stmt::Expr {
                value: Expr::call(Expr::name("f"), vec![Expr::int(1)]),
                line: 1,
            }],
        };
        let unit = compile_module(&m, "<test>").unwrap();
        assert_eq!(
            ops_of(&unit),
            vec![Op::LoadName, Op::LoadConst, Op::Call, Op::PopTop, Op::ReturnNone]
        );
        assert!(unit.is_module());
    }

    #[test]
    fn function_locals_are_fast_slots() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![Param { name: "x".into(), default: None }],
            body: vec![
                Stmt::Assign {
                    target: Expr::name("y"),
                    value: Expr::BinOp {
                        op: BinOp::Add,
                        left: Box::new(Expr::name("x")),
                        right: Box::new(Expr::int(1)),
                    },
                    line: 2,
                },
                Stmt::Return { value: Some(Expr::name("y")), line: 3 },
            ],
            line: 1,
        };
        let unit = compile_function(&def, "<test>").unwrap();
        assert_eq!(unit.param_count, 1);
        assert_eq!(unit.varnames, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(
            ops_of(&unit),
            vec![
                Op::LoadFast,
                Op::LoadConst,
                Op::BinaryOp,
                Op::StoreFast,
                Op::LoadFast,
                Op::ReturnValue,
                Op::ReturnNone,
            ]
        );
    }

    #[test]
    fn if_else_reconverges_on_a_join() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![Param { name: "x".into(), default: None }],
            body: vec![
                Stmt::If {
                    test: Expr::Compare {
                        op: CmpOp::Gt,
                        left: Box::new(Expr::name("x")),
                        right: Box::new(Expr::int(0)),
                    },
                    body: vec![Stmt::Assign {
                        target: Expr::name("y"),
                        value: Expr::int(1),
                        line: 3,
                    }],
                    orelse: vec![Stmt::Assign {
                        target: Expr::name("y"),
                        value: Expr::int(2),
                        line: 5,
                    }],
                    line: 2,
                },
                Stmt::Return { value: Some(Expr::name("y")), line: 6 },
            ],
            line: 1,
        };
        let unit = compile_function(&def, "<test>").unwrap();
        let instrs = decode_instructions(&unit).unwrap();
        // The else jump lands after the then arm's jump to the join.
        let pjif = instrs.iter().find(|i| i.op == Op::PopJumpIfFalse).unwrap();
        let jump = instrs.iter().find(|i| i.op == Op::Jump).unwrap();
        let else_target = crate::instr::label_target(pjif).unwrap();
        let join = crate::instr::label_target(jump).unwrap();
        assert!(else_target > jump.offset);
        assert!(join > else_target);
    }

    #[test]
    fn while_true_has_no_header_test() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![],
            body: vec![Stmt::While {
                test: Expr::Literal(Const::Bool(true)),
                body: vec![Stmt::Break { line: 3 }],
                line: 2,
            }],
            line: 1,
        };
        let unit = compile_function(&def, "<test>").unwrap();
        let ops = ops_of(&unit);
        assert!(!ops.contains(&Op::PopJumpIfFalse));
        assert_eq!(ops.iter().filter(|o| **o == Op::Jump).count(), 2);
    }

    #[test]
    fn bool_chain_shares_one_join() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![
                Param { name: "a".into(), default: None },
                Param { name: "b".into(), default: None },
                Param { name: "c".into(), default: None },
            ],
            body: vec![Stmt::Return {
                value: Some(Expr::BoolOp {
                    op: BoolOpKind::And,
                    values: vec![Expr::name("a"), Expr::name("b"), Expr::name("c")],
                }),
                line: 2,
            }],
            line: 1,
        };
        let unit = compile_function(&def, "<test>").unwrap();
        let instrs = decode_instructions(&unit).unwrap();
        let joins: Vec<usize> = instrs
            .iter()
            .filter(|i| i.op == Op::JumpIfFalseOrPop)
            .map(|i| crate::instr::label_target(i).unwrap())
            .collect();
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[0], joins[1]);
    }

    #[test]
    fn try_except_records_a_protected_region() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![],
            body: vec![Stmt::Try {
                body: vec![Stmt::Expr {
                    value: Expr::call(Expr::name("g"), vec![]),
                    line: 3,
                }],
                handlers: vec![ExceptHandler {
                    typ: Some(Expr::name("ValueError")),
                    name: Some("e".into()),
                    body: vec![Stmt::Return { value: Some(Expr::name("e")), line: 5 }],
                    line: 4,
                }],
                finalbody: vec![],
                line: 2,
            }],
            line: 1,
        };
        let unit = compile_function(&def, "<test>").unwrap();
        assert_eq!(unit.exc_table.len(), 1);
        let e = unit.exc_table[0];
        assert!(e.start < e.end);
        assert!(e.handler > e.end);
        // A typed chain with no bare handler falls back to reraise.
        assert!(ops_of(&unit).contains(&Op::Reraise));
    }

    #[test]
    fn return_under_finally_is_rejected() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![],
            body: vec![Stmt::Try {
                body: vec![Stmt::Return { value: Some(Expr::int(1)), line: 3 }],
                handlers: vec![],
                finalbody: vec![Stmt::Expr {
                    value: Expr::call(Expr::name("g"), vec![]),
                    line: 5,
                }],
                line: 2,
            }],
            line: 1,
        };
        match compile_function(&def, "<test>") {
            Err(DeslateError::Compile { reason }) => {
                assert!(reason.contains("finally"), "{reason}");
            }
            other => panic!("expected Compile error, got {:?}", other),
        }
    }

    #[test]
    fn defaults_must_trail_required_params() {
        let inner = FunctionDef {
            name: "g".into(),
            params: vec![
                Param { name: "a".into(), default: Some(Expr::int(1)) },
                Param { name: "b".into(), default: None },
            ],
            body: vec![Stmt::Return { value: Some(Expr::name("a")), line: 3 }],
            line: 2,
        };
        let m = Module { body: vec![Stmt::FunctionDef(inner)] };
        assert!(matches!(
            compile_module(&m, "<test>"),
            Err(DeslateError::Compile { .. })
        ));
    }

    #[test]
    fn nested_def_evaluates_defaults_then_makes_function() {
        let inner = FunctionDef {
            name: "g".into(),
            params: vec![
                Param { name: "a".into(), default: None },
                Param { name: "b".into(), default: Some(Expr::int(10)) },
            ],
            body: vec![Stmt::Return {
                value: Some(Expr::BinOp {
                    op: BinOp::Add,
                    left: Box::new(Expr::name("a")),
                    right: Box::new(Expr::name("b")),
                }),
                line: 3,
            }],
            line: 2,
        };
        let m = Module { body: vec![Stmt::FunctionDef(inner)] };
        let unit = compile_module(&m, "<test>").unwrap();
        assert_eq!(unit.nested.len(), 1);
        assert_eq!(unit.nested[0].param_count, 2);
        assert_eq!(
            ops_of(&unit),
            vec![Op::LoadConst, Op::MakeFunction, Op::StoreName, Op::ReturnNone]
        );
    }

    #[test]
    fn comprehension_loops_back_to_its_iterator() {
        let def = FunctionDef {
            name: "f".into(),
            params: vec![Param { name: "xs".into(), default: None }],
            body: vec![Stmt::Return {
                value: Some(Expr::ListComp {
                    elt: Box::new(Expr::BinOp {
                        op: BinOp::Mul,
                        left: Box::new(Expr::name("i")),
                        right: Box::new(Expr::int(2)),
                    }),
                    target: "i".into(),
                    iter: Box::new(Expr::name("xs")),
                    ifs: vec![Expr::Compare {
                        op: CmpOp::Gt,
                        left: Box::new(Expr::name("i")),
                        right: Box::new(Expr::int(0)),
                    }],
                }),
                line: 2,
            }],
            line: 1,
        };
        let unit = compile_function(&def, "<test>").unwrap();
        assert!(unit.varnames.contains(&"i".to_string()));
        let instrs = decode_instructions(&unit).unwrap();
        let head = instrs.iter().find(|i| i.op == Op::ForIter).unwrap().offset;
        let back_jumps = instrs
            .iter()
            .filter(|i| {
                matches!(i.op, Op::Jump | Op::PopJumpIfFalse)
                    && crate::instr::label_target(i) == Some(head)
            })
            .count();
        // One filter jump and the trailing loop jump both land on for_iter.
        assert_eq!(back_jumps, 2);
    }

    #[test]
    fn negation_compiles_to_unary_op() {
        let m = Module {
            body: vec![Stmt::Assign {
                target: Expr::name("x"),
                value: Expr::UnaryOp { op: UnaryOp::Neg, operand: Box::new(Expr::int(5)) },
                line: 1,
            }],
        };
        let unit = compile_module(&m, "<test>").unwrap();
        assert_eq!(
            ops_of(&unit),
            vec![Op::LoadConst, Op::UnaryOp, Op::StoreName, Op::ReturnNone]
        );
    }
}
