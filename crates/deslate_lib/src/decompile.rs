use std::collections::{HashMap, HashSet};

use crate::ast::{
    BinOp, BoolOpKind, CmpOp, ExceptHandler, Expr, FunctionDef, Module, Param, Stmt, UnaryOp,
    strip_lines,
};
use crate::cfg::{BasicBlock, build_cfg};
use crate::error::DeslateError;
use crate::instr::{Instr, Operand, decode_instructions, label_target};
use crate::opcode::Op;
use crate::unit::{CodeUnit, Const};

/// Reconstructs source statements from a decoded unit by walking the code in
/// offset order with an abstract expression stack. Each surface construct is
/// recognized from the fixed shape its compilation leaves behind; anything
/// that matches no shape is a hard `UnsupportedConstruct`, never a guess.
struct Decompiler<'a> {
    unit: &'a CodeUnit,
    instrs: Vec<Instr>,
    by_offset: HashMap<usize, usize>,
    blocks: Vec<BasicBlock>,
    consumed: HashSet<usize>,
}

#[derive(Clone, Copy, Default)]
struct Ctx {
    loop_header: Option<usize>,
    loop_exit: Option<usize>,
    epilogue: Option<usize>,
}

struct Region {
    stmts: Vec<Stmt>,
    /// Target of a trailing jump that leaves the region, if any.
    exit: Option<usize>,
    /// Expression stack left over at the region's end.
    residual: Vec<Expr>,
}

struct Latch {
    off: usize,
    end: usize,
    op: Op,
}

enum HandlerKind {
    Except,
    Finally,
}

fn unsupported(start: usize, end: usize) -> DeslateError {
    DeslateError::UnsupportedConstruct { start, end }
}

fn not_of(e: Expr) -> Expr {
    match e {
        Expr::UnaryOp { op: UnaryOp::Not, operand } => *operand,
        other => Expr::UnaryOp { op: UnaryOp::Not, operand: Box::new(other) },
    }
}

impl<'a> Decompiler<'a> {
    fn new(unit: &'a CodeUnit) -> Result<Self, DeslateError> {
        let instrs = decode_instructions(unit)?;
        let blocks = build_cfg(&instrs, &unit.exc_table)?;
        let by_offset = instrs.iter().enumerate().map(|(i, ins)| (ins.offset, i)).collect();
        Ok(Self { unit, instrs, by_offset, blocks, consumed: HashSet::new() })
    }

    fn instr_at(&self, off: usize) -> Result<&Instr, DeslateError> {
        self.by_offset
            .get(&off)
            .map(|&i| &self.instrs[i])
            .ok_or_else(|| unsupported(off, off + 1))
    }

    fn pop(stack: &mut Vec<Expr>, off: usize) -> Result<Expr, DeslateError> {
        stack.pop().ok_or(DeslateError::StackUnderflow { offset: off })
    }

    fn popn(stack: &mut Vec<Expr>, n: usize, off: usize) -> Result<Vec<Expr>, DeslateError> {
        if stack.len() < n {
            return Err(DeslateError::StackUnderflow { offset: off });
        }
        Ok(stack.split_off(stack.len() - n))
    }

    /// The exception-table entry opening exactly at `pos`, when one lies
    /// wholly inside the current region. Wrapping entries (larger end)
    /// take precedence over the entries they enclose.
    fn open_entry(&self, pos: usize, hi: usize) -> Option<usize> {
        self.unit
            .exc_table
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                !self.consumed.contains(i) && e.start as usize == pos && e.end as usize <= hi
            })
            .max_by_key(|(_, e)| e.end)
            .map(|(i, _)| i)
    }

    /// The last branch inside the region that jumps back to `h`. Blocks
    /// ending at the region boundary itself are the enclosing walk's latch,
    /// not ours, so they are excluded by the `end <= hi` bound.
    fn back_edge_latch(&self, h: usize, hi: usize) -> Option<Latch> {
        self.blocks
            .iter()
            .filter(|b| b.start >= h && b.end <= hi)
            .filter_map(|b| {
                let last = b.instrs.last()?;
                if !matches!(last.op, Op::Jump | Op::PopJumpIfFalse | Op::PopJumpIfTrue) {
                    return None;
                }
                if label_target(last) != Some(h) {
                    return None;
                }
                Some(Latch { off: last.offset, end: last.end_offset(), op: last.op })
            })
            .max_by_key(|l| l.off)
    }

    /// One pure-expression step. Anything that cannot run on the abstract
    /// stack alone is left for the caller to dispatch.
    fn sim_step(&self, ins: &Instr, stack: &mut Vec<Expr>) -> Result<(), DeslateError> {
        let off = ins.offset;
        match ins.op {
            Op::Nop => {}
            Op::LoadConst => {
                let c = self.unit.const_at(ins.u16_operand() as u32)?;
                stack.push(Expr::Literal(c.clone()));
            }
            Op::LoadName => {
                let n = self.unit.name_at(ins.u16_operand() as u32)?;
                stack.push(Expr::Name(n.to_string()));
            }
            Op::LoadFast => {
                let n = self.unit.varname_at(ins.u16_operand() as u32)?;
                stack.push(Expr::Name(n.to_string()));
            }
            Op::LoadAttr => {
                let attr = self.unit.name_at(ins.u16_operand() as u32)?.to_string();
                let value = Self::pop(stack, off)?;
                stack.push(Expr::Attribute { value: Box::new(value), attr });
            }
            Op::LoadSubscr => {
                let index = Self::pop(stack, off)?;
                let value = Self::pop(stack, off)?;
                stack.push(Expr::Subscript { value: Box::new(value), index: Box::new(index) });
            }
            Op::BinaryOp => {
                let op = BinOp::from_code(ins.u8_operand())
                    .ok_or_else(|| unsupported(off, ins.end_offset()))?;
                let right = Self::pop(stack, off)?;
                let left = Self::pop(stack, off)?;
                stack.push(Expr::BinOp { op, left: Box::new(left), right: Box::new(right) });
            }
            Op::UnaryOp => {
                let op = UnaryOp::from_code(ins.u8_operand())
                    .ok_or_else(|| unsupported(off, ins.end_offset()))?;
                let operand = Self::pop(stack, off)?;
                stack.push(Expr::UnaryOp { op, operand: Box::new(operand) });
            }
            Op::CompareOp => {
                let op = CmpOp::from_code(ins.u8_operand())
                    .ok_or_else(|| unsupported(off, ins.end_offset()))?;
                let right = Self::pop(stack, off)?;
                let left = Self::pop(stack, off)?;
                stack.push(Expr::Compare { op, left: Box::new(left), right: Box::new(right) });
            }
            Op::Call => {
                let args = Self::popn(stack, ins.u8_operand() as usize, off)?;
                let func = Self::pop(stack, off)?;
                stack.push(Expr::Call { func: Box::new(func), args });
            }
            Op::BuildList => {
                let items = Self::popn(stack, ins.u16_operand() as usize, off)?;
                stack.push(Expr::List(items));
            }
            Op::BuildTuple => {
                let items = Self::popn(stack, ins.u16_operand() as usize, off)?;
                stack.push(Expr::Tuple(items));
            }
            Op::GetIter => {
                let it = Self::pop(stack, off)?;
                stack.push(it);
            }
            Op::DupTop => {
                let top = Self::pop(stack, off)?;
                stack.push(top.clone());
                stack.push(top);
            }
            Op::RotTwo => {
                let a = Self::pop(stack, off)?;
                let b = Self::pop(stack, off)?;
                stack.push(a);
                stack.push(b);
            }
            _ => return Err(unsupported(off, ins.end_offset())),
        }
        Ok(())
    }

    fn is_pure(op: Op) -> bool {
        matches!(
            op,
            Op::Nop
                | Op::LoadConst
                | Op::LoadName
                | Op::LoadFast
                | Op::LoadAttr
                | Op::LoadSubscr
                | Op::BinaryOp
                | Op::UnaryOp
                | Op::CompareOp
                | Op::Call
                | Op::BuildList
                | Op::BuildTuple
                | Op::GetIter
                | Op::DupTop
                | Op::RotTwo
        )
    }

    /// Simulates pure instructions forward from `*pos` until `limit` or the
    /// first impure instruction, which is returned unconsumed.
    fn sim_pure(
        &self,
        pos: &mut usize,
        limit: usize,
        stack: &mut Vec<Expr>,
    ) -> Result<Option<Instr>, DeslateError> {
        loop {
            if *pos == limit {
                return Ok(None);
            }
            if *pos > limit {
                return Err(unsupported(limit, *pos));
            }
            let ins = self.instr_at(*pos)?.clone();
            if Self::is_pure(ins.op) {
                self.sim_step(&ins, stack)?;
                *pos = ins.end_offset();
            } else {
                return Ok(Some(ins));
            }
        }
    }

    // Pattern: v0; <or_pop join>; v1; <or_pop join>; ... vN; join.
    // Each operand region is purely expression-producing; same-kind links to
    // the shared join fold flat, anything else folds as a nested expression.
    fn fold_bool(&mut self, ins: &Instr, stack: &mut Vec<Expr>) -> Result<usize, DeslateError> {
        let o = ins.offset;
        let join = label_target(ins).ok_or_else(|| unsupported(o, ins.end_offset()))?;
        if join <= o {
            return Err(unsupported(join, o));
        }
        let kind = match ins.op {
            Op::JumpIfFalseOrPop => BoolOpKind::And,
            Op::JumpIfTrueOrPop => BoolOpKind::Or,
            _ => return Err(unsupported(o, ins.end_offset())),
        };
        let mut values = vec![Self::pop(stack, o)?];
        let mut pos = ins.end_offset();
        'operands: loop {
            let mut sub: Vec<Expr> = Vec::new();
            loop {
                match self.sim_pure(&mut pos, join, &mut sub)? {
                    None => {
                        if sub.len() != 1 {
                            return Err(unsupported(o, join));
                        }
                        values.push(sub.remove(0));
                        break 'operands;
                    }
                    Some(stop) => {
                        let same_kind = matches!(
                            (stop.op, kind),
                            (Op::JumpIfFalseOrPop, BoolOpKind::And)
                                | (Op::JumpIfTrueOrPop, BoolOpKind::Or)
                        );
                        if same_kind && label_target(&stop) == Some(join) {
                            if sub.len() != 1 {
                                return Err(unsupported(o, join));
                            }
                            values.push(sub.remove(0));
                            pos = stop.end_offset();
                            continue 'operands;
                        }
                        match stop.op {
                            Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop => {
                                pos = self.fold_bool(&stop, &mut sub)?;
                            }
                            Op::ForIter => {
                                pos = self.fold_comp(&stop, &mut sub)?;
                            }
                            _ => return Err(unsupported(o, join)),
                        }
                    }
                }
            }
        }
        stack.push(Expr::BoolOp { op: kind, values });
        Ok(join)
    }

    // Pattern: build_list 0; <iterable>; get_iter; C: for_iter X;
    // store <target>; (<filter>; pop_jump_if_false C)*; <element>;
    // list_append 2; jump C; X.
    fn fold_comp(&mut self, ins: &Instr, stack: &mut Vec<Expr>) -> Result<usize, DeslateError> {
        let head = ins.offset;
        let exhaust = label_target(ins).ok_or_else(|| unsupported(head, ins.end_offset()))?;
        let iter = Self::pop(stack, head)?;
        let seed = Self::pop(stack, head)?;
        if !matches!(&seed, Expr::List(items) if items.is_empty()) {
            return Err(unsupported(head, exhaust));
        }

        let bind = self.instr_at(ins.end_offset())?.clone();
        let target = match (bind.op, bind.operand) {
            (Op::StoreFast, Some(Operand::U16(idx))) => {
                self.unit.varname_at(idx as u32)?.to_string()
            }
            (Op::StoreName, Some(Operand::U16(idx))) => self.unit.name_at(idx as u32)?.to_string(),
            _ => return Err(unsupported(head, exhaust)),
        };

        let mut pos = bind.end_offset();
        let mut ifs = Vec::new();
        let elt = self.comp_elt(&mut pos, head, exhaust, &mut ifs)?;

        let back = self.instr_at(pos)?.clone();
        if back.op != Op::Jump
            || label_target(&back) != Some(head)
            || back.end_offset() != exhaust
        {
            return Err(unsupported(head, exhaust));
        }
        stack.push(Expr::ListComp { elt: Box::new(elt), target, iter: Box::new(iter), ifs });
        Ok(exhaust)
    }

    /// Scans the per-round body of a comprehension: zero or more filters
    /// jumping back to `head`, then the element feeding list_append.
    fn comp_elt(
        &mut self,
        pos: &mut usize,
        head: usize,
        exhaust: usize,
        ifs: &mut Vec<Expr>,
    ) -> Result<Expr, DeslateError> {
        let mut sub: Vec<Expr> = Vec::new();
        loop {
            match self.sim_pure(pos, exhaust, &mut sub)? {
                Some(stop) if stop.op == Op::PopJumpIfFalse && label_target(&stop) == Some(head) => {
                    if sub.len() != 1 {
                        return Err(unsupported(head, exhaust));
                    }
                    ifs.push(sub.remove(0));
                    *pos = stop.end_offset();
                }
                Some(stop) if stop.op == Op::ListAppend => {
                    if sub.len() != 1 || stop.u16_operand() != 2 {
                        return Err(unsupported(head, exhaust));
                    }
                    *pos = stop.end_offset();
                    return Ok(sub.remove(0));
                }
                Some(stop) if matches!(stop.op, Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop) => {
                    *pos = self.fold_bool(&stop, &mut sub)?;
                }
                Some(stop) if stop.op == Op::ForIter => {
                    *pos = self.fold_comp(&stop, &mut sub)?;
                }
                _ => return Err(unsupported(head, exhaust)),
            }
        }
    }

    // Pattern: <test>; pop_jump_if_false E; <then>; [jump J; E: <else>; J:].
    // A then-arm that never falls through simply has no jump, and the else
    // code is whatever follows.
    fn fold_if(
        &mut self,
        stmts: &mut Vec<Stmt>,
        stack: &mut Vec<Expr>,
        ins: &Instr,
        hi: usize,
        ctx: Ctx,
    ) -> Result<usize, DeslateError> {
        let o = ins.offset;
        let t = label_target(ins).ok_or_else(|| unsupported(o, ins.end_offset()))?;
        let test = Self::pop(stack, o)?;
        if !stack.is_empty() {
            return Err(unsupported(o, t.max(o)));
        }
        let line = ins.line;

        // Pattern: a conditional branch straight to the loop header or exit
        // is a guarded continue/break.
        let jumps_on_true = ins.op == Op::PopJumpIfTrue;
        if Some(t) == ctx.loop_exit {
            let guard = if jumps_on_true { test } else { not_of(test) };
            stmts.push(Stmt::If {
                test: guard,
                body: vec![Stmt::Break { line }],
                orelse: Vec::new(),
                line,
            });
            return Ok(ins.end_offset());
        }
        if Some(t) == ctx.loop_header {
            let guard = if jumps_on_true { test } else { not_of(test) };
            stmts.push(Stmt::If {
                test: guard,
                body: vec![Stmt::Continue { line }],
                orelse: Vec::new(),
                line,
            });
            return Ok(ins.end_offset());
        }

        let test = if jumps_on_true { not_of(test) } else { test };
        let then_lo = ins.end_offset();
        if t < then_lo || t > hi {
            return Err(unsupported(o.min(t), o.max(t)));
        }
        let then = self.walk(then_lo, t, ctx)?;
        if !then.residual.is_empty() {
            return Err(unsupported(then_lo, t));
        }
        match then.exit {
            Some(join) => {
                if join < t || join > hi {
                    return Err(unsupported(o, join.max(o)));
                }
                let els = self.walk(t, join, ctx)?;
                if !els.residual.is_empty() || els.exit.is_some_and(|e| e != join) {
                    return Err(unsupported(t, join));
                }
                stmts.push(Stmt::If { test, body: then.stmts, orelse: els.stmts, line });
                Ok(join)
            }
            None => {
                stmts.push(Stmt::If { test, body: then.stmts, orelse: Vec::new(), line });
                Ok(t)
            }
        }
    }

    /// Probes whether the loop region opening at `h` begins with a header
    /// test exiting to `exit`. Failure means the loop has no header test.
    fn loop_header_cond(&mut self, h: usize, latch_off: usize, exit: usize) -> Option<(Expr, usize)> {
        let mut stack: Vec<Expr> = Vec::new();
        let mut pos = h;
        loop {
            let stop = match self.sim_pure(&mut pos, latch_off, &mut stack) {
                Ok(Some(i)) => i,
                _ => return None,
            };
            match stop.op {
                Op::PopJumpIfFalse | Op::PopJumpIfTrue
                    if label_target(&stop) == Some(exit) && stack.len() == 1 =>
                {
                    let cond = stack.pop()?;
                    let cond =
                        if stop.op == Op::PopJumpIfTrue { not_of(cond) } else { cond };
                    return Some((cond, stop.end_offset()));
                }
                Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop => {
                    pos = self.fold_bool(&stop, &mut stack).ok()?;
                }
                Op::ForIter => {
                    pos = self.fold_comp(&stop, &mut stack).ok()?;
                }
                _ => return None,
            }
        }
    }

    // Pattern (pretest):  H: <cond>; pop_jump_if_false X; <body>; jump H; X.
    // Pattern (posttest): H: <body>; <cond>; pop_jump_if_true H; X.
    // Pattern (infinite): H: <body>; jump H; X.
    fn fold_loop(
        &mut self,
        stmts: &mut Vec<Stmt>,
        h: usize,
        latch: Latch,
        ctx: Ctx,
    ) -> Result<usize, DeslateError> {
        let line = self.instr_at(h)?.line;
        let inner = Ctx {
            loop_header: Some(h),
            loop_exit: Some(latch.end),
            epilogue: ctx.epilogue,
        };

        if matches!(latch.op, Op::PopJumpIfFalse | Op::PopJumpIfTrue) {
            // Posttest: the body and the exit test share the region; the
            // test's value is whatever the walk leaves on the stack.
            let mut r = self.walk(h, latch.off, inner)?;
            if r.exit.is_some() || r.residual.len() != 1 {
                return Err(unsupported(h, latch.end));
            }
            let cond = r.residual.remove(0);
            let guard = if latch.op == Op::PopJumpIfTrue { not_of(cond) } else { cond };
            let latch_line = self.instr_at(latch.off)?.line;
            let mut body = r.stmts;
            body.push(Stmt::If {
                test: guard,
                body: vec![Stmt::Break { line: latch_line }],
                orelse: Vec::new(),
                line: latch_line,
            });
            stmts.push(Stmt::While { test: Expr::Literal(Const::Bool(true)), body, line });
            return Ok(latch.end);
        }

        if let Some((cond, body_lo)) = self.loop_header_cond(h, latch.off, latch.end) {
            let body = self.walk(body_lo, latch.off, inner)?;
            if body.exit.is_some() || !body.residual.is_empty() {
                return Err(unsupported(body_lo, latch.off));
            }
            stmts.push(Stmt::While { test: cond, body: body.stmts, line });
        } else {
            let body = self.walk(h, latch.off, inner)?;
            if body.exit.is_some() || !body.residual.is_empty() {
                return Err(unsupported(h, latch.off));
            }
            stmts.push(Stmt::While {
                test: Expr::Literal(Const::Bool(true)),
                body: body.stmts,
                line,
            });
        }
        Ok(latch.end)
    }

    /// Decides whether handler code is an except chain or a finally cleanup
    /// copy. A chain consumes the pushed exception right away (bind or
    /// discard) or runs a load-only prefix into check_exc_match; cleanup
    /// code leaves the exception parked on the stack.
    fn handler_kind(&self, h: usize) -> HandlerKind {
        let Ok(first) = self.instr_at(h) else { return HandlerKind::Finally };
        if matches!(first.op, Op::PopTop | Op::StoreFast | Op::StoreName) {
            return HandlerKind::Except;
        }
        let mut pos = h;
        for _ in 0..16 {
            let Ok(ins) = self.instr_at(pos) else { return HandlerKind::Finally };
            match ins.op {
                Op::CheckExcMatch => return HandlerKind::Except,
                _ if Self::is_pure(ins.op) => pos = ins.end_offset(),
                _ => return HandlerKind::Finally,
            }
        }
        HandlerKind::Finally
    }

    // Pattern: T: <body>; jump J; H: (<type>; check_exc_match;
    // pop_jump_if_false next; <bind|pop_top>; <handler>; jump J;)* reraise;
    // J. A bare handler ends the chain in place of the reraise.
    fn fold_except(
        &mut self,
        stmts: &mut Vec<Stmt>,
        eidx: usize,
        hi: usize,
        ctx: Ctx,
    ) -> Result<usize, DeslateError> {
        let e = self.unit.exc_table[eidx];
        let (t_start, t_end, h_start) = (e.start as usize, e.end as usize, e.handler as usize);
        let line = self.instr_at(t_start)?.line;

        let body = self.walk(t_start, t_end, ctx)?;
        if body.exit.is_some() || !body.residual.is_empty() {
            return Err(unsupported(t_start, t_end));
        }

        let mut joins: Vec<usize> = Vec::new();
        if t_end < h_start {
            let j = self.instr_at(t_end)?.clone();
            if j.op != Op::Jump {
                return Err(unsupported(t_start, h_start));
            }
            if let Some(t) = label_target(&j) {
                joins.push(t);
            }
        }

        let mut handlers: Vec<ExceptHandler> = Vec::new();
        let mut bare: Option<(Option<String>, usize, u32)> = None;
        let mut pos = h_start;
        let chain_end = loop {
            if pos >= hi {
                return Err(unsupported(h_start, hi));
            }
            let ins = self.instr_at(pos)?.clone();
            if ins.op == Op::Reraise {
                break ins.end_offset();
            }
            match ins.op {
                // Bare handler: binds or discards the exception directly.
                Op::PopTop | Op::StoreFast | Op::StoreName => {
                    let name = match (ins.op, ins.operand) {
                        (Op::StoreFast, Some(Operand::U16(i))) => {
                            Some(self.unit.varname_at(i as u32)?.to_string())
                        }
                        (Op::StoreName, Some(Operand::U16(i))) => {
                            Some(self.unit.name_at(i as u32)?.to_string())
                        }
                        _ => None,
                    };
                    bare = Some((name, ins.end_offset(), ins.line));
                    break ins.end_offset();
                }
                _ => {
                    // Typed handler: load-only type expression into the match.
                    let mut tstack: Vec<Expr> = Vec::new();
                    let mut p = pos;
                    let stop = self
                        .sim_pure(&mut p, hi, &mut tstack)?
                        .ok_or_else(|| unsupported(pos, hi))?;
                    if stop.op != Op::CheckExcMatch || tstack.len() != 1 {
                        return Err(unsupported(pos, stop.end_offset()));
                    }
                    let typ = tstack.remove(0);
                    let pjif = self.instr_at(stop.end_offset())?.clone();
                    if pjif.op != Op::PopJumpIfFalse {
                        return Err(unsupported(pos, pjif.end_offset()));
                    }
                    let next = label_target(&pjif).ok_or_else(|| unsupported(pos, hi))?;
                    let bind = self.instr_at(pjif.end_offset())?.clone();
                    let name = match (bind.op, bind.operand) {
                        (Op::StoreFast, Some(Operand::U16(i))) => {
                            Some(self.unit.varname_at(i as u32)?.to_string())
                        }
                        (Op::StoreName, Some(Operand::U16(i))) => {
                            Some(self.unit.name_at(i as u32)?.to_string())
                        }
                        (Op::PopTop, _) => None,
                        _ => return Err(unsupported(pos, bind.end_offset())),
                    };
                    let hbody = self.walk(bind.end_offset(), next, ctx)?;
                    if !hbody.residual.is_empty() {
                        return Err(unsupported(bind.end_offset(), next));
                    }
                    if let Some(j) = hbody.exit {
                        joins.push(j);
                    }
                    handlers.push(ExceptHandler {
                        typ: Some(typ),
                        name,
                        body: hbody.stmts,
                        line: ins.line,
                    });
                    pos = next;
                }
            }
        };

        if joins.windows(2).any(|w| w[0] != w[1]) {
            return Err(unsupported(t_start, hi));
        }
        let join = joins.first().copied();
        if join.is_some_and(|j| j > hi) {
            return Err(unsupported(t_start, hi));
        }

        let bare_is_some = bare.is_some();
        if let Some((name, body_lo, h_line)) = bare {
            let body_hi = join.unwrap_or(hi);
            let hbody = self.walk(body_lo, body_hi, ctx)?;
            if !hbody.residual.is_empty() || hbody.exit.is_some_and(|x| Some(x) != join) {
                return Err(unsupported(body_lo, body_hi));
            }
            handlers.push(ExceptHandler { typ: None, name, body: hbody.stmts, line: h_line });
        } else if handlers.is_empty() {
            return Err(unsupported(t_start, chain_end));
        }

        stmts.push(Stmt::Try {
            body: body.stmts,
            handlers,
            finalbody: Vec::new(),
            line,
        });
        Ok(join.unwrap_or(if bare_is_some { hi } else { chain_end }))
    }

    // Pattern: T: <body+chain>; J: <final>; jump OUT; C: <final copy>;
    // reraise; OUT. The two copies must match statement for statement, and
    // a lone inner try/except merges into one statement.
    fn fold_finally(
        &mut self,
        stmts: &mut Vec<Stmt>,
        eidx: usize,
        hi: usize,
        ctx: Ctx,
    ) -> Result<usize, DeslateError> {
        let e = self.unit.exc_table[eidx];
        let (t_start, join, cleanup) = (e.start as usize, e.end as usize, e.handler as usize);
        let line = self.instr_at(t_start)?.line;

        let body = self.walk(t_start, join, ctx)?;
        if !body.residual.is_empty() || body.exit.is_some_and(|x| x != join) {
            return Err(unsupported(t_start, join));
        }

        let jpos = cleanup.checked_sub(3).ok_or_else(|| unsupported(t_start, cleanup))?;
        let jout = self.instr_at(jpos)?.clone();
        if jout.op != Op::Jump {
            return Err(unsupported(join, cleanup));
        }
        let out = label_target(&jout).ok_or_else(|| unsupported(join, cleanup))?;
        if out <= cleanup || out > hi {
            return Err(unsupported(join, out.max(join)));
        }
        let reraise_at = out - 1;
        if self.instr_at(reraise_at)?.op != Op::Reraise {
            return Err(unsupported(cleanup, out));
        }

        let normal = self.walk(join, jpos, ctx)?;
        if normal.exit.is_some() || !normal.residual.is_empty() {
            return Err(unsupported(join, jpos));
        }
        let copy = self.walk(cleanup, reraise_at, ctx)?;
        if copy.exit.is_some() || !copy.residual.is_empty() {
            return Err(unsupported(cleanup, reraise_at));
        }
        if strip_lines(&normal.stmts) != strip_lines(&copy.stmts) {
            return Err(unsupported(t_start, out));
        }

        // try/except/finally arrives as a finally wrapping a single inner
        // try/except; fold the two back into one statement.
        let folded = match body.stmts.as_slice() {
            [Stmt::Try { body: ib, handlers, finalbody, line: il }] if finalbody.is_empty() => {
                Stmt::Try {
                    body: ib.clone(),
                    handlers: handlers.clone(),
                    finalbody: normal.stmts,
                    line: *il,
                }
            }
            _ => Stmt::Try {
                body: body.stmts,
                handlers: Vec::new(),
                finalbody: normal.stmts,
                line,
            },
        };
        stmts.push(folded);
        Ok(out)
    }

    fn fold_try(
        &mut self,
        stmts: &mut Vec<Stmt>,
        eidx: usize,
        hi: usize,
        ctx: Ctx,
    ) -> Result<usize, DeslateError> {
        self.consumed.insert(eidx);
        let handler = self.unit.exc_table[eidx].handler as usize;
        match self.handler_kind(handler) {
            HandlerKind::Except => self.fold_except(stmts, eidx, hi, ctx),
            HandlerKind::Finally => self.fold_finally(stmts, eidx, hi, ctx),
        }
    }

    // Pattern: <defaults>; make_function u, n; store <name>.
    fn fold_def(
        &mut self,
        stmts: &mut Vec<Stmt>,
        stack: &mut Vec<Expr>,
        ins: &Instr,
    ) -> Result<usize, DeslateError> {
        let off = ins.offset;
        let (ui, nd) = match ins.operand {
            Some(Operand::FuncPair { unit, n_defaults }) => (unit as usize, n_defaults as usize),
            _ => return Err(unsupported(off, ins.end_offset())),
        };
        let defaults = Self::popn(stack, nd, off)?;
        if !stack.is_empty() {
            return Err(unsupported(off, ins.end_offset()));
        }
        let nested = self.unit.nested.get(ui).ok_or_else(|| DeslateError::NotDecompilable {
            what: format!("nested unit #{ui} of '{}'", self.unit.name),
        })?;
        let mut def = decompile_unit(nested, defaults)?;

        let bind = self.instr_at(ins.end_offset())?.clone();
        def.name = match (bind.op, bind.operand) {
            (Op::StoreFast, Some(Operand::U16(i))) => self.unit.varname_at(i as u32)?.to_string(),
            (Op::StoreName, Some(Operand::U16(i))) => self.unit.name_at(i as u32)?.to_string(),
            _ => return Err(unsupported(off, bind.end_offset())),
        };
        stmts.push(Stmt::FunctionDef(def));
        Ok(bind.end_offset())
    }

    fn walk(&mut self, lo: usize, hi: usize, ctx: Ctx) -> Result<Region, DeslateError> {
        let mut stmts: Vec<Stmt> = Vec::new();
        let mut stack: Vec<Expr> = Vec::new();
        let mut pos = lo;

        while pos < hi {
            if stack.is_empty() {
                let entry = self.open_entry(pos, hi);
                let latch = self.back_edge_latch(pos, hi);
                match (entry, latch) {
                    (Some(ei), Some(l)) => {
                        // The wider construct encloses the narrower one.
                        if self.unit.exc_table[ei].end as usize > l.off {
                            pos = self.fold_try(&mut stmts, ei, hi, ctx)?;
                        } else {
                            pos = self.fold_loop(&mut stmts, pos, l, ctx)?;
                        }
                        continue;
                    }
                    (Some(ei), None) => {
                        pos = self.fold_try(&mut stmts, ei, hi, ctx)?;
                        continue;
                    }
                    (None, Some(l)) => {
                        pos = self.fold_loop(&mut stmts, pos, l, ctx)?;
                        continue;
                    }
                    (None, None) => {}
                }
            }

            let ins = self.instr_at(pos)?.clone();
            match ins.op {
                Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop => {
                    pos = self.fold_bool(&ins, &mut stack)?;
                }
                Op::ForIter => {
                    pos = self.fold_comp(&ins, &mut stack)?;
                }
                Op::PopJumpIfFalse | Op::PopJumpIfTrue => {
                    pos = self.fold_if(&mut stmts, &mut stack, &ins, hi, ctx)?;
                }
                Op::Jump => {
                    let t = label_target(&ins).ok_or_else(|| unsupported(pos, ins.end_offset()))?;
                    if !stack.is_empty() {
                        return Err(unsupported(pos, ins.end_offset()));
                    }
                    if Some(t) == ctx.loop_header {
                        stmts.push(Stmt::Continue { line: ins.line });
                        pos = ins.end_offset();
                    } else if Some(t) == ctx.loop_exit {
                        stmts.push(Stmt::Break { line: ins.line });
                        pos = ins.end_offset();
                    } else if t >= hi || t < lo {
                        if ins.end_offset() == hi {
                            return Ok(Region { stmts, exit: Some(t), residual: stack });
                        }
                        return Err(unsupported(pos, ins.end_offset()));
                    } else {
                        return Err(unsupported(pos, t));
                    }
                }
                Op::ReturnValue => {
                    let v = Self::pop(&mut stack, pos)?;
                    stmts.push(Stmt::Return { value: Some(v), line: ins.line });
                    pos = ins.end_offset();
                }
                Op::ReturnNone => {
                    // The compiler's trailing epilogue is not a statement.
                    if Some(ins.offset) != ctx.epilogue {
                        stmts.push(Stmt::Return { value: None, line: ins.line });
                    }
                    pos = ins.end_offset();
                }
                Op::Raise => match ins.u8_operand() {
                    0 => {
                        stmts.push(Stmt::Raise { exc: None, line: ins.line });
                        pos = ins.end_offset();
                    }
                    1 => {
                        let v = Self::pop(&mut stack, pos)?;
                        stmts.push(Stmt::Raise { exc: Some(v), line: ins.line });
                        pos = ins.end_offset();
                    }
                    _ => return Err(unsupported(pos, ins.end_offset())),
                },
                Op::StoreFast => {
                    let v = Self::pop(&mut stack, pos)?;
                    let n = self.unit.varname_at(ins.u16_operand() as u32)?.to_string();
                    stmts.push(Stmt::Assign { target: Expr::Name(n), value: v, line: ins.line });
                    pos = ins.end_offset();
                }
                Op::StoreName => {
                    let v = Self::pop(&mut stack, pos)?;
                    let n = self.unit.name_at(ins.u16_operand() as u32)?.to_string();
                    stmts.push(Stmt::Assign { target: Expr::Name(n), value: v, line: ins.line });
                    pos = ins.end_offset();
                }
                Op::StoreSubscr => {
                    let index = Self::pop(&mut stack, pos)?;
                    let obj = Self::pop(&mut stack, pos)?;
                    let value = Self::pop(&mut stack, pos)?;
                    stmts.push(Stmt::Assign {
                        target: Expr::Subscript { value: Box::new(obj), index: Box::new(index) },
                        value,
                        line: ins.line,
                    });
                    pos = ins.end_offset();
                }
                Op::PopTop => {
                    let v = Self::pop(&mut stack, pos)?;
                    stmts.push(Stmt::Expr { value: v, line: ins.line });
                    pos = ins.end_offset();
                }
                Op::MakeFunction => {
                    pos = self.fold_def(&mut stmts, &mut stack, &ins)?;
                }
                _ if Self::is_pure(ins.op) => {
                    self.sim_step(&ins, &mut stack)?;
                    pos = ins.end_offset();
                }
                _ => return Err(unsupported(pos, ins.end_offset())),
            }
        }

        Ok(Region { stmts, exit: None, residual: stack })
    }

    fn body(&mut self) -> Result<Vec<Stmt>, DeslateError> {
        let hi = self.unit.code.len();
        let epilogue = self
            .instrs
            .last()
            .filter(|i| i.op == Op::ReturnNone)
            .map(|i| i.offset);
        let r = self.walk(0, hi, Ctx { epilogue, ..Ctx::default() })?;
        if r.exit.is_some() || !r.residual.is_empty() {
            return Err(unsupported(0, hi));
        }
        Ok(r.stmts)
    }
}

/// Reconstructs a function definition from its unit. `defaults` are the
/// expressions for the trailing defaulted parameters, either recovered from
/// an enclosing make_function or synthesized placeholders.
pub fn decompile_unit(unit: &CodeUnit, defaults: Vec<Expr>) -> Result<FunctionDef, DeslateError> {
    let n_params = unit.param_count as usize;
    if n_params > unit.varnames.len() {
        return Err(DeslateError::NotDecompilable {
            what: format!("unit '{}': {} parameters but {} locals", unit.name, n_params, unit.varnames.len()),
        });
    }
    if defaults.len() > n_params {
        return Err(DeslateError::NotDecompilable {
            what: format!(
                "unit '{}': {} defaults for {} parameters",
                unit.name,
                defaults.len(),
                n_params
            ),
        });
    }
    let first_default = n_params - defaults.len();
    let mut defaults = defaults.into_iter();
    let params = unit
        .varnames
        .iter()
        .take(n_params)
        .enumerate()
        .map(|(i, name)| Param {
            name: name.clone(),
            default: if i >= first_default { defaults.next() } else { None },
        })
        .collect();

    let body = Decompiler::new(unit)?.body()?;
    Ok(FunctionDef { name: unit.name.clone(), params, body, line: unit.first_line })
}

/// Reconstructs a whole module body, nested definitions included.
pub fn decompile_module(unit: &CodeUnit) -> Result<Module, DeslateError> {
    let body = Decompiler::new(unit)?.body()?;
    Ok(Module { body })
}
