use std::collections::{BTreeSet, HashMap};

use crate::error::DeslateError;
use crate::instr::{Instr, label_target};
use crate::opcode::Op;
use crate::unit::ExceptionEntry;

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: usize,
    /// Offset one past the last instruction of the block.
    pub end: usize,
    pub instrs: Vec<Instr>,
    /// Successor block start offsets: two for a conditional branch (target
    /// first, fall-through second), one for a jump or fall-through, none
    /// for a terminal block.
    pub succs: Vec<usize>,
}

/// Splits the instruction sequence into basic blocks: leaders are the first
/// instruction, every jump target, everything following a branch or
/// terminal instruction, and the boundaries of protected regions.
pub fn build_cfg(
    instrs: &[Instr],
    exc_table: &[ExceptionEntry],
) -> Result<Vec<BasicBlock>, DeslateError> {
    let offsets: BTreeSet<usize> = instrs.iter().map(|i| i.offset).collect();

    let mut leaders: BTreeSet<usize> = BTreeSet::new();
    if let Some(first) = instrs.first() {
        leaders.insert(first.offset);
    }
    for (idx, ins) in instrs.iter().enumerate() {
        if let Some(t) = label_target(ins) {
            if !offsets.contains(&t) {
                return Err(DeslateError::InvalidJumpTarget { offset: ins.offset, target: t });
            }
            leaders.insert(t);
            if let Some(next) = instrs.get(idx + 1) {
                leaders.insert(next.offset);
            }
        }
        if ins.op.is_terminal() {
            if let Some(next) = instrs.get(idx + 1) {
                leaders.insert(next.offset);
            }
        }
    }
    for e in exc_table {
        for off in [e.start as usize, e.end as usize, e.handler as usize] {
            if offsets.contains(&off) {
                leaders.insert(off);
            }
        }
    }

    let leader_list: Vec<usize> = leaders.into_iter().collect();
    let mut start_to_block: HashMap<usize, usize> = HashMap::new();
    let mut blocks: Vec<BasicBlock> = Vec::new();
    for (bi, &off) in leader_list.iter().enumerate() {
        start_to_block.insert(off, bi);
        blocks.push(BasicBlock { start: off, end: off, instrs: Vec::new(), succs: Vec::new() });
    }

    let mut current_block = 0usize;
    let mut next_leader_idx = 1usize;
    let mut next_leader = leader_list.get(next_leader_idx).copied();
    for ins in instrs.iter().cloned() {
        if Some(ins.offset) == next_leader {
            current_block = start_to_block[&ins.offset];
            next_leader_idx += 1;
            next_leader = leader_list.get(next_leader_idx).copied();
        }
        blocks[current_block].end = ins.end_offset();
        blocks[current_block].instrs.push(ins);
    }

    for bi in 0..blocks.len() {
        let last = match blocks[bi].instrs.last() {
            Some(i) => i.clone(),
            None => continue,
        };
        let mut succs = Vec::new();
        if last.op == Op::Jump {
            if let Some(t) = label_target(&last) {
                succs.push(t);
            }
        } else if last.op.is_cond_jump() {
            if let Some(t) = label_target(&last) {
                succs.push(t);
            }
            if let Some(next) = blocks.get(bi + 1) {
                succs.push(next.start);
            }
        } else if last.op.is_terminal() {
        } else if let Some(next) = blocks.get(bi + 1) {
            succs.push(next.start);
        }
        blocks[bi].succs = succs;
    }

    Ok(blocks)
}

pub fn block_index(blocks: &[BasicBlock]) -> HashMap<usize, usize> {
    blocks.iter().enumerate().map(|(i, b)| (b.start, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::decode_instructions;
    use crate::unit::{CodeUnit, Const};

    fn unit_with_code(code: Vec<u8>) -> CodeUnit {
        CodeUnit {
            name: "f".into(),
            origin: "<test>".into(),
            first_line: 1,
            flags: 0,
            param_count: 0,
            code,
            consts: vec![Const::Int(0), Const::Int(1)],
            names: Vec::new(),
            varnames: vec!["x".into()],
            nested: Vec::new(),
            exc_table: Vec::new(),
            lines: Vec::new(),
        }
    }

    #[test]
    fn straight_line_code_is_one_block() {
        // load_const 0; store_fast 0; return_none
        let unit = unit_with_code(vec![0x04, 0, 0, 0x08, 0, 0, 0x16]);
        let instrs = decode_instructions(&unit).unwrap();
        let blocks = build_cfg(&instrs, &unit.exc_table).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].end, 7);
        assert!(blocks[0].succs.is_empty());
    }

    #[test]
    fn conditional_gets_two_ordered_successors() {
        //  0 load_const 0
        //  3 pop_jump_if_false 12
        //  6 load_const 1
        //  9 store_fast 0
        // 12 return_none
        let unit = unit_with_code(vec![
            0x04, 0, 0, 0x10, 12, 0, 0x04, 1, 0, 0x08, 0, 0, 0x16,
        ]);
        let instrs = decode_instructions(&unit).unwrap();
        let blocks = build_cfg(&instrs, &unit.exc_table).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].succs, vec![12, 6]);
        assert_eq!(blocks[1].succs, vec![12]);
        assert!(blocks[2].succs.is_empty());

        let index = block_index(&blocks);
        for b in &blocks {
            for s in &b.succs {
                assert!(index.contains_key(s), "dangling edge to {s}");
            }
        }
    }

    #[test]
    fn jump_into_operand_bytes_is_rejected() {
        // jump 1 lands inside its own operand
        let unit = unit_with_code(vec![0x0f, 1, 0, 0x16]);
        let instrs = decode_instructions(&unit).unwrap();
        match build_cfg(&instrs, &unit.exc_table) {
            Err(DeslateError::InvalidJumpTarget { offset, target }) => {
                assert_eq!(offset, 0);
                assert_eq!(target, 1);
            }
            other => panic!("expected InvalidJumpTarget, got {:?}", other),
        }
    }

    #[test]
    fn protected_region_bounds_are_leaders() {
        //  0 nop
        //  1 load_const 0   <- protected 1..7
        //  4 store_fast 0
        //  7 jump 11
        // 10 reraise        <- handler
        // 11 return_none
        let mut unit = unit_with_code(vec![
            0x00, 0x04, 0, 0, 0x08, 0, 0, 0x0f, 11, 0, 0x1f, 0x16,
        ]);
        unit.exc_table.push(ExceptionEntry { start: 1, end: 7, handler: 10 });
        let instrs = decode_instructions(&unit).unwrap();
        let blocks = build_cfg(&instrs, &unit.exc_table).unwrap();
        let starts: Vec<usize> = blocks.iter().map(|b| b.start).collect();
        assert!(starts.contains(&1));
        assert!(starts.contains(&7));
        assert!(starts.contains(&10));
    }
}
