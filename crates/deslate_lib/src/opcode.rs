use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,
    PopTop = 0x01,
    DupTop = 0x02,
    RotTwo = 0x03,
    LoadConst = 0x04,
    LoadName = 0x05,
    StoreName = 0x06,
    LoadFast = 0x07,
    StoreFast = 0x08,
    LoadAttr = 0x09,
    LoadSubscr = 0x0a,
    StoreSubscr = 0x0b,
    BinaryOp = 0x0c,
    UnaryOp = 0x0d,
    CompareOp = 0x0e,
    Jump = 0x0f,
    PopJumpIfFalse = 0x10,
    PopJumpIfTrue = 0x11,
    JumpIfFalseOrPop = 0x12,
    JumpIfTrueOrPop = 0x13,
    Call = 0x14,
    ReturnValue = 0x15,
    ReturnNone = 0x16,
    BuildList = 0x17,
    BuildTuple = 0x18,
    GetIter = 0x19,
    ForIter = 0x1a,
    ListAppend = 0x1b,
    MakeFunction = 0x1c,
    Raise = 0x1d,
    CheckExcMatch = 0x1e,
    Reraise = 0x1f,
}

impl Op {
    pub fn from_byte(b: u8) -> Option<Op> {
        if (b as usize) < OPCODE_INFO_V1.len() {
            Some(OPCODE_INFO_V1[b as usize].op)
        } else {
            None
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Op::ReturnValue | Op::ReturnNone | Op::Raise | Op::Reraise)
    }

    pub fn is_cond_jump(self) -> bool {
        matches!(
            self,
            Op::PopJumpIfFalse | Op::PopJumpIfTrue | Op::JumpIfFalseOrPop | Op::JumpIfTrueOrPop | Op::ForIter
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpFmt {
    None,
    U8,
    U16,
    Jump,
    FuncPair,
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub op: Op,
    pub name: &'static str,
    pub size: u8,
    pub n_pop: u8,
    pub n_push: u8,
    pub fmt: OpFmt,
}

// Table index equals the opcode byte; n_pop/n_push are the nominal effects,
// operand-dependent ones go through stack_effect.
static OPCODE_INFO_V1: &[OpInfo] = &[
    OpInfo { op: Op::Nop, name: "nop", size: 1, n_pop: 0, n_push: 0, fmt: OpFmt::None },
    OpInfo { op: Op::PopTop, name: "pop_top", size: 1, n_pop: 1, n_push: 0, fmt: OpFmt::None },
    OpInfo { op: Op::DupTop, name: "dup_top", size: 1, n_pop: 1, n_push: 2, fmt: OpFmt::None },
    OpInfo { op: Op::RotTwo, name: "rot_two", size: 1, n_pop: 2, n_push: 2, fmt: OpFmt::None },
    OpInfo { op: Op::LoadConst, name: "load_const", size: 3, n_pop: 0, n_push: 1, fmt: OpFmt::U16 },
    OpInfo { op: Op::LoadName, name: "load_name", size: 3, n_pop: 0, n_push: 1, fmt: OpFmt::U16 },
    OpInfo { op: Op::StoreName, name: "store_name", size: 3, n_pop: 1, n_push: 0, fmt: OpFmt::U16 },
    OpInfo { op: Op::LoadFast, name: "load_fast", size: 3, n_pop: 0, n_push: 1, fmt: OpFmt::U16 },
    OpInfo { op: Op::StoreFast, name: "store_fast", size: 3, n_pop: 1, n_push: 0, fmt: OpFmt::U16 },
    OpInfo { op: Op::LoadAttr, name: "load_attr", size: 3, n_pop: 1, n_push: 1, fmt: OpFmt::U16 },
    OpInfo { op: Op::LoadSubscr, name: "load_subscr", size: 1, n_pop: 2, n_push: 1, fmt: OpFmt::None },
    OpInfo { op: Op::StoreSubscr, name: "store_subscr", size: 1, n_pop: 3, n_push: 0, fmt: OpFmt::None },
    OpInfo { op: Op::BinaryOp, name: "binary_op", size: 2, n_pop: 2, n_push: 1, fmt: OpFmt::U8 },
    OpInfo { op: Op::UnaryOp, name: "unary_op", size: 2, n_pop: 1, n_push: 1, fmt: OpFmt::U8 },
    OpInfo { op: Op::CompareOp, name: "compare_op", size: 2, n_pop: 2, n_push: 1, fmt: OpFmt::U8 },
    OpInfo { op: Op::Jump, name: "jump", size: 3, n_pop: 0, n_push: 0, fmt: OpFmt::Jump },
    OpInfo { op: Op::PopJumpIfFalse, name: "pop_jump_if_false", size: 3, n_pop: 1, n_push: 0, fmt: OpFmt::Jump },
    OpInfo { op: Op::PopJumpIfTrue, name: "pop_jump_if_true", size: 3, n_pop: 1, n_push: 0, fmt: OpFmt::Jump },
    OpInfo { op: Op::JumpIfFalseOrPop, name: "jump_if_false_or_pop", size: 3, n_pop: 1, n_push: 1, fmt: OpFmt::Jump },
    OpInfo { op: Op::JumpIfTrueOrPop, name: "jump_if_true_or_pop", size: 3, n_pop: 1, n_push: 1, fmt: OpFmt::Jump },
    OpInfo { op: Op::Call, name: "call", size: 2, n_pop: 1, n_push: 1, fmt: OpFmt::U8 },
    OpInfo { op: Op::ReturnValue, name: "return_value", size: 1, n_pop: 1, n_push: 0, fmt: OpFmt::None },
    OpInfo { op: Op::ReturnNone, name: "return_none", size: 1, n_pop: 0, n_push: 0, fmt: OpFmt::None },
    OpInfo { op: Op::BuildList, name: "build_list", size: 3, n_pop: 0, n_push: 1, fmt: OpFmt::U16 },
    OpInfo { op: Op::BuildTuple, name: "build_tuple", size: 3, n_pop: 0, n_push: 1, fmt: OpFmt::U16 },
    OpInfo { op: Op::GetIter, name: "get_iter", size: 1, n_pop: 1, n_push: 1, fmt: OpFmt::None },
    OpInfo { op: Op::ForIter, name: "for_iter", size: 3, n_pop: 1, n_push: 2, fmt: OpFmt::Jump },
    OpInfo { op: Op::ListAppend, name: "list_append", size: 3, n_pop: 1, n_push: 0, fmt: OpFmt::U16 },
    OpInfo { op: Op::MakeFunction, name: "make_function", size: 3, n_pop: 0, n_push: 1, fmt: OpFmt::FuncPair },
    OpInfo { op: Op::Raise, name: "raise", size: 2, n_pop: 0, n_push: 0, fmt: OpFmt::U8 },
    OpInfo { op: Op::CheckExcMatch, name: "check_exc_match", size: 1, n_pop: 2, n_push: 2, fmt: OpFmt::None },
    OpInfo { op: Op::Reraise, name: "reraise", size: 1, n_pop: 1, n_push: 0, fmt: OpFmt::None },
];

pub fn opcode_info(op: u8) -> Option<&'static OpInfo> {
    OPCODE_INFO_V1.get(op as usize)
}

/// Net (pops, pushes) of one instruction, resolving the operand-dependent
/// cases the static table cannot express.
pub fn stack_effect(op: Op, operand: u16) -> (usize, usize) {
    match op {
        Op::Call => (operand as usize + 1, 1),
        Op::BuildList | Op::BuildTuple => (operand as usize, 1),
        Op::MakeFunction => ((operand & 0xff) as usize, 1),
        Op::Raise => (operand as usize, 0),
        _ => {
            let info = &OPCODE_INFO_V1[op as u8 as usize];
            (info.n_pop as usize, info.n_push as usize)
        }
    }
}

pub const BINARY_OP_NAMES: &[&str] = &["+", "-", "*", "/", "//", "%", "**"];
pub const UNARY_OP_NAMES: &[&str] = &["-", "not"];
pub const COMPARE_OP_NAMES: &[&str] = &["==", "!=", "<", "<=", ">", ">=", "in", "not in"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_matches_opcode_byte() {
        for (i, info) in OPCODE_INFO_V1.iter().enumerate() {
            assert_eq!(info.op as u8 as usize, i, "row {} ({})", i, info.name);
        }
    }

    #[test]
    fn from_byte_rejects_unknown() {
        assert_eq!(Op::from_byte(0x0c), Some(Op::BinaryOp));
        assert_eq!(Op::from_byte(0x20), None);
        assert_eq!(Op::from_byte(0xff), None);
    }

    #[test]
    fn stack_effect_tracks_operand() {
        assert_eq!(stack_effect(Op::Call, 2), (3, 1));
        assert_eq!(stack_effect(Op::BuildList, 4), (4, 1));
        assert_eq!(stack_effect(Op::MakeFunction, 0x0102), (2, 1));
        assert_eq!(stack_effect(Op::BinaryOp, 0), (2, 1));
    }
}
