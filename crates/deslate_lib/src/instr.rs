use byteorder::{ByteOrder, LittleEndian};

use crate::error::DeslateError;
use crate::opcode::{self, Op, OpFmt};
use crate::unit::CodeUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    U8(u8),
    U16(u16),
    Jump(u16),
    FuncPair { unit: u8, n_defaults: u8 },
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub offset: usize,
    pub op: Op,
    pub name: &'static str,
    pub size: u8,
    pub fmt: OpFmt,
    pub operand: Option<Operand>,
    pub line: u32,
}

impl Instr {
    pub fn end_offset(&self) -> usize {
        self.offset + self.size as usize
    }

    pub fn u8_operand(&self) -> u8 {
        match self.operand {
            Some(Operand::U8(v)) => v,
            _ => 0,
        }
    }

    pub fn u16_operand(&self) -> u16 {
        match self.operand {
            Some(Operand::U16(v)) => v,
            _ => 0,
        }
    }
}

/// Decodes a unit's raw code bytes into the abstract instruction stream.
/// Unknown opcode bytes and instructions running past the end of the code
/// are hard failures; a mis-decode would corrupt every later offset.
pub fn decode_instructions(unit: &CodeUnit) -> Result<Vec<Instr>, DeslateError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < unit.code.len() {
        let b = unit.code[offset];
        let info = opcode::opcode_info(b)
            .ok_or(DeslateError::UnsupportedOpcode { offset, opcode: b })?;
        let size = info.size as usize;
        if unit.code.len() - offset < size {
            return Err(DeslateError::TruncatedInstruction {
                offset,
                size,
                remaining: unit.code.len() - offset,
            });
        }
        let args = &unit.code[offset + 1..offset + size];
        let operand = match info.fmt {
            OpFmt::None => None,
            OpFmt::U8 => Some(Operand::U8(args[0])),
            OpFmt::U16 => Some(Operand::U16(LittleEndian::read_u16(args))),
            OpFmt::Jump => Some(Operand::Jump(LittleEndian::read_u16(args))),
            OpFmt::FuncPair => Some(Operand::FuncPair { unit: args[0], n_defaults: args[1] }),
        };

        out.push(Instr {
            offset,
            op: info.op,
            name: info.name,
            size: info.size,
            fmt: info.fmt,
            operand,
            line: unit.line_at(offset),
        });

        offset += size;
    }
    Ok(out)
}

pub fn label_target(i: &Instr) -> Option<usize> {
    match i.operand {
        Some(Operand::Jump(t)) => Some(t as usize),
        _ => None,
    }
}

fn operand_comment(unit: &CodeUnit, i: &Instr) -> Option<String> {
    match (i.op, i.operand) {
        (Op::LoadConst, Some(Operand::U16(idx))) => {
            unit.consts.get(idx as usize).map(|c| c.to_string())
        }
        (Op::LoadName | Op::StoreName | Op::LoadAttr, Some(Operand::U16(idx))) => {
            unit.names.get(idx as usize).cloned()
        }
        (Op::LoadFast | Op::StoreFast, Some(Operand::U16(idx))) => {
            unit.varnames.get(idx as usize).cloned()
        }
        (Op::BinaryOp, Some(Operand::U8(c))) => {
            opcode::BINARY_OP_NAMES.get(c as usize).map(|s| s.to_string())
        }
        (Op::UnaryOp, Some(Operand::U8(c))) => {
            opcode::UNARY_OP_NAMES.get(c as usize).map(|s| s.to_string())
        }
        (Op::CompareOp, Some(Operand::U8(c))) => {
            opcode::COMPARE_OP_NAMES.get(c as usize).map(|s| s.to_string())
        }
        (Op::MakeFunction, Some(Operand::FuncPair { unit: u, .. })) => {
            unit.nested.get(u as usize).map(|n| format!("<unit {}>", n.name))
        }
        _ => None,
    }
}

/// One listing line per instruction: offset, mnemonic, raw operand, and a
/// resolved comment where the operand indexes a pool.
pub fn disassemble_instrs(unit: &CodeUnit, instrs: &[Instr]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "unit {} (params={}, names={}, vars={}, nested={})\n",
        unit.name,
        unit.param_count,
        unit.names.len(),
        unit.varnames.len(),
        unit.nested.len()
    ));
    out.push_str("code:\n");

    for ins in instrs {
        out.push_str(&format!("{:05} {:<20}", ins.offset, ins.name));
        match ins.operand {
            None => {}
            Some(Operand::U8(v)) => out.push_str(&format!("       {}", v)),
            Some(Operand::U16(v)) => out.push_str(&format!("       {}", v)),
            Some(Operand::Jump(t)) => out.push_str(&format!("       -> {}", t)),
            Some(Operand::FuncPair { unit, n_defaults }) => {
                out.push_str(&format!("       {}, {}", unit, n_defaults))
            }
        }
        if let Some(c) = operand_comment(unit, ins) {
            out.push_str(&format!(" ; {}", c));
        }
        out.push('\n');
    }

    if !unit.exc_table.is_empty() {
        out.push_str("exception table:\n");
        for e in &unit.exc_table {
            out.push_str(&format!("  {}..{} -> {}\n", e.start, e.end, e.handler));
        }
    }

    out
}
