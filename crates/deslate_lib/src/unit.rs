use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeslateError;

/// Compiled constant. Tuples are the only aggregate constant kind; lists
/// are always built at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Const>),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::None => write!(f, "None"),
            Const::Bool(true) => write!(f, "True"),
            Const::Bool(false) => write!(f, "False"),
            Const::Int(v) => write!(f, "{v}"),
            Const::Float(v) => write!(f, "{v:?}"),
            Const::Str(s) => write!(f, "'{}'", escape_str(s)),
            Const::Tuple(items) => {
                write!(f, "(")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{it}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// One protected region: instructions in start..end are covered by the
/// handler code beginning at handler. Offsets are absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

pub const UNIT_FLAG_MODULE: u32 = 0x1;

/// Immutable description of one compiled routine. Nested units (inner
/// function definitions) are owned by their parent and referenced by index
/// from make_function operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub origin: String,
    pub first_line: u32,
    pub flags: u32,
    pub param_count: u16,
    pub code: Vec<u8>,
    pub consts: Vec<Const>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub nested: Vec<CodeUnit>,
    pub exc_table: Vec<ExceptionEntry>,
    pub lines: Vec<LineEntry>,
}

impl CodeUnit {
    pub fn is_module(&self) -> bool {
        self.flags & UNIT_FLAG_MODULE != 0
    }

    pub fn const_at(&self, idx: u32) -> Result<&Const, DeslateError> {
        self.consts.get(idx as usize).ok_or(DeslateError::InvalidConstIndex(idx))
    }

    pub fn name_at(&self, idx: u32) -> Result<&str, DeslateError> {
        self.names
            .get(idx as usize)
            .map(String::as_str)
            .ok_or(DeslateError::InvalidNameIndex(idx))
    }

    pub fn varname_at(&self, idx: u32) -> Result<&str, DeslateError> {
        self.varnames
            .get(idx as usize)
            .map(String::as_str)
            .ok_or(DeslateError::InvalidNameIndex(idx))
    }

    /// Source line for an instruction offset: last line-table entry at or
    /// before it, falling back to the unit's first line.
    pub fn line_at(&self, offset: usize) -> u32 {
        let mut line = self.first_line;
        for e in &self.lines {
            if e.offset as usize > offset {
                break;
            }
            line = e.line;
        }
        line
    }
}
