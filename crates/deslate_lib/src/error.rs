use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeslateError {
    #[error("unexpected end of input")]
    Eof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { offset: usize, opcode: u8 },

    #[error("truncated instruction at offset {offset} (opcode size={size}, remaining={remaining})")]
    TruncatedInstruction { offset: usize, size: usize, remaining: usize },

    #[error("operand stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },

    #[error("invalid constant pool index: {0}")]
    InvalidConstIndex(u32),

    #[error("invalid name index: {0}")]
    InvalidNameIndex(u32),

    #[error("unsupported control-flow construct in offsets {start}..{end}")]
    UnsupportedConstruct { start: usize, end: usize },

    #[error("jump at offset {offset} targets {target}, not an instruction boundary")]
    InvalidJumpTarget { offset: usize, target: usize },

    #[error("malformed container: {reason}")]
    MalformedContainer { reason: String },

    #[error("no binding supplied for default of parameter '{param}'")]
    MissingDefaultBinding { param: String },

    #[error("cannot decompile {what}: no inspectable code unit")]
    NotDecompilable { what: String },

    #[error("compile error: {reason}")]
    Compile { reason: String },

    #[error("uncaught {kind}: {message}")]
    Uncaught { kind: String, message: String },

    #[error("execution error: {reason}")]
    Exec { reason: String },
}

impl DeslateError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        DeslateError::MalformedContainer { reason: reason.into() }
    }

    pub fn compile(reason: impl Into<String>) -> Self {
        DeslateError::Compile { reason: reason.into() }
    }

    pub fn exec(reason: impl Into<String>) -> Self {
        DeslateError::Exec { reason: reason.into() }
    }
}
