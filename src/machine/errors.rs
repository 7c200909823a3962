use crate::machine::state::EngineState;
use crate::types::encoding::DecodeError;
use asmbot_derive::Error;
use std::fmt;

/// Category of an assembly failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmErrorKind {
    /// Malformed statement, unknown mnemonic or directive, duplicate symbol.
    Syntax,
    /// A referenced symbol is never defined.
    UnresolvedSymbol,
    /// A value does not fit its field, an invalid register, or a region overflow.
    Encoding,
}

impl fmt::Display for AsmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Syntax => "syntax error",
            Self::UnresolvedSymbol => "unresolved symbol",
            Self::Encoding => "encoding error",
        })
    }
}

/// Assembly failure with its source location.
///
/// `line` and `column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {kind}: {message}")]
pub struct AsmError {
    pub kind: AsmErrorKind,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl AsmError {
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::new(AsmErrorKind::Syntax, line, column, message)
    }

    pub fn unresolved(line: usize, column: usize, symbol: &str) -> Self {
        Self::new(
            AsmErrorKind::UnresolvedSymbol,
            line,
            column,
            format!("undefined symbol `{symbol}`"),
        )
    }

    pub fn encoding(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::new(AsmErrorKind::Encoding, line, column, message)
    }

    fn new(kind: AsmErrorKind, line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            column,
            message: message.into(),
        }
    }
}

/// Why an operand list could not be packed into an instruction word.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperandError {
    #[error("missing operand")]
    Missing,
    #[error("too many operands")]
    Extra,
    #[error("expected a register")]
    ExpectedRegister,
    #[error("expected a value, found a register")]
    ExpectedValue,
    #[error("value {value} does not fit in a {field}")]
    OutOfRange { value: i64, field: &'static str },
}

/// Why the word at the program counter could not be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFaultReason {
    #[error("outside the loaded program")]
    OutsideProgram,
    #[error("misaligned program counter")]
    Misaligned,
    #[error("unknown opcode {opcode:#04x}")]
    UnknownOpcode { opcode: u8 },
    #[error("register field names no register")]
    InvalidRegister,
    #[error("reserved bits are set")]
    ReservedBits,
}

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Errors raised by the execution engine.
///
/// `DecodeFault` and `MemoryFault` leave the engine `Faulted` until reset; the
/// others are sequencing errors that change nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulatorError {
    #[error("decode fault at {pc:#010x}: {reason}")]
    DecodeFault { pc: u32, reason: DecodeFaultReason },
    #[error("memory fault: {len}-byte {access} at {addr:#010x}")]
    MemoryFault { addr: u32, len: usize, access: Access },
    #[error("operation not allowed while {state}")]
    NotReady { state: EngineState },
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("program of {words} words exceeds the {capacity}-word code region")]
    ProgramTooLarge { words: usize, capacity: usize },
    #[error("data image of {bytes} bytes exceeds the {capacity}-byte data region")]
    DataTooLarge { bytes: usize, capacity: usize },
}

impl EmulatorError {
    /// True for run-time faults that move the engine to `Faulted`.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::DecodeFault { .. } | Self::MemoryFault { .. })
    }
}

/// Errors reading a serialized program image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid program image: {reason}")]
    Malformed { reason: &'static str },
    #[error("invalid program image: {0}")]
    Codec(#[from] DecodeError),
}
