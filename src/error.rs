use std::fmt;

use crate::{opcodes::TableError, version::PyVersion};

/// Failure while reading marshalled values or an instruction stream.
/// Every variant carries the byte offset where the failing read started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A declared length or fixed-size read runs past the end of the input
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// Back-reference to a slot that was never registered
    BadReference {
        offset: usize,
        index: u32,
        registered: usize,
    },
    TooDeep {
        offset: usize,
        limit: usize,
    },
    UnknownOpcode {
        offset: usize,
        opcode: u8,
    },
    MalformedTag {
        offset: usize,
        tag: u8,
    },
    /// A NULL tag where a value is required (it only terminates dicts)
    UnexpectedNull {
        offset: usize,
    },
    InvalidUtf8 {
        offset: usize,
    },
    /// Textual float or complex that does not parse
    InvalidNumber {
        offset: usize,
    },
    /// A code object field holds the wrong kind of value
    UnexpectedType {
        offset: usize,
        expected: &'static str,
    },
    TrailingData {
        offset: usize,
        remaining: usize,
    },
    /// A code object field cites a slot whose value is still being decoded
    RecursiveReference {
        offset: usize,
        index: u32,
    },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::Truncated { offset, .. }
            | DecodeError::BadReference { offset, .. }
            | DecodeError::TooDeep { offset, .. }
            | DecodeError::UnknownOpcode { offset, .. }
            | DecodeError::MalformedTag { offset, .. }
            | DecodeError::UnexpectedNull { offset }
            | DecodeError::InvalidUtf8 { offset }
            | DecodeError::InvalidNumber { offset }
            | DecodeError::UnexpectedType { offset, .. }
            | DecodeError::TrailingData { offset, .. }
            | DecodeError::RecursiveReference { offset, .. } => *offset,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated {
                offset,
                needed,
                available,
            } => write!(
                f,
                "truncated input at offset {offset}: needed {needed} bytes, {available} available"
            ),
            DecodeError::BadReference {
                offset,
                index,
                registered,
            } => write!(
                f,
                "bad reference at offset {offset}: index {index} but only {registered} objects registered"
            ),
            DecodeError::TooDeep { offset, limit } => {
                write!(f, "nesting deeper than {limit} at offset {offset}")
            }
            DecodeError::UnknownOpcode { offset, opcode } => {
                write!(f, "unknown opcode {opcode} at offset {offset}")
            }
            DecodeError::MalformedTag { offset, tag } => {
                write!(f, "malformed type tag {tag:#04x} at offset {offset}")
            }
            DecodeError::UnexpectedNull { offset } => {
                write!(f, "unexpected NULL at offset {offset}")
            }
            DecodeError::InvalidUtf8 { offset } => {
                write!(f, "invalid UTF-8 string at offset {offset}")
            }
            DecodeError::InvalidNumber { offset } => {
                write!(f, "invalid textual number at offset {offset}")
            }
            DecodeError::UnexpectedType { offset, expected } => {
                write!(f, "expected {expected} at offset {offset}")
            }
            DecodeError::TrailingData { offset, remaining } => {
                write!(f, "{remaining} trailing bytes at offset {offset}")
            }
            DecodeError::RecursiveReference { offset, index } => write!(
                f,
                "reference at offset {offset} to object {index} which is still being decoded"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failure while building the control flow graph of one code object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// Two predecessors reach `block` with different stack depths
    InconsistentStackDepth {
        block: usize,
        offset: usize,
        expected: u32,
        found: u32,
    },
    /// The jump at `offset` targets something that is not the start of an instruction
    DanglingJumpTarget { offset: usize, target: i64 },
    UnsupportedVersion(PyVersion),
    StackUnderflow { offset: usize, depth: u32, pops: u32 },
    /// The operand is too large for the stack effect of the instruction to be counted
    OperandOverflow { offset: usize, arg: u32 },
    /// Pushing would take the stack past `u32::MAX` values
    DepthOverflow { offset: usize, depth: u32, pushes: u32 },
    /// The expression lifter refuses to materialize a stack this deep
    StackTooDeep { depth: u32, limit: u32 },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::InconsistentStackDepth {
                block,
                offset,
                expected,
                found,
            } => write!(
                f,
                "inconsistent stack depth entering block {block} (offset {offset}): {expected} vs {found}"
            ),
            AnalysisError::DanglingJumpTarget { offset, target } => {
                write!(f, "jump at offset {offset} targets invalid offset {target}")
            }
            AnalysisError::UnsupportedVersion(version) => {
                write!(f, "no opcode table registered for Python {version}")
            }
            AnalysisError::StackUnderflow {
                offset,
                depth,
                pops,
            } => write!(
                f,
                "instruction at offset {offset} pops {pops} values with only {depth} on the stack"
            ),
            AnalysisError::OperandOverflow { offset, arg } => {
                write!(f, "stack effect of operand {arg} at offset {offset} overflows")
            }
            AnalysisError::DepthOverflow {
                offset,
                depth,
                pushes,
            } => write!(
                f,
                "instruction at offset {offset} pushes {pushes} values onto a stack of {depth}"
            ),
            AnalysisError::StackTooDeep { depth, limit } => {
                write!(f, "stack depth {depth} exceeds the lifting limit of {limit}")
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Decode(DecodeError),
    Analysis(AnalysisError),
    InvalidTable(TableError),
    InvalidVersion(String),
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Error::Decode(value)
    }
}

impl From<AnalysisError> for Error {
    fn from(value: AnalysisError) -> Self {
        Error::Analysis(value)
    }
}

impl From<TableError> for Error {
    fn from(value: TableError) -> Self {
        Error::InvalidTable(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::Analysis(e) => write!(f, "analysis error: {e}"),
            Error::InvalidTable(e) => write!(f, "invalid opcode table: {e}"),
            Error::InvalidVersion(s) => write!(f, "invalid Python version {s:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(e) => Some(e),
            Error::Analysis(e) => Some(e),
            Error::InvalidTable(e) => Some(e),
            Error::InvalidVersion(_) => None,
        }
    }
}
