use std::{fmt, ops::Deref};

use log::{debug, trace};

use crate::{error::DecodeError, opcodes::OpcodeTable};

/// One instruction of a code object's bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedInstruction {
    /// Byte offset of the opcode
    pub offset: usize,
    pub opcode: u8,
    pub mnemonic: &'static str,
    /// Full operand with the high bits of preceding EXTENDED_ARGs applied.
    /// EXTENDED_ARG instructions themselves carry their own raw byte.
    pub arg: u32,
    /// Size in bytes, inline caches included
    pub length: usize,
}

impl DecodedInstruction {
    /// Offset of the next instruction
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>6} {:<24} {}", self.offset, self.mnemonic, self.arg)
    }
}

/// Decoded instructions in stream order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instructions(Vec<DecodedInstruction>);

impl Instructions {
    pub fn new(instructions: Vec<DecodedInstruction>) -> Self {
        Instructions(instructions)
    }

    /// Index of the instruction starting exactly at `offset`
    pub fn index_of_offset(&self, offset: usize) -> Option<usize> {
        self.0.binary_search_by_key(&offset, |i| i.offset).ok()
    }

    pub fn by_offset(&self, offset: usize) -> Option<&DecodedInstruction> {
        self.index_of_offset(offset).map(|index| &self.0[index])
    }

    /// Offset just past the last instruction
    pub fn end(&self) -> usize {
        self.0.last().map_or(0, |i| i.end())
    }

    pub fn into_inner(self) -> Vec<DecodedInstruction> {
        self.0
    }
}

impl Deref for Instructions {
    type Target = [DecodedInstruction];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[DecodedInstruction]> for Instructions {
    fn as_ref(&self) -> &[DecodedInstruction] {
        &self.0
    }
}

impl From<Vec<DecodedInstruction>> for Instructions {
    fn from(value: Vec<DecodedInstruction>) -> Self {
        Instructions(value)
    }
}

/// Operand bits contributed by the EXTENDED_ARG instructions seen so far.
/// Cleared by the first instruction that is not an EXTENDED_ARG.
#[derive(Debug, Default)]
struct ExtendedArgState {
    high: u32,
}

impl ExtendedArgState {
    fn extend(&mut self, arg: u32, operand_bits: u32) {
        self.high = (self.high | arg).checked_shl(operand_bits).unwrap_or(0);
    }

    fn consume(&mut self, arg: u32) -> u32 {
        std::mem::take(&mut self.high) | arg
    }
}

/// Decodes raw bytecode left to right. Inline caches are skipped and folded into the length of the
/// instruction they belong to.
pub fn decode_stream(bytes: &[u8], table: &OpcodeTable) -> Result<Instructions, DecodeError> {
    debug!(
        "Decoding {} bytes of Python {} bytecode",
        bytes.len(),
        table.version()
    );

    let mut instructions = Vec::with_capacity(bytes.len() / 2);
    let mut extended = ExtendedArgState::default();
    let mut offset = 0;

    while offset < bytes.len() {
        let opcode = bytes[offset];

        let info = table
            .get(opcode)
            .ok_or(DecodeError::UnknownOpcode { offset, opcode })?;

        let length = table.instruction_len(info);

        if offset + length > bytes.len() {
            return Err(DecodeError::Truncated {
                offset,
                needed: length,
                available: bytes.len() - offset,
            });
        }

        let raw = bytes[offset + 1..offset + 1 + info.operand_bytes as usize]
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

        let arg = if table.is_extended_arg(opcode) {
            extended.extend(raw, u32::from(info.operand_bytes) * 8);
            raw
        } else {
            extended.consume(raw)
        };

        let instruction = DecodedInstruction {
            offset,
            opcode,
            mnemonic: info.mnemonic,
            arg,
            length,
        };

        trace!("{instruction}");

        instructions.push(instruction);
        offset += length;
    }

    Ok(Instructions(instructions))
}
