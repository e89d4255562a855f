//! Opcode tables: everything the decoder and the analyzer know about an instruction set.
//!
//! A table is plain data. Each interpreter release provides one (see [`crate::v310`] to [`crate::v314`])
//! and the engine never branches on the version itself.

use std::fmt;

use indexmap::IndexMap;

use crate::{
    instructions::DecodedInstruction, semantics::Semantics, unmarshal::format::MarshalFormat,
    utils::StackEffect, version::PyVersion,
};

/// Stack effect depending on the operand and on whether the jump is taken. `None` when the operand is too
/// large for the effect to be counted.
pub type EffectFn = fn(oparg: u32, jump: bool) -> Option<StackEffect>;

#[derive(Debug, Clone, Copy)]
pub enum StackEffectDescriptor {
    Fixed(StackEffect),
    /// Independent of the operand, but not of the jump
    Branching {
        taken: StackEffect,
        not_taken: StackEffect,
    },
    Computed(EffectFn),
}

impl StackEffectDescriptor {
    pub fn effect(&self, oparg: u32, jump: bool) -> Option<StackEffect> {
        match self {
            StackEffectDescriptor::Fixed(effect) => Some(*effect),
            StackEffectDescriptor::Branching { taken, not_taken } => {
                Some(if jump { *taken } else { *not_taken })
            }
            StackEffectDescriptor::Computed(f) => f(oparg, jump),
        }
    }
}

/// `(pops -- pushes)` independent of the operand
pub const fn fixed(pops: u32, pushes: u32) -> StackEffectDescriptor {
    StackEffectDescriptor::Fixed(StackEffect::new(pops, pushes))
}

pub const fn branching(taken: StackEffect, not_taken: StackEffect) -> StackEffectDescriptor {
    StackEffectDescriptor::Branching { taken, not_taken }
}

pub const fn computed(f: EffectFn) -> StackEffectDescriptor {
    StackEffectDescriptor::Computed(f)
}

/// How control leaves an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Sequential,
    /// Falls through, but calls out
    Call,
    /// Conditional jump, either to its target or to the next instruction
    Branch,
    /// Unconditional jump
    Jump,
    Return,
    Raise,
    /// Falls through and registers its target as an exception handler
    SetupHandler,
}

impl FlowKind {
    /// Whether the instruction after this one starts a new block
    pub fn ends_block(&self) -> bool {
        !matches!(self, FlowKind::Sequential | FlowKind::Call)
    }

    pub fn has_target(&self) -> bool {
        matches!(
            self,
            FlowKind::Branch | FlowKind::Jump | FlowKind::SetupHandler
        )
    }

    /// Whether control can continue with the next instruction
    pub fn falls_through(&self) -> bool {
        !matches!(self, FlowKind::Jump | FlowKind::Return | FlowKind::Raise)
    }
}

/// How the operand of a jump encodes its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpAddressing {
    /// `operand * jump_unit` from the start of the code
    Absolute,
    /// `operand * jump_unit` after the end of the instruction, caches included
    Forward,
    /// `operand * jump_unit` before the end of the instruction, caches included
    Backward,
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub code: u8,
    pub mnemonic: &'static str,
    /// Width of the operand following the opcode byte
    pub operand_bytes: u8,
    /// Inline cache units following the instruction
    pub cache_entries: u8,
    pub flow: FlowKind,
    pub jump: Option<JumpAddressing>,
    pub effect: StackEffectDescriptor,
    pub semantics: Semantics,
}

/// A wordcode instruction: one operand byte, no caches, sequential flow, opaque semantics.
pub const fn op(code: u8, mnemonic: &'static str, effect: StackEffectDescriptor) -> OpcodeInfo {
    OpcodeInfo {
        code,
        mnemonic,
        operand_bytes: 1,
        cache_entries: 0,
        flow: FlowKind::Sequential,
        jump: None,
        effect,
        semantics: Semantics::Opaque,
    }
}

impl OpcodeInfo {
    pub const fn means(mut self, semantics: Semantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub const fn with_caches(mut self, count: u8) -> Self {
        self.cache_entries = count;
        self
    }

    pub const fn with_operand_bytes(mut self, count: u8) -> Self {
        self.operand_bytes = count;
        self
    }

    pub const fn calls(mut self) -> Self {
        self.flow = FlowKind::Call;
        self
    }

    pub const fn branches(mut self, addressing: JumpAddressing) -> Self {
        self.flow = FlowKind::Branch;
        self.jump = Some(addressing);
        self
    }

    pub const fn jumps(mut self, addressing: JumpAddressing) -> Self {
        self.flow = FlowKind::Jump;
        self.jump = Some(addressing);
        self
    }

    pub const fn returns(mut self) -> Self {
        self.flow = FlowKind::Return;
        self
    }

    pub const fn raises(mut self) -> Self {
        self.flow = FlowKind::Raise;
        self
    }

    pub const fn sets_up_handler(mut self, addressing: JumpAddressing) -> Self {
        self.flow = FlowKind::SetupHandler;
        self.jump = Some(addressing);
        self
    }

    pub fn stack_effect(&self, oparg: u32, jump: bool) -> Option<StackEffect> {
        self.effect.effect(oparg, jump)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    DuplicateOpcode {
        code: u8,
        first: &'static str,
        second: &'static str,
    },
    DuplicateMnemonic(&'static str),
    /// A jump, branch or handler setup without an addressing mode
    MissingAddressing(&'static str),
    /// An addressing mode on an instruction that does not jump
    UnexpectedAddressing(&'static str),
    UnknownExtendedArg(u8),
    ZeroUnit,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::DuplicateOpcode {
                code,
                first,
                second,
            } => write!(f, "opcode {code} is both {first} and {second}"),
            TableError::DuplicateMnemonic(name) => write!(f, "mnemonic {name} used twice"),
            TableError::MissingAddressing(name) => {
                write!(f, "{name} transfers control but has no jump addressing")
            }
            TableError::UnexpectedAddressing(name) => {
                write!(f, "{name} has jump addressing but does not jump")
            }
            TableError::UnknownExtendedArg(code) => {
                write!(f, "extended argument opcode {code} is not in the table")
            }
            TableError::ZeroUnit => write!(f, "jump and code units must be non zero"),
        }
    }
}

impl std::error::Error for TableError {}

/// The instruction set of one interpreter release. Immutable once built.
#[derive(Debug, Clone)]
pub struct OpcodeTable {
    version: PyVersion,
    marshal: MarshalFormat,
    jump_unit: u32,
    code_unit: u32,
    extended_arg: Option<u8>,
    entries: Vec<Option<OpcodeInfo>>,
    mnemonics: IndexMap<&'static str, u8>,
}

/// Collects the table wide settings before the opcodes are validated.
#[derive(Debug, Clone)]
pub struct TableBuilder {
    version: PyVersion,
    marshal: MarshalFormat,
    jump_unit: u32,
    code_unit: u32,
    extended_arg: Option<u8>,
}

impl TableBuilder {
    /// Bytes per unit of a jump operand
    pub fn jump_unit(mut self, bytes: u32) -> Self {
        self.jump_unit = bytes;
        self
    }

    /// Bytes per code unit, the unit of exception table offsets and inline caches
    pub fn code_unit(mut self, bytes: u32) -> Self {
        self.code_unit = bytes;
        self
    }

    pub fn extended_arg(mut self, code: u8) -> Self {
        self.extended_arg = Some(code);
        self
    }

    pub fn build(self, opcodes: Vec<OpcodeInfo>) -> Result<OpcodeTable, TableError> {
        if self.jump_unit == 0 || self.code_unit == 0 {
            return Err(TableError::ZeroUnit);
        }

        let mut entries: Vec<Option<OpcodeInfo>> = vec![None; 256];
        let mut mnemonics = IndexMap::with_capacity(opcodes.len());

        for info in opcodes {
            match (info.flow.has_target(), info.jump) {
                (true, None) => return Err(TableError::MissingAddressing(info.mnemonic)),
                (false, Some(_)) => return Err(TableError::UnexpectedAddressing(info.mnemonic)),
                _ => {}
            }

            if let Some(existing) = &entries[info.code as usize] {
                return Err(TableError::DuplicateOpcode {
                    code: info.code,
                    first: existing.mnemonic,
                    second: info.mnemonic,
                });
            }

            if mnemonics.insert(info.mnemonic, info.code).is_some() {
                return Err(TableError::DuplicateMnemonic(info.mnemonic));
            }

            entries[info.code as usize] = Some(info);
        }

        if let Some(code) = self.extended_arg {
            if entries[code as usize].is_none() {
                return Err(TableError::UnknownExtendedArg(code));
            }
        }

        Ok(OpcodeTable {
            version: self.version,
            marshal: self.marshal,
            jump_unit: self.jump_unit,
            code_unit: self.code_unit,
            extended_arg: self.extended_arg,
            entries,
            mnemonics,
        })
    }
}

impl OpcodeTable {
    /// Starts a wordcode table: jumps and code units are two bytes and there is no extended argument opcode
    /// until one is declared.
    pub fn builder(version: PyVersion, marshal: MarshalFormat) -> TableBuilder {
        TableBuilder {
            version,
            marshal,
            jump_unit: 2,
            code_unit: 2,
            extended_arg: None,
        }
    }

    pub fn version(&self) -> PyVersion {
        self.version
    }

    pub fn marshal_format(&self) -> &MarshalFormat {
        &self.marshal
    }

    pub fn jump_unit(&self) -> u32 {
        self.jump_unit
    }

    pub fn code_unit(&self) -> u32 {
        self.code_unit
    }

    pub fn extended_arg(&self) -> Option<u8> {
        self.extended_arg
    }

    pub fn is_extended_arg(&self, code: u8) -> bool {
        self.extended_arg == Some(code)
    }

    pub fn get(&self, code: u8) -> Option<&OpcodeInfo> {
        self.entries[code as usize].as_ref()
    }

    pub fn by_mnemonic(&self, mnemonic: &str) -> Option<&OpcodeInfo> {
        self.mnemonics.get(mnemonic).and_then(|code| self.get(*code))
    }

    /// Opcodes in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &OpcodeInfo> {
        self.mnemonics.values().filter_map(|code| self.get(*code))
    }

    pub fn len(&self) -> usize {
        self.mnemonics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mnemonics.is_empty()
    }

    /// Encoded size of an instruction, operand and inline caches included
    pub fn instruction_len(&self, info: &OpcodeInfo) -> usize {
        1 + info.operand_bytes as usize + info.cache_entries as usize * self.code_unit as usize
    }

    /// `None` for opcodes outside the table and for operands whose effect overflows
    pub fn stack_effect(&self, instruction: &DecodedInstruction, jump: bool) -> Option<StackEffect> {
        self.get(instruction.opcode)?
            .stack_effect(instruction.arg, jump)
    }

    /// Byte offset the instruction jumps to. `None` for instructions that do not jump. The offset can lie
    /// outside of the code, that is for the caller to check.
    pub fn jump_target(&self, instruction: &DecodedInstruction) -> Option<i64> {
        let addressing = self.get(instruction.opcode)?.jump?;

        let delta = i64::from(instruction.arg) * i64::from(self.jump_unit);
        let end = instruction.end() as i64;

        Some(match addressing {
            JumpAddressing::Absolute => delta,
            JumpAddressing::Forward => end + delta,
            JumpAddressing::Backward => end - delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn builder() -> TableBuilder {
        OpcodeTable::builder(PyVersion::new(3, 99), MarshalFormat::V311)
    }

    #[test]
    fn rejects_duplicate_codes() {
        let result = builder().build(vec![
            op(1, "POP_TOP", fixed(1, 0)),
            op(1, "ALSO_POP_TOP", fixed(1, 0)),
        ]);

        assert_eq!(
            result.unwrap_err(),
            TableError::DuplicateOpcode {
                code: 1,
                first: "POP_TOP",
                second: "ALSO_POP_TOP"
            }
        );
    }

    #[test]
    fn rejects_duplicate_mnemonics() {
        let result = builder().build(vec![
            op(1, "POP_TOP", fixed(1, 0)),
            op(2, "POP_TOP", fixed(1, 0)),
        ]);

        assert_eq!(result.unwrap_err(), TableError::DuplicateMnemonic("POP_TOP"));
    }

    #[test]
    fn jumps_need_addressing() {
        let mut jump = op(3, "JUMP", fixed(0, 0));
        jump.flow = FlowKind::Jump;

        assert_eq!(
            builder().build(vec![jump]).unwrap_err(),
            TableError::MissingAddressing("JUMP")
        );

        let mut load = op(4, "LOAD", fixed(0, 1));
        load.jump = Some(JumpAddressing::Absolute);

        assert_eq!(
            builder().build(vec![load]).unwrap_err(),
            TableError::UnexpectedAddressing("LOAD")
        );
    }

    #[test]
    fn extended_arg_must_exist() {
        assert_eq!(
            builder()
                .extended_arg(144)
                .build(vec![op(1, "POP_TOP", fixed(1, 0))])
                .unwrap_err(),
            TableError::UnknownExtendedArg(144)
        );
    }

    #[test]
    fn lookups_and_lengths() {
        let table = builder()
            .build(vec![
                op(1, "POP_TOP", fixed(1, 0)),
                op(2, "LOAD_ATTR", fixed(1, 1)).with_caches(9),
                op(3, "BUILD_TUPLE", computed(|oparg, _| Some(StackEffect::new(oparg, 1)))),
            ])
            .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.by_mnemonic("LOAD_ATTR").unwrap().code, 2);
        assert_eq!(table.instruction_len(table.get(2).unwrap()), 20);
        assert_eq!(
            table.get(3).unwrap().stack_effect(4, false),
            Some(StackEffect::new(4, 1))
        );
        assert_eq!(table.get(1).unwrap().flow, FlowKind::Sequential);
        assert_eq!(table.get(1).unwrap().semantics, Semantics::Opaque);
        assert!(table.get(200).is_none());
        assert_eq!(
            table.iter().map(|i| i.mnemonic).collect::<Vec<_>>(),
            vec!["POP_TOP", "LOAD_ATTR", "BUILD_TUPLE"]
        );
    }
}
