use std::collections::HashMap;

use crate::{
    error::Error,
    instructions::DecodedInstruction,
    opcodes::OpcodeTable,
    utils::ExceptionTableEntry,
    value::CodeObject,
};

/// Jump queries over a decoded instruction stream. Indexes are positions in the stream, not byte offsets.
pub trait InstructionAccess
where
    Self: AsRef<[DecodedInstruction]>,
{
    fn get_instructions(&self) -> &[DecodedInstruction] {
        self.as_ref()
    }

    /// Returns the index and the instruction of the jump target. None if the index is not a valid jump
    /// or the target is not the start of an instruction.
    fn get_jump_target(
        &self,
        index: usize,
        table: &OpcodeTable,
    ) -> Option<(usize, &DecodedInstruction)> {
        let instructions = self.get_instructions();
        let target = table.jump_target(instructions.get(index)?)?;

        let target = usize::try_from(target).ok()?;
        let target_index = instructions
            .binary_search_by_key(&target, |i| i.offset)
            .ok()?;

        Some((target_index, &instructions[target_index]))
    }

    /// Returns a list of all indexes that jump to the given index
    fn get_jump_xrefs(&self, index: usize, table: &OpcodeTable) -> Vec<usize> {
        (0..self.get_instructions().len())
            .filter(|i| matches!(self.get_jump_target(*i, table), Some((target, _)) if target == index))
            .collect()
    }

    /// Returns a hashmap of jump indexes and their jump target
    fn get_jump_map(&self, table: &OpcodeTable) -> HashMap<usize, usize> {
        (0..self.get_instructions().len())
            .filter_map(|i| self.get_jump_target(i, table).map(|(target, _)| (i, target)))
            .collect()
    }
}

impl<T> InstructionAccess for T where T: AsRef<[DecodedInstruction]> + ?Sized {}

/// Supplies the exception ranges of a code object. The raw exception table is opaque to this crate, callers
/// that want exception edges parse it themselves.
pub trait ExceptionTableProvider {
    fn exception_table(&self, code: &CodeObject) -> Result<Vec<ExceptionTableEntry>, Error>;
}

impl<F> ExceptionTableProvider for F
where
    F: Fn(&CodeObject) -> Result<Vec<ExceptionTableEntry>, Error>,
{
    fn exception_table(&self, code: &CodeObject) -> Result<Vec<ExceptionTableEntry>, Error> {
        self(code)
    }
}
