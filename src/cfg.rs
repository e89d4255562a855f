//! Control flow graph construction and stack depth tracking over decoded instructions.
//!
//! Blocks are contiguous ranges of the instruction stream in layout order. Everything an instruction
//! means (how it transfers control, what it does to the stack) comes from the [`OpcodeTable`].

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::{
    error::AnalysisError,
    instructions::{DecodedInstruction, Instructions},
    opcodes::{FlowKind, OpcodeTable},
    utils::{DepthError, ExceptionTableEntry, StackEffect},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    /// Fold a block into the next one when nothing else can reach it
    pub merge_straight_line: bool,
    /// Use the exception ranges passed to [`analyze`], if any
    pub exception_edges: bool,
    pub check_stack_underflow: bool,
    /// Lift every reachable block into expressions, see [`crate::sir`]
    pub lift_expressions: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            merge_straight_line: true,
            exception_edges: true,
            check_stack_underflow: true,
            lift_expressions: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Fallthrough,
    /// The branch is taken
    ConditionalTrue,
    /// The branch is not taken
    ConditionalFalse,
    Jump,
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    /// Block index
    pub target: usize,
    pub kind: EdgeKind,
    /// Stack depth the handler is entered with, set for edges that come from an exception table
    pub handler_depth: Option<u32>,
}

impl Edge {
    fn new(target: usize, kind: EdgeKind) -> Self {
        Edge {
            target,
            kind,
            handler_depth: None,
        }
    }

    /// Whether the terminator's stack effect is evaluated with the jump taken along this edge
    fn takes_jump(&self) -> bool {
        matches!(
            self.kind,
            EdgeKind::ConditionalTrue | EdgeKind::Jump | EdgeKind::Exception
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Index of the first instruction
    pub start: usize,
    /// Index one past the last instruction
    pub end: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    /// `None` when the block is unreachable from the entry
    pub entry_depth: Option<u32>,
    pub edges: Vec<Edge>,
}

impl Block {
    pub fn instructions<'a>(&self, instructions: &'a [DecodedInstruction]) -> &'a [DecodedInstruction] {
        &instructions[self.start..self.end]
    }

    pub fn terminator<'a>(&self, instructions: &'a [DecodedInstruction]) -> &'a DecodedInstruction {
        &instructions[self.end - 1]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_exit(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn has_exception_edges(&self) -> bool {
        self.edges.iter().any(|e| e.kind == EdgeKind::Exception)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlFlowGraph {
    /// Blocks in layout order
    pub blocks: Vec<Block>,
    /// `None` for an empty instruction stream
    pub entry: Option<usize>,
    max_depth: u32,
}

impl ControlFlowGraph {
    /// Blocks without successors
    pub fn exits(&self) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|b| self.blocks[*b].is_exit())
            .collect()
    }

    pub fn successors(&self, block: usize) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .get(block)
            .into_iter()
            .flat_map(|b| b.edges.iter().map(|e| e.target))
    }

    /// Blocks with at least one edge into `block`, in layout order
    pub fn predecessors(&self, block: usize) -> Vec<usize> {
        (0..self.blocks.len())
            .filter(|b| self.blocks[*b].edges.iter().any(|e| e.target == block))
            .collect()
    }

    /// Block containing the byte offset
    pub fn block_of_offset(&self, offset: usize) -> Option<usize> {
        let index = self
            .blocks
            .partition_point(|b| b.start_offset <= offset)
            .checked_sub(1)?;

        (offset < self.blocks[index].end_offset).then_some(index)
    }

    /// Deepest stack seen on any reachable path, comparable with the code object's `stacksize`
    pub fn max_stack_depth(&self) -> u32 {
        self.max_depth
    }

    /// Blocks reachable from the entry, in layout order
    pub fn reachable(&self) -> Vec<usize> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack: Vec<usize> = self.entry.into_iter().collect();

        while let Some(block) = stack.pop() {
            if std::mem::replace(&mut seen[block], true) {
                continue;
            }

            stack.extend(self.successors(block).filter(|b| !seen[*b]));
        }

        (0..self.blocks.len()).filter(|b| seen[*b]).collect()
    }
}

fn flow_of(table: &OpcodeTable, instruction: &DecodedInstruction) -> FlowKind {
    table
        .get(instruction.opcode)
        .map_or(FlowKind::Sequential, |info| info.flow)
}

/// Instruction index of the jump target of `instruction`
fn target_index(
    instructions: &Instructions,
    table: &OpcodeTable,
    instruction: &DecodedInstruction,
) -> Result<usize, AnalysisError> {
    let target = table
        .jump_target(instruction)
        .ok_or(AnalysisError::DanglingJumpTarget {
            offset: instruction.offset,
            target: -1,
        })?;

    usize::try_from(target)
        .ok()
        .and_then(|t| instructions.index_of_offset(t))
        .ok_or(AnalysisError::DanglingJumpTarget {
            offset: instruction.offset,
            target,
        })
}

/// An exception range resolved to instruction indexes
struct Handler {
    start: usize,
    end: usize,
    target: usize,
    depth: u32,
}

fn resolve_handlers(
    instructions: &Instructions,
    table: &OpcodeTable,
    entries: &[ExceptionTableEntry],
) -> Result<Vec<Handler>, AnalysisError> {
    let unit = table.code_unit() as usize;
    let mut handlers = Vec::with_capacity(entries.len());

    for entry in entries {
        let start_offset = entry.start as usize * unit;
        let end_offset = entry.end as usize * unit;
        let target_offset = entry.target as usize * unit;

        let start = instructions.partition_point(|i| i.offset < start_offset);
        let end = instructions.partition_point(|i| i.offset < end_offset);

        if start >= end {
            warn!(
                "Exception range {}..{} covers no instruction, ignoring it",
                start_offset, end_offset
            );
            continue;
        }

        let target = instructions.index_of_offset(target_offset).ok_or(
            AnalysisError::DanglingJumpTarget {
                offset: start_offset,
                target: target_offset as i64,
            },
        )?;

        handlers.push(Handler {
            start,
            end,
            target,
            depth: entry.handler_depth(),
        });
    }

    Ok(handlers)
}

/// Splits the stream at every leader and wires up the edges between the resulting blocks.
fn partition(
    instructions: &Instructions,
    table: &OpcodeTable,
    handlers: &[Handler],
) -> Result<Vec<Block>, AnalysisError> {
    let count = instructions.len();
    let mut leaders = vec![false; count];
    leaders[0] = true;

    for (index, instruction) in instructions.iter().enumerate() {
        let flow = flow_of(table, instruction);

        if flow.ends_block() && index + 1 < count {
            leaders[index + 1] = true;
        }

        if flow.has_target() {
            leaders[target_index(instructions, table, instruction)?] = true;
        }
    }

    for handler in handlers {
        leaders[handler.start] = true;
        leaders[handler.target] = true;

        if handler.end < count {
            leaders[handler.end] = true;
        }
    }

    // Maps instruction index to block index
    let mut block_map = Vec::with_capacity(count);
    let mut blocks: Vec<Block> = vec![];

    for (index, instruction) in instructions.iter().enumerate() {
        if leaders[index] {
            blocks.push(Block {
                start: index,
                end: index,
                start_offset: instruction.offset,
                end_offset: instruction.offset,
                entry_depth: None,
                edges: vec![],
            });
        }

        // The first instruction is always a leader
        if let Some(block) = blocks.last_mut() {
            block.end = index + 1;
            block.end_offset = instruction.end();
        }

        block_map.push(blocks.len() - 1);
    }

    for block in blocks.iter_mut() {
        let terminator = &instructions[block.end - 1];
        let flow = flow_of(table, terminator);
        let next = block_map.get(block.end).copied();

        if flow.falls_through() && next.is_none() {
            warn!(
                "{} at offset {} falls off the end of the code",
                terminator.mnemonic, terminator.offset
            );
        }

        match flow {
            FlowKind::Sequential | FlowKind::Call => {
                block.edges.extend(next.map(|n| Edge::new(n, EdgeKind::Fallthrough)));
            }
            FlowKind::Branch => {
                let target = block_map[target_index(instructions, table, terminator)?];
                block.edges.push(Edge::new(target, EdgeKind::ConditionalTrue));
                block.edges.extend(next.map(|n| Edge::new(n, EdgeKind::ConditionalFalse)));
            }
            FlowKind::Jump => {
                let target = block_map[target_index(instructions, table, terminator)?];
                block.edges.push(Edge::new(target, EdgeKind::Jump));
            }
            FlowKind::Return | FlowKind::Raise => {}
            FlowKind::SetupHandler => {
                let target = block_map[target_index(instructions, table, terminator)?];
                block.edges.extend(next.map(|n| Edge::new(n, EdgeKind::Fallthrough)));
                block.edges.push(Edge::new(target, EdgeKind::Exception));
            }
        }

        for handler in handlers {
            if (handler.start..handler.end).contains(&block.start) {
                block.edges.push(Edge {
                    target: block_map[handler.target],
                    kind: EdgeKind::Exception,
                    handler_depth: Some(handler.depth),
                });
            }
        }
    }

    Ok(blocks)
}

/// Folds every block into its layout predecessor when that predecessor only flows into it and nothing
/// else does. Edge targets are renumbered afterwards.
fn merge_straight_line(blocks: Vec<Block>) -> Vec<Block> {
    let mut incoming = vec![0usize; blocks.len()];
    for edge in blocks.iter().flat_map(|b| &b.edges) {
        incoming[edge.target] += 1;
    }

    let mut remap = Vec::with_capacity(blocks.len());
    let mut merged: Vec<Block> = Vec::with_capacity(blocks.len());

    for (index, block) in blocks.into_iter().enumerate() {
        if let Some(previous) = merged.last_mut() {
            let only_flows_here = matches!(
                previous.edges.as_slice(),
                [Edge { target, kind: EdgeKind::Fallthrough | EdgeKind::Jump, .. }] if *target == index
            );

            if only_flows_here && incoming[index] == 1 && !block.has_exception_edges() {
                trace!("Merging block at offset {} into its predecessor", block.start_offset);

                previous.end = block.end;
                previous.end_offset = block.end_offset;
                previous.edges = block.edges;
                remap.push(merged.len() - 1);
                continue;
            }
        }

        remap.push(merged.len());
        merged.push(block);
    }

    for edge in merged.iter_mut().flat_map(|b| b.edges.iter_mut()) {
        edge.target = remap[edge.target];
    }

    merged
}

/// Stack effect of an instruction. Opcodes outside the table leave the stack alone.
pub(crate) fn effect_of(
    table: &OpcodeTable,
    instruction: &DecodedInstruction,
    jump: bool,
) -> Result<StackEffect, AnalysisError> {
    match table.get(instruction.opcode) {
        Some(info) => info
            .stack_effect(instruction.arg, jump)
            .ok_or(AnalysisError::OperandOverflow {
                offset: instruction.offset,
                arg: instruction.arg,
            }),
        None => Ok(StackEffect::zero()),
    }
}

/// Depth after `effect`. Without the underflow check a short stack is treated as empty.
pub(crate) fn settle(
    effect: StackEffect,
    depth: u32,
    offset: usize,
    check_underflow: bool,
) -> Result<u32, AnalysisError> {
    let overflow = AnalysisError::DepthOverflow {
        offset,
        depth,
        pushes: effect.pushes,
    };

    match effect.apply(depth) {
        Ok(depth) => Ok(depth),
        Err(DepthError::Underflow) if check_underflow => Err(AnalysisError::StackUnderflow {
            offset,
            depth,
            pops: effect.pops,
        }),
        Err(DepthError::Underflow) => depth
            .saturating_sub(effect.pops)
            .checked_add(effect.pushes)
            .ok_or(overflow),
        Err(DepthError::Overflow) => Err(overflow),
    }
}

struct DepthWalk<'a> {
    instructions: &'a Instructions,
    table: &'a OpcodeTable,
    check_underflow: bool,
    max_depth: u32,
}

impl DepthWalk<'_> {
    fn apply(
        &mut self,
        instruction: &DecodedInstruction,
        depth: u32,
        jump: bool,
    ) -> Result<u32, AnalysisError> {
        let effect = effect_of(self.table, instruction, jump)?;
        let depth = settle(effect, depth, instruction.offset, self.check_underflow)?;

        self.max_depth = self.max_depth.max(depth);
        Ok(depth)
    }

    /// Propagates entry depths from the entry block along every edge
    fn run(&mut self, blocks: &mut [Block]) -> Result<(), AnalysisError> {
        let mut queue = VecDeque::from([0]);
        blocks[0].entry_depth = Some(0);

        let instructions = self.instructions;
        let table = self.table;

        while let Some(index) = queue.pop_front() {
            let block = &blocks[index];
            let Some(mut depth) = block.entry_depth else {
                continue;
            };

            // Unconditional jumps can only be left by jumping
            for instruction in &instructions[block.start..block.end - 1] {
                let jump = flow_of(table, instruction) == FlowKind::Jump;
                depth = self.apply(instruction, depth, jump)?;
            }

            let terminator = &instructions[block.end - 1];
            let edges = block.edges.clone();
            let not_taken = self.apply(terminator, depth, false)?;

            for edge in edges {
                let found = match edge.handler_depth {
                    Some(handler_depth) => handler_depth,
                    None if edge.takes_jump() => self.apply(terminator, depth, true)?,
                    None => not_taken,
                };

                let target = &mut blocks[edge.target];
                match target.entry_depth {
                    Some(expected) if expected != found => {
                        return Err(AnalysisError::InconsistentStackDepth {
                            block: edge.target,
                            offset: target.start_offset,
                            expected,
                            found,
                        });
                    }
                    Some(_) => {}
                    None => {
                        target.entry_depth = Some(found);
                        queue.push_back(edge.target);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Builds the control flow graph of one code object and annotates every reachable block with the stack
/// depth it is entered with.
///
/// `exceptions` are the code object's exception ranges, in code units. They add an edge from each block
/// starting inside a range to the range's handler.
pub fn analyze(
    instructions: &Instructions,
    table: &OpcodeTable,
    exceptions: Option<&[ExceptionTableEntry]>,
    options: &AnalysisOptions,
) -> Result<ControlFlowGraph, AnalysisError> {
    if instructions.is_empty() {
        return Ok(ControlFlowGraph::default());
    }

    let handlers = match exceptions {
        Some(entries) if options.exception_edges => {
            resolve_handlers(instructions, table, entries)?
        }
        _ => vec![],
    };

    let mut blocks = partition(instructions, table, &handlers)?;
    let partitioned = blocks.len();

    if options.merge_straight_line {
        blocks = merge_straight_line(blocks);
    }

    let mut walk = DepthWalk {
        instructions,
        table,
        check_underflow: options.check_stack_underflow,
        max_depth: 0,
    };
    walk.run(&mut blocks)?;

    debug!(
        "Built {} blocks ({} before merging) from {} instructions, max stack depth {}",
        blocks.len(),
        partitioned,
        instructions.len(),
        walk.max_depth
    );

    Ok(ControlFlowGraph {
        blocks,
        entry: Some(0),
        max_depth: walk.max_depth,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{instructions::decode_stream, v310, v312};

    fn build(
        code: &[u8],
        exceptions: Option<&[ExceptionTableEntry]>,
        options: &AnalysisOptions,
    ) -> Result<ControlFlowGraph, AnalysisError> {
        let table = v312::opcodes::table().unwrap();
        let instructions = decode_stream(code, &table).unwrap();

        analyze(&instructions, &table, exceptions, options)
    }

    fn edges(cfg: &ControlFlowGraph, block: usize) -> Vec<(usize, EdgeKind)> {
        cfg.blocks[block]
            .edges
            .iter()
            .map(|e| (e.target, e.kind))
            .collect()
    }

    // 0 LOAD_CONST, 2 LOAD_CONST, 4 COMPARE_OP, 8 POP_JUMP_IF_FALSE -> 14, 10 JUMP_FORWARD -> 12,
    // 12 RETURN_CONST, 14 RETURN_CONST
    const COMPARE_AND_RETURN: [u8; 16] = [
        100, 0, 100, 1, 107, 0, 0, 0, 114, 2, 110, 0, 121, 0, 121, 1,
    ];

    #[test]
    fn compare_and_return() {
        let cfg = build(&COMPARE_AND_RETURN, None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.entry, Some(0));
        assert_eq!(cfg.exits(), vec![1, 2]);
        assert_eq!(
            edges(&cfg, 0),
            vec![(2, EdgeKind::ConditionalTrue), (1, EdgeKind::ConditionalFalse)]
        );

        // The unconditional jump stays inside the merged block
        assert_eq!((cfg.blocks[1].start, cfg.blocks[1].end), (4, 6));
        assert_eq!(
            cfg.blocks.iter().map(|b| b.entry_depth).collect::<Vec<_>>(),
            vec![Some(0), Some(0), Some(0)]
        );
        assert_eq!(cfg.max_stack_depth(), 2);
    }

    #[test]
    fn unmerged_blocks() {
        let options = AnalysisOptions {
            merge_straight_line: false,
            ..Default::default()
        };
        let cfg = build(&COMPARE_AND_RETURN, None, &options).unwrap();

        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(edges(&cfg, 1), vec![(2, EdgeKind::Jump)]);
        assert_eq!(cfg.exits(), vec![2, 3]);
    }

    #[test]
    fn block_lookup_by_offset() {
        let cfg = build(&COMPARE_AND_RETURN, None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.block_of_offset(0), Some(0));
        assert_eq!(cfg.block_of_offset(9), Some(0));
        assert_eq!(cfg.block_of_offset(12), Some(1));
        assert_eq!(cfg.block_of_offset(14), Some(2));
        assert_eq!(cfg.block_of_offset(16), None);
        assert_eq!(cfg.predecessors(2), vec![0]);
        assert_eq!(cfg.successors(0).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn diamond_with_unbalanced_arms() {
        // 0 LOAD_CONST, 2 POP_JUMP_IF_FALSE -> 8, 4 LOAD_CONST, 6 JUMP_FORWARD -> 10, 8 NOP, 10 RETURN_VALUE
        let code = [100, 0, 114, 2, 100, 0, 110, 1, 9, 0, 83, 0];

        assert_eq!(
            build(&code, None, &AnalysisOptions::default()).unwrap_err(),
            AnalysisError::InconsistentStackDepth {
                block: 3,
                offset: 10,
                expected: 0,
                found: 1
            }
        );
    }

    #[test]
    fn dangling_jump_target() {
        let code = [110, 5];

        assert_eq!(
            build(&code, None, &AnalysisOptions::default()).unwrap_err(),
            AnalysisError::DanglingJumpTarget {
                offset: 0,
                target: 12
            }
        );

        // Into the inline cache of COMPARE_OP
        let code = [100, 0, 100, 0, 107, 0, 0, 0, 140, 2];

        assert_eq!(
            build(&code, None, &AnalysisOptions::default()).unwrap_err(),
            AnalysisError::DanglingJumpTarget {
                offset: 8,
                target: 6
            }
        );
    }

    #[test]
    fn for_loop() {
        // 0 LOAD_CONST, 2 GET_ITER, 4 FOR_ITER -> 12, 8 STORE_FAST, 10 JUMP_BACKWARD -> 4, 12 END_FOR,
        // 14 RETURN_CONST
        let code = [100, 0, 68, 0, 93, 2, 0, 0, 125, 0, 140, 4, 4, 0, 121, 0];
        let cfg = build(&code, None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(edges(&cfg, 0), vec![(1, EdgeKind::Fallthrough)]);
        assert_eq!(
            edges(&cfg, 1),
            vec![(3, EdgeKind::ConditionalTrue), (2, EdgeKind::ConditionalFalse)]
        );
        assert_eq!(edges(&cfg, 2), vec![(1, EdgeKind::Jump)]);
        assert_eq!(cfg.predecessors(1), vec![0, 2]);
        assert_eq!(
            cfg.blocks.iter().map(|b| b.entry_depth).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2), Some(2)]
        );
        assert_eq!(cfg.max_stack_depth(), 2);
        assert_eq!(cfg.exits(), vec![3]);
    }

    // 0 NOP, 2 LOAD_CONST, 4 RETURN_VALUE, handler: 6 PUSH_EXC_INFO, 8 POP_TOP, 10 POP_EXCEPT,
    // 12 RETURN_CONST
    const TRY_EXCEPT: [u8; 14] = [9, 0, 100, 0, 83, 0, 35, 0, 1, 0, 89, 0, 121, 0];

    const TRY_RANGE: ExceptionTableEntry = ExceptionTableEntry {
        start: 0,
        end: 3,
        target: 3,
        depth: 0,
        lasti: true,
    };

    #[test]
    fn exception_table_edges() {
        let cfg = build(&TRY_EXCEPT, Some(&[TRY_RANGE]), &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(
            cfg.blocks[0].edges,
            vec![Edge {
                target: 1,
                kind: EdgeKind::Exception,
                handler_depth: Some(2)
            }]
        );
        assert_eq!(cfg.blocks[1].entry_depth, Some(2));
        assert_eq!(cfg.max_stack_depth(), 3);
        assert_eq!(cfg.reachable(), vec![0, 1]);
    }

    #[test]
    fn exception_edges_can_be_disabled() {
        let options = AnalysisOptions {
            exception_edges: false,
            ..Default::default()
        };
        let cfg = build(&TRY_EXCEPT, Some(&[TRY_RANGE]), &options).unwrap();

        assert_eq!(cfg.blocks.len(), 2);
        assert!(cfg.blocks[0].is_exit());
        assert_eq!(cfg.blocks[1].entry_depth, None);
        assert_eq!(cfg.reachable(), vec![0]);
    }

    #[test]
    fn empty_exception_ranges_are_ignored() {
        let empty = ExceptionTableEntry {
            start: 2,
            end: 2,
            ..TRY_RANGE
        };
        let cfg = build(&TRY_EXCEPT, Some(&[empty]), &AnalysisOptions::default()).unwrap();

        assert!(cfg.blocks.iter().all(|b| !b.has_exception_edges()));
    }

    #[test]
    fn setup_finally_handler() {
        // 0 SETUP_FINALLY -> 8, 2 LOAD_CONST, 4 POP_BLOCK, 6 RETURN_VALUE, 8 RERAISE
        let table = v310::opcodes::table().unwrap();
        let instructions = decode_stream(&[122, 3, 100, 0, 87, 0, 83, 0, 119, 0], &table).unwrap();

        let cfg = analyze(&instructions, &table, None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(
            edges(&cfg, 0),
            vec![(1, EdgeKind::Fallthrough), (2, EdgeKind::Exception)]
        );
        assert_eq!(
            cfg.blocks.iter().map(|b| b.entry_depth).collect::<Vec<_>>(),
            vec![Some(0), Some(0), Some(6)]
        );
        assert_eq!(cfg.max_stack_depth(), 6);
    }

    #[test]
    fn stack_underflow() {
        let code = [1, 0, 121, 0];

        assert_eq!(
            build(&code, None, &AnalysisOptions::default()).unwrap_err(),
            AnalysisError::StackUnderflow {
                offset: 0,
                depth: 0,
                pops: 1
            }
        );

        let options = AnalysisOptions {
            check_stack_underflow: false,
            ..Default::default()
        };
        let cfg = build(&code, None, &options).unwrap();

        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.max_stack_depth(), 0);
    }

    #[test]
    fn operand_too_large_to_count() {
        // 0 EXTENDED_ARG x3, 6 BUILD_MAP 0xFFFFFFFF, 8 RETURN_VALUE
        let code = [144, 255, 144, 255, 144, 255, 105, 255, 83, 0];

        assert_eq!(
            build(&code, None, &AnalysisOptions::default()).unwrap_err(),
            AnalysisError::OperandOverflow {
                offset: 6,
                arg: u32::MAX
            }
        );
    }

    // 0 LOAD_CONST, 2 EXTENDED_ARG x3, 8 UNPACK_SEQUENCE 0xFFFFFFFF, 12 LOAD_CONST, 14 RETURN_VALUE
    const FULL_STACK: [u8; 16] = [100, 0, 144, 255, 144, 255, 144, 255, 92, 255, 0, 0, 100, 0, 83, 0];

    #[test]
    fn stack_depth_overflow() {
        let overflow = AnalysisError::DepthOverflow {
            offset: 12,
            depth: u32::MAX,
            pushes: 1,
        };

        assert_eq!(
            build(&FULL_STACK, None, &AnalysisOptions::default()).unwrap_err(),
            overflow
        );

        let options = AnalysisOptions {
            check_stack_underflow: false,
            ..Default::default()
        };
        assert_eq!(build(&FULL_STACK, None, &options).unwrap_err(), overflow);
    }

    #[test]
    fn overflow_after_unchecked_underflow() {
        // Without the first LOAD_CONST the unpack pops from an empty stack
        let code = &FULL_STACK[2..];

        assert_eq!(
            build(code, None, &AnalysisOptions::default()).unwrap_err(),
            AnalysisError::StackUnderflow {
                offset: 6,
                depth: 0,
                pops: 1
            }
        );

        let options = AnalysisOptions {
            check_stack_underflow: false,
            ..Default::default()
        };
        assert_eq!(
            build(code, None, &options).unwrap_err(),
            AnalysisError::DepthOverflow {
                offset: 10,
                depth: u32::MAX,
                pushes: 1
            }
        );
    }

    #[test]
    fn falling_off_the_end() {
        let cfg = build(&[100, 0], None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.exits(), vec![0]);
        assert_eq!(cfg.max_stack_depth(), 1);
    }

    #[test]
    fn empty_code() {
        let cfg = build(&[], None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.entry, None);
        assert!(cfg.blocks.is_empty());
        assert!(cfg.reachable().is_empty());
    }
}
