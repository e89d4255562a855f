//! Stack IR: every reachable block rewritten as statements over symbolic expressions.
//!
//! The lifter replays each block on a stack of [`Expr`] values instead of a depth counter. How many
//! values an instruction takes and leaves always comes from its stack effect, and what it computes
//! comes from the [`Semantics`] column of the opcode table. An instruction whose semantics cannot
//! account for its effect is kept as an [`Statement::Apply`], and its results are referred to by
//! position, so the lifted stack never disagrees with the depth walk.

use std::fmt;

use log::{trace, warn};

use crate::{
    cfg::{effect_of, AnalysisOptions, ControlFlowGraph},
    error::AnalysisError,
    instructions::{DecodedInstruction, Instructions},
    opcodes::{FlowKind, OpcodeTable},
    semantics::{
        BinaryOp, CallShape, Coercion, Container, NullSlot, Operator, PlaceKind, Semantics, Test,
        UnaryOp, COMPARISONS,
    },
    value::CodeObject,
};

/// Deepest stack the lifter materializes, counting incoming values and operands padded in after an
/// unchecked underflow
pub const LIFT_DEPTH_LIMIT: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Place {
    pub kind: PlaceKind,
    pub index: u32,
}

impl Place {
    pub fn new(kind: PlaceKind, index: u32) -> Self {
        Place { kind, index }
    }

    /// Source name of the place in `code`, when the index is in range
    pub fn name<'a>(&self, code: &'a CodeObject) -> Option<&'a str> {
        let index = self.index as usize;

        match self.kind {
            PlaceKind::Fast | PlaceKind::Deref => {
                code.localsplusnames.get(index).map(String::as_str)
            }
            PlaceKind::Cell => code.cellvars().into_iter().chain(code.freevars()).nth(index),
            PlaceKind::Global | PlaceKind::Name => code.names.get(index).map(String::as_str),
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = match self.kind {
            PlaceKind::Fast => "fast",
            PlaceKind::Deref => "deref",
            PlaceKind::Cell => "cell",
            PlaceKind::Global => "global",
            PlaceKind::Name => "name",
        };

        write!(f, "{table}[{}]", self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Value on the stack when the block is entered, counted from the bottom
    Incoming(u32),
    /// Operand missing from a stack that underflowed with the underflow check off
    Unknown,
    Null,
    Const(u32),
    SmallInt(u32),
    Load(Place),
    Attribute {
        object: Box<Expr>,
        name: u32,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary {
        op: Operator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Coerce(Coercion, Box<Expr>),
    Build {
        container: Container,
        items: Vec<Expr>,
    },
    Call {
        callee: Box<Expr>,
        /// Bound `self` of a method call
        receiver: Option<Box<Expr>>,
        args: Vec<Expr>,
        kw_names: Option<Box<Expr>>,
    },
    MakeFunction {
        code: Box<Expr>,
        /// Defaults, annotations and closure, in the order they were attached
        attributes: Vec<Expr>,
    },
    /// Next item of an iterator
    Next(Box<Expr>),
    /// Result `index` of the unmodelled instruction at `offset`
    Output {
        offset: usize,
        index: u32,
    },
}

impl Expr {
    fn binary(op: Operator, lhs: &Expr, rhs: &Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs.clone()),
            rhs: Box::new(rhs.clone()),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }

    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Incoming(i) => write!(f, "$in{i}"),
            Expr::Unknown => f.write_str("?"),
            Expr::Null => f.write_str("NULL"),
            Expr::Const(i) => write!(f, "consts[{i}]"),
            Expr::SmallInt(value) => write!(f, "{value}"),
            Expr::Load(place) => write!(f, "{place}"),
            Expr::Attribute { object, name } => write!(f, "{object}.names[{name}]"),
            Expr::Unary(op, operand) => write!(f, "{}{operand}", op.symbol()),
            Expr::Binary { op, lhs, rhs } if op.op == BinaryOp::Subscript => {
                write!(f, "{lhs}[{rhs}]")
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
            Expr::Coerce(coercion, value) => write!(f, "{}({value})", coercion.name()),
            Expr::Build { container, items } => {
                let (open, close) = match container {
                    Container::Tuple => ("(", ")"),
                    Container::List => ("[", "]"),
                    Container::Set | Container::Map => ("{", "}"),
                    Container::String => ("str(", ")"),
                    Container::Slice => ("slice(", ")"),
                };

                f.write_str(open)?;
                if *container == Container::Map {
                    for (i, pair) in items.chunks(2).enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}: {}", pair[0], pair[pair.len() - 1])?;
                    }
                } else {
                    write_list(f, items)?;
                }
                f.write_str(close)
            }
            Expr::Call {
                callee,
                receiver,
                args,
                kw_names,
            } => {
                match receiver {
                    Some(receiver) => write!(f, "{callee}<{receiver}>(")?,
                    None => write!(f, "{callee}(")?,
                }
                write_list(f, args)?;
                if let Some(kw_names) = kw_names {
                    write!(f, "; kw={kw_names}")?;
                }
                f.write_str(")")
            }
            Expr::MakeFunction { code, attributes } => {
                write!(f, "function({code}")?;
                for attribute in attributes {
                    write!(f, ", {attribute}")?;
                }
                f.write_str(")")
            }
            Expr::Next(iterator) => write!(f, "next({iterator})"),
            Expr::Output { offset, index } => write!(f, "@{offset}.{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Value computed and dropped
    Discard(Expr),
    Store { place: Place, value: Expr },
    /// Instruction without a model, with the operands it consumed
    Apply {
        offset: usize,
        mnemonic: &'static str,
        arg: u32,
        operands: Vec<Expr>,
        outputs: u32,
    },
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Discard(value) => write!(f, "{value}"),
            Statement::Store { place, value } => write!(f, "{place} = {value}"),
            Statement::Apply {
                offset,
                mnemonic,
                arg,
                operands,
                outputs,
            } => {
                if *outputs > 0 {
                    write!(f, "@{offset} = ")?;
                }
                write!(f, "{mnemonic} {arg} (")?;
                write_list(f, operands)?;
                f.write_str(")")
            }
        }
    }
}

/// How a block hands over control. Successors are the block's edges in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Falls through or jumps
    Next,
    /// The conditional edge is taken when `test` holds for `value`
    Branch { test: Test, value: Expr },
    Return(Expr),
    Raise,
    /// Conditional or returning terminator recorded as an [`Statement::Apply`]
    Opaque,
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Next => f.write_str("next"),
            Exit::Branch { test, value } => match test {
                Test::IfTrue => write!(f, "branch if {value}"),
                Test::IfFalse => write!(f, "branch if not {value}"),
                Test::IfNone => write!(f, "branch if {value} is None"),
                Test::IfNotNone => write!(f, "branch if {value} is not None"),
                Test::Exhausted => write!(f, "branch if {value} is exhausted"),
            },
            Exit::Return(value) => write!(f, "return {value}"),
            Exit::Raise => f.write_str("raise"),
            Exit::Opaque => f.write_str("opaque exit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SirBlock {
    pub statements: Vec<Statement>,
    pub exit: Exit,
    /// Values left for the fall through successor, bottom first
    pub stack: Vec<Expr>,
}

impl fmt::Display for SirBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for statement in &self.statements {
            writeln!(f, "{statement}")?;
        }
        write!(f, "{}", self.exit)
    }
}

/// Lifted blocks, indexed like [`ControlFlowGraph::blocks`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sir {
    /// `None` for blocks the depth walk never reached
    pub blocks: Vec<Option<SirBlock>>,
}

impl Sir {
    pub fn block(&self, index: usize) -> Option<&SirBlock> {
        self.blocks.get(index).and_then(Option::as_ref)
    }

    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.blocks.iter().flatten().flat_map(|block| &block.statements)
    }
}

fn within_limit(depth: u32) -> Result<usize, AnalysisError> {
    if depth > LIFT_DEPTH_LIMIT {
        return Err(AnalysisError::StackTooDeep {
            depth,
            limit: LIFT_DEPTH_LIMIT,
        });
    }

    Ok(depth as usize)
}

/// What one instruction leaves behind
#[derive(Debug, Default)]
struct Step {
    statements: Vec<Statement>,
    outputs: Vec<Expr>,
    exit: Option<Exit>,
}

impl Step {
    fn push(value: Expr) -> Option<Step> {
        Some(Step {
            outputs: vec![value],
            ..Default::default()
        })
    }

    fn outputs(outputs: Vec<Expr>) -> Option<Step> {
        Some(Step {
            outputs,
            ..Default::default()
        })
    }

    fn statement(statement: Statement) -> Option<Step> {
        Some(Step {
            statements: vec![statement],
            ..Default::default()
        })
    }

    fn exit(exit: Exit) -> Option<Step> {
        Some(Step {
            exit: Some(exit),
            ..Default::default()
        })
    }

    fn opaque(instruction: &DecodedInstruction, operands: Vec<Expr>, pushes: u32) -> Step {
        let offset = instruction.offset;

        Step {
            statements: vec![Statement::Apply {
                offset,
                mnemonic: instruction.mnemonic,
                arg: instruction.arg,
                operands,
                outputs: pushes,
            }],
            outputs: (0..pushes).map(|index| Expr::Output { offset, index }).collect(),
            exit: None,
        }
    }
}

fn fallback_exit(flow: FlowKind) -> Exit {
    match flow {
        FlowKind::Branch | FlowKind::Return => Exit::Opaque,
        FlowKind::Raise => Exit::Raise,
        _ => Exit::Next,
    }
}

struct Lifter<'a> {
    table: &'a OpcodeTable,
    check_underflow: bool,
    stack: Vec<Expr>,
    statements: Vec<Statement>,
    /// Set by `KW_NAMES`, consumed by the next call
    kw_names: Option<Expr>,
}

impl<'a> Lifter<'a> {
    fn new(table: &'a OpcodeTable, check_underflow: bool, depth: u32) -> Self {
        Lifter {
            table,
            check_underflow,
            stack: (0..depth).map(Expr::Incoming).collect(),
            statements: vec![],
            kw_names: None,
        }
    }

    fn flow(&self, instruction: &DecodedInstruction) -> FlowKind {
        self.table
            .get(instruction.opcode)
            .map_or(FlowKind::Sequential, |info| info.flow)
    }

    fn run(mut self, instructions: &[DecodedInstruction]) -> Result<SirBlock, AnalysisError> {
        let Some((terminator, body)) = instructions.split_last() else {
            return Ok(SirBlock {
                statements: vec![],
                exit: Exit::Next,
                stack: self.stack,
            });
        };

        for instruction in body {
            let jump = self.flow(instruction) == FlowKind::Jump;
            self.step(instruction, jump)?;
        }

        let exit = match self.step(terminator, false)? {
            Some(exit) => exit,
            None => fallback_exit(self.flow(terminator)),
        };

        Ok(SirBlock {
            statements: self.statements,
            exit,
            stack: self.stack,
        })
    }

    fn pop(
        &mut self,
        count: u32,
        instruction: &DecodedInstruction,
    ) -> Result<Vec<Expr>, AnalysisError> {
        let wanted = count as usize;

        if wanted > self.stack.len() {
            if self.check_underflow {
                return Err(AnalysisError::StackUnderflow {
                    offset: instruction.offset,
                    depth: self.stack.len() as u32,
                    pops: count,
                });
            }

            let mut padded = vec![Expr::Unknown; within_limit(count)? - self.stack.len()];
            padded.append(&mut self.stack);
            self.stack = padded;
        }

        Ok(self.stack.split_off(self.stack.len() - wanted))
    }

    fn step(
        &mut self,
        instruction: &DecodedInstruction,
        jump: bool,
    ) -> Result<Option<Exit>, AnalysisError> {
        let effect = effect_of(self.table, instruction, jump)?;
        let operands = self.pop(effect.pops, instruction)?;
        let semantics = self
            .table
            .get(instruction.opcode)
            .map_or(Semantics::Opaque, |info| info.semantics);

        let step = match self.interpret(semantics, instruction.arg, &operands) {
            Some(step) if step.outputs.len() == effect.pushes as usize => step,
            Some(step) => {
                warn!(
                    "{} at offset {} lifted to {} values instead of {}",
                    instruction.mnemonic,
                    instruction.offset,
                    step.outputs.len(),
                    effect.pushes
                );
                Step::opaque(instruction, operands, effect.pushes)
            }
            None => Step::opaque(instruction, operands, effect.pushes),
        };

        self.statements.extend(step.statements);
        self.stack.extend(step.outputs);

        Ok(step.exit)
    }

    fn interpret(&mut self, semantics: Semantics, arg: u32, operands: &[Expr]) -> Option<Step> {
        match semantics {
            Semantics::Opaque => None,
            Semantics::Nop => Some(Step::default()),
            Semantics::LoadConst => Step::push(Expr::Const(arg)),
            Semantics::LoadSmallInt => Step::push(Expr::SmallInt(arg)),
            Semantics::PushNull => Step::push(Expr::Null),
            Semantics::Load(kind) => Step::push(Expr::Load(Place::new(kind, arg))),
            Semantics::LoadGlobal(slot) => {
                let (index, null) = match slot {
                    NullSlot::Never => (arg, false),
                    _ => (arg >> 1, arg & 1 == 1),
                };
                let global = Expr::Load(Place::new(PlaceKind::Global, index));

                Step::outputs(match (slot, null) {
                    (NullSlot::Before, true) => vec![Expr::Null, global],
                    (NullSlot::After, true) => vec![global, Expr::Null],
                    _ => vec![global],
                })
            }
            Semantics::LoadFastPair => Step::outputs(vec![
                Expr::Load(Place::new(PlaceKind::Fast, arg >> 4)),
                Expr::Load(Place::new(PlaceKind::Fast, arg & 15)),
            ]),
            Semantics::Store(kind) => {
                let [value] = operands else { return None };

                Step::statement(Statement::Store {
                    place: Place::new(kind, arg),
                    value: value.clone(),
                })
            }
            Semantics::StoreFastPair => {
                let [second, top] = operands else { return None };

                Some(Step {
                    statements: vec![
                        Statement::Store {
                            place: Place::new(PlaceKind::Fast, arg >> 4),
                            value: top.clone(),
                        },
                        Statement::Store {
                            place: Place::new(PlaceKind::Fast, arg & 15),
                            value: second.clone(),
                        },
                    ],
                    ..Default::default()
                })
            }
            Semantics::StoreFastLoadFast => {
                let [value] = operands else { return None };

                Some(Step {
                    statements: vec![Statement::Store {
                        place: Place::new(PlaceKind::Fast, arg >> 4),
                        value: value.clone(),
                    }],
                    outputs: vec![Expr::Load(Place::new(PlaceKind::Fast, arg & 15))],
                    exit: None,
                })
            }
            Semantics::LoadAttr { method_bit } => {
                let [object] = operands else { return None };
                let (name, method) = match method_bit {
                    true => (arg >> 1, arg & 1 == 1),
                    false => (arg, false),
                };
                let attribute = Expr::Attribute {
                    object: Box::new(object.clone()),
                    name,
                };

                Step::outputs(match method {
                    true => vec![attribute, object.clone()],
                    false => vec![attribute],
                })
            }
            Semantics::LoadMethod => {
                let [object] = operands else { return None };

                Step::outputs(vec![
                    Expr::Attribute {
                        object: Box::new(object.clone()),
                        name: arg,
                    },
                    object.clone(),
                ])
            }
            Semantics::KwNames => {
                self.kw_names = Some(Expr::Const(arg));
                Some(Step::default())
            }
            Semantics::Pop => Some(Step {
                statements: operands.iter().cloned().map(Statement::Discard).collect(),
                ..Default::default()
            }),
            Semantics::Copy => {
                let (deepest, _) = operands.split_first()?;
                let mut outputs = operands.to_vec();
                outputs.push(deepest.clone());

                Step::outputs(outputs)
            }
            Semantics::Duplicate => Step::outputs([operands, operands].concat()),
            Semantics::Swap => {
                let mut outputs = operands.to_vec();
                let top = outputs.len().checked_sub(1)?;
                outputs.swap(0, top);

                Step::outputs(outputs)
            }
            Semantics::Rotate => {
                let mut outputs = operands.to_vec();
                outputs.rotate_right(1);

                Step::outputs(outputs)
            }
            Semantics::Unary(op) => {
                let [operand] = operands else { return None };

                Step::push(Expr::Unary(op, Box::new(operand.clone())))
            }
            Semantics::Binary(op) => binary(op, operands),
            Semantics::BinaryOperator(ops) => binary(*ops.get(arg as usize)?, operands),
            Semantics::Compare { shift, bool_bit } => {
                let op = *COMPARISONS.get(arg.checked_shr(u32::from(shift))? as usize)?;
                let [lhs, rhs] = operands else { return None };
                let comparison = Expr::binary(Operator::plain(op), lhs, rhs);

                Step::push(match bool_bit {
                    Some(bit) if arg & bit != 0 => {
                        Expr::Coerce(Coercion::Bool, Box::new(comparison))
                    }
                    _ => comparison,
                })
            }
            Semantics::Negatable { plain, negated } => {
                let op = match arg {
                    0 => plain,
                    1 => negated,
                    _ => return None,
                };

                binary(Operator::plain(op), operands)
            }
            Semantics::Coerce(coercion) => {
                let [value] = operands else { return None };

                Step::push(Expr::Coerce(coercion, Box::new(value.clone())))
            }
            Semantics::IterWithIndex => {
                let [value] = operands else { return None };

                Step::outputs(vec![
                    Expr::Coerce(Coercion::Iter, Box::new(value.clone())),
                    Expr::Null,
                ])
            }
            Semantics::Build(container) => {
                if container == Container::Map && operands.len() % 2 != 0 {
                    return None;
                }

                Step::push(Expr::Build {
                    container,
                    items: operands.to_vec(),
                })
            }
            Semantics::Call(shape) => self.call(shape, operands),
            Semantics::MakeFunction { qualname } => {
                let code = operands.len().checked_sub(1 + usize::from(qualname))?;

                Step::push(Expr::MakeFunction {
                    code: Box::new(operands[code].clone()),
                    attributes: operands[..code].to_vec(),
                })
            }
            Semantics::SetFunctionAttribute => {
                let [attribute, Expr::MakeFunction { code, attributes }] = operands else {
                    return None;
                };
                let mut attributes = attributes.clone();
                attributes.push(attribute.clone());

                Step::push(Expr::MakeFunction {
                    code: code.clone(),
                    attributes,
                })
            }
            Semantics::Return => {
                let [value] = operands else { return None };

                Step::exit(Exit::Return(value.clone()))
            }
            Semantics::ReturnConst => Step::exit(Exit::Return(Expr::Const(arg))),
            Semantics::Branch(test) => {
                let [value] = operands else { return None };

                Step::exit(Exit::Branch {
                    test,
                    value: value.clone(),
                })
            }
            Semantics::ForIter => {
                let (iterator, _) = operands.split_first()?;
                let mut outputs = operands.to_vec();
                outputs.push(Expr::Next(Box::new(iterator.clone())));

                Some(Step {
                    statements: vec![],
                    outputs,
                    exit: Some(Exit::Branch {
                        test: Test::Exhausted,
                        value: iterator.clone(),
                    }),
                })
            }
        }
    }

    fn call(&mut self, shape: CallShape, operands: &[Expr]) -> Option<Step> {
        let slots = usize::from(shape.callable_slots);
        if operands.len() < slots {
            return None;
        }
        let (callable, rest) = operands.split_at(slots);

        let (args, kw_names) = match shape.kw_names {
            true => {
                let (kw_names, args) = rest.split_last()?;
                (args, Some(kw_names.clone()))
            }
            false => (rest, self.kw_names.take()),
        };

        let (callee, receiver) = match callable {
            [callee] | [Expr::Null, callee] | [callee, Expr::Null] => (callee, None),
            [callee, receiver] => (callee, Some(receiver)),
            _ => return None,
        };

        Step::push(Expr::Call {
            callee: Box::new(callee.clone()),
            receiver: receiver.map(|receiver| Box::new(receiver.clone())),
            args: args.to_vec(),
            kw_names: kw_names.map(Box::new),
        })
    }
}

fn binary(op: Operator, operands: &[Expr]) -> Option<Step> {
    let [lhs, rhs] = operands else { return None };

    Step::push(Expr::binary(op, lhs, rhs))
}

/// Lifts every block the depth walk reached. `cfg` must come from [`crate::cfg::analyze`] over the
/// same instructions, table and options.
pub fn lift(
    instructions: &Instructions,
    table: &OpcodeTable,
    cfg: &ControlFlowGraph,
    options: &AnalysisOptions,
) -> Result<Sir, AnalysisError> {
    within_limit(cfg.max_stack_depth())?;

    let blocks = cfg
        .blocks
        .iter()
        .map(|block| {
            let Some(depth) = block.entry_depth else {
                return Ok(None);
            };
            let lifted = Lifter::new(table, options.check_stack_underflow, depth)
                .run(block.instructions(instructions))?;

            trace!(
                "Lifted block at offset {} into {} statements",
                block.start_offset,
                lifted.statements.len()
            );

            Ok(Some(lifted))
        })
        .collect::<Result<Vec<_>, AnalysisError>>()?;

    Ok(Sir { blocks })
}
