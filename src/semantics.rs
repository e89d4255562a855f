//! What an instruction computes, as opposed to how it moves the stack.
//!
//! Every [`crate::opcodes::OpcodeInfo`] carries one [`Semantics`] value. The expression lifter in
//! [`crate::sir`] reads it the same way the depth walk reads stack effects, so supporting a new
//! release means annotating its table and nothing else.

use std::fmt;

/// Where a load or store goes. The operand indexes the code object's name tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceKind {
    /// `localsplusnames[i]`
    Fast,
    /// Cell or free variable, `localsplusnames[i]`
    Deref,
    /// Cell or free variable counted from the first cell variable, used before locals and cells shared
    /// one index space
    Cell,
    /// `names[i]` looked up in the globals, then the builtins
    Global,
    /// `names[i]` looked up in the locals mapping, then the globals
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Positive => "+",
            UnaryOp::Negative => "-",
            UnaryOp::Not => "not ",
            UnaryOp::Invert => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    And,
    FloorDiv,
    LShift,
    MatMul,
    Mul,
    Remainder,
    Or,
    Power,
    RShift,
    Sub,
    Div,
    Xor,
    Subscript,
    Lt,
    LtEq,
    Eq,
    NotEq,
    Gt,
    GtEq,
    Is,
    IsNot,
    In,
    NotIn,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::And => "&",
            BinaryOp::FloorDiv => "//",
            BinaryOp::LShift => "<<",
            BinaryOp::MatMul => "@",
            BinaryOp::Mul => "*",
            BinaryOp::Remainder => "%",
            BinaryOp::Or => "|",
            BinaryOp::Power => "**",
            BinaryOp::RShift => ">>",
            BinaryOp::Sub => "-",
            BinaryOp::Div => "/",
            BinaryOp::Xor => "^",
            BinaryOp::Subscript => "[]",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Is => "is",
            BinaryOp::IsNot => "is not",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
        }
    }
}

/// A binary operator and whether it is the augmented assignment form (`+=` rather than `+`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operator {
    pub op: BinaryOp,
    pub inplace: bool,
}

impl Operator {
    pub const fn plain(op: BinaryOp) -> Self {
        Operator { op, inplace: false }
    }

    pub const fn inplace(op: BinaryOp) -> Self {
        Operator { op, inplace: true }
    }
}

pub const fn binary(op: BinaryOp) -> Semantics {
    Semantics::Binary(Operator::plain(op))
}

pub const fn inplace(op: BinaryOp) -> Semantics {
    Semantics::Binary(Operator::inplace(op))
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inplace {
            true => write!(f, "{}=", self.op.symbol()),
            false => f.write_str(self.op.symbol()),
        }
    }
}

const ARITHMETIC: [BinaryOp; 13] = [
    BinaryOp::Add,
    BinaryOp::And,
    BinaryOp::FloorDiv,
    BinaryOp::LShift,
    BinaryOp::MatMul,
    BinaryOp::Mul,
    BinaryOp::Remainder,
    BinaryOp::Or,
    BinaryOp::Power,
    BinaryOp::RShift,
    BinaryOp::Sub,
    BinaryOp::Div,
    BinaryOp::Xor,
];

const fn operators<const N: usize>(subscript: bool) -> [Operator; N] {
    let mut out = [Operator::plain(BinaryOp::Add); N];
    let mut i = 0;

    while i < ARITHMETIC.len() {
        out[i] = Operator::plain(ARITHMETIC[i]);
        out[i + ARITHMETIC.len()] = Operator::inplace(ARITHMETIC[i]);
        i += 1;
    }

    if subscript {
        out[2 * ARITHMETIC.len()] = Operator::plain(BinaryOp::Subscript);
    }

    out
}

/// `BINARY_OP` operands from 3.11: the arithmetic operators, then their inplace forms
pub static BINARY_OPERATORS: [Operator; 26] = operators(false);

/// `BINARY_OP` operands from 3.14, where subscripts follow the inplace operators
pub static BINARY_OPERATORS_WITH_SUBSCRIPT: [Operator; 27] = operators(true);

/// `COMPARE_OP` operands once shifted
pub static COMPARISONS: [BinaryOp; 6] = [
    BinaryOp::Lt,
    BinaryOp::LtEq,
    BinaryOp::Eq,
    BinaryOp::NotEq,
    BinaryOp::Gt,
    BinaryOp::GtEq,
];

/// Implicit conversions the interpreter applies before using a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coercion {
    Bool,
    Iter,
    Awaitable,
    AsyncIter,
}

impl Coercion {
    pub fn name(&self) -> &'static str {
        match self {
            Coercion::Bool => "bool",
            Coercion::Iter => "iter",
            Coercion::Awaitable => "awaitable",
            Coercion::AsyncIter => "aiter",
        }
    }
}

/// When a conditional branch is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Test {
    IfTrue,
    IfFalse,
    IfNone,
    IfNotNone,
    /// The iterator has no more items
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Tuple,
    List,
    Set,
    /// Keys and values alternate, key first
    Map,
    /// Concatenated formatted pieces
    String,
    Slice,
}

/// Where `LOAD_GLOBAL` puts the NULL requested by the low bit of its operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NullSlot {
    /// The operand is the name index and no NULL is pushed
    Never,
    Before,
    After,
}

/// Stack layout of a call: the callable slots, the positional arguments and optionally the keyword
/// names tuple on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallShape {
    /// One for the callable alone, two for the callable paired with self or NULL
    pub callable_slots: u8,
    pub kw_names: bool,
}

impl CallShape {
    pub const fn new(callable_slots: u8, kw_names: bool) -> Self {
        CallShape {
            callable_slots,
            kw_names,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Semantics {
    /// Not modelled. The lifter records the instruction with its operands and names its results by
    /// position.
    #[default]
    Opaque,
    Nop,
    LoadConst,
    LoadSmallInt,
    PushNull,
    Load(PlaceKind),
    /// Global name index in the upper bits of the operand, NULL requested by the low bit
    LoadGlobal(NullSlot),
    /// Two locals packed into the nibbles of the operand, high nibble first
    LoadFastPair,
    Store(PlaceKind),
    /// Stores the top into the high nibble local, then the next value into the low nibble local
    StoreFastPair,
    StoreFastLoadFast,
    /// Attribute name index in the operand. With `method_bit` the name is in the upper bits and the low
    /// bit asks for a method load.
    LoadAttr {
        method_bit: bool,
    },
    /// Method load: the attribute and the object it was looked up on
    LoadMethod,
    /// Keyword names for the next call
    KwNames,
    /// Discards every operand
    Pop,
    /// Pushes a copy of the deepest operand
    Copy,
    /// Pushes copies of all operands
    Duplicate,
    /// Exchanges the top with the deepest operand
    Swap,
    /// Moves the top below the other operands
    Rotate,
    Unary(UnaryOp),
    Binary(Operator),
    /// `BINARY_OP`, operator picked by the operand
    BinaryOperator(&'static [Operator]),
    /// Comparison picked by `operand >> shift`, coerced to bool when `bool_bit` is set in the operand
    Compare {
        shift: u8,
        bool_bit: Option<u32>,
    },
    /// `IS_OP` and `CONTAINS_OP`, negated when the operand is one
    Negatable {
        plain: BinaryOp,
        negated: BinaryOp,
    },
    Coerce(Coercion),
    /// `GET_ITER` pushing the iterator and its index slot
    IterWithIndex,
    Build(Container),
    Call(CallShape),
    /// `qualname` when the qualified name sits on top of the code object
    MakeFunction {
        qualname: bool,
    },
    SetFunctionAttribute,
    Return,
    ReturnConst,
    Branch(Test),
    /// Advances the iterator below any index slots, jumping away once it is exhausted
    ForIter,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn binary_operator_order() {
        assert_eq!(BINARY_OPERATORS[0], Operator::plain(BinaryOp::Add));
        assert_eq!(BINARY_OPERATORS[10], Operator::plain(BinaryOp::Sub));
        assert_eq!(BINARY_OPERATORS[13], Operator::inplace(BinaryOp::Add));
        assert_eq!(BINARY_OPERATORS[25], Operator::inplace(BinaryOp::Xor));
        assert_eq!(
            BINARY_OPERATORS_WITH_SUBSCRIPT[26],
            Operator::plain(BinaryOp::Subscript)
        );
        assert_eq!(
            BINARY_OPERATORS_WITH_SUBSCRIPT[..26],
            BINARY_OPERATORS[..]
        );
    }

    #[test]
    fn operator_symbols() {
        assert_eq!(Operator::plain(BinaryOp::FloorDiv).to_string(), "//");
        assert_eq!(Operator::inplace(BinaryOp::Power).to_string(), "**=");
        assert_eq!(BinaryOp::NotIn.symbol(), "not in");
    }
}
