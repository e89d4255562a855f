use crate::{
    opcodes::{branching, computed, fixed, op, JumpAddressing::*, OpcodeTable, TableError},
    semantics::{
        binary, inplace, BinaryOp, CallShape, Coercion, Container, NullSlot, PlaceKind::*,
        Semantics, Test::*, UnaryOp,
    },
    unmarshal::format::MarshalFormat,
    utils::StackEffect,
    version::PyVersion,
};

pub const EXTENDED_ARG: u8 = 144;

/// Python 3.10 opcodes. Jump operands count instructions, absolute jumps from the start of the code.
/// From https://github.com/python/cpython/blob/3.10/Lib/opcode.py and `stack_effect` in Python/compile.c
pub fn table() -> Result<OpcodeTable, TableError> {
    OpcodeTable::builder(PyVersion::new(3, 10), MarshalFormat::V310)
        .extended_arg(EXTENDED_ARG)
        .build(vec![
            op(1, "POP_TOP", fixed(1, 0)).means(Semantics::Pop),
            op(2, "ROT_TWO", fixed(2, 2)).means(Semantics::Rotate),
            op(3, "ROT_THREE", fixed(3, 3)).means(Semantics::Rotate),
            op(4, "DUP_TOP", fixed(1, 2)).means(Semantics::Copy),
            op(5, "DUP_TOP_TWO", fixed(2, 4)).means(Semantics::Duplicate),
            op(6, "ROT_FOUR", fixed(4, 4)).means(Semantics::Rotate),
            op(9, "NOP", fixed(0, 0)).means(Semantics::Nop),
            op(10, "UNARY_POSITIVE", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Positive)),
            op(11, "UNARY_NEGATIVE", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Negative)),
            op(12, "UNARY_NOT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Not)),
            op(15, "UNARY_INVERT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Invert)),
            op(16, "BINARY_MATRIX_MULTIPLY", fixed(2, 1)).means(binary(BinaryOp::MatMul)),
            op(17, "INPLACE_MATRIX_MULTIPLY", fixed(2, 1)).means(inplace(BinaryOp::MatMul)),
            op(19, "BINARY_POWER", fixed(2, 1)).means(binary(BinaryOp::Power)),
            op(20, "BINARY_MULTIPLY", fixed(2, 1)).means(binary(BinaryOp::Mul)),
            op(22, "BINARY_MODULO", fixed(2, 1)).means(binary(BinaryOp::Remainder)),
            op(23, "BINARY_ADD", fixed(2, 1)).means(binary(BinaryOp::Add)),
            op(24, "BINARY_SUBTRACT", fixed(2, 1)).means(binary(BinaryOp::Sub)),
            op(25, "BINARY_SUBSCR", fixed(2, 1)).means(binary(BinaryOp::Subscript)),
            op(26, "BINARY_FLOOR_DIVIDE", fixed(2, 1)).means(binary(BinaryOp::FloorDiv)),
            op(27, "BINARY_TRUE_DIVIDE", fixed(2, 1)).means(binary(BinaryOp::Div)),
            op(28, "INPLACE_FLOOR_DIVIDE", fixed(2, 1)).means(inplace(BinaryOp::FloorDiv)),
            op(29, "INPLACE_TRUE_DIVIDE", fixed(2, 1)).means(inplace(BinaryOp::Div)),
            op(30, "GET_LEN", fixed(1, 2)),
            op(31, "MATCH_MAPPING", fixed(1, 2)),
            op(32, "MATCH_SEQUENCE", fixed(1, 2)),
            // Pushes the values (or None) and a success flag
            op(33, "MATCH_KEYS", fixed(2, 4)),
            op(34, "COPY_DICT_WITHOUT_KEYS", fixed(2, 2)),
            op(49, "WITH_EXCEPT_START", fixed(7, 8)),
            op(50, "GET_AITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::AsyncIter)),
            op(51, "GET_ANEXT", fixed(1, 2)),
            op(52, "BEFORE_ASYNC_WITH", fixed(1, 2)),
            op(54, "END_ASYNC_FOR", fixed(7, 0)),
            op(55, "INPLACE_ADD", fixed(2, 1)).means(inplace(BinaryOp::Add)),
            op(56, "INPLACE_SUBTRACT", fixed(2, 1)).means(inplace(BinaryOp::Sub)),
            op(57, "INPLACE_MULTIPLY", fixed(2, 1)).means(inplace(BinaryOp::Mul)),
            op(59, "INPLACE_MODULO", fixed(2, 1)).means(inplace(BinaryOp::Remainder)),
            op(60, "STORE_SUBSCR", fixed(3, 0)),
            op(61, "DELETE_SUBSCR", fixed(2, 0)),
            op(62, "BINARY_LSHIFT", fixed(2, 1)).means(binary(BinaryOp::LShift)),
            op(63, "BINARY_RSHIFT", fixed(2, 1)).means(binary(BinaryOp::RShift)),
            op(64, "BINARY_AND", fixed(2, 1)).means(binary(BinaryOp::And)),
            op(65, "BINARY_XOR", fixed(2, 1)).means(binary(BinaryOp::Xor)),
            op(66, "BINARY_OR", fixed(2, 1)).means(binary(BinaryOp::Or)),
            op(67, "INPLACE_POWER", fixed(2, 1)).means(inplace(BinaryOp::Power)),
            op(68, "GET_ITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::Iter)),
            op(69, "GET_YIELD_FROM_ITER", fixed(1, 1)),
            op(70, "PRINT_EXPR", fixed(1, 0)),
            op(71, "LOAD_BUILD_CLASS", fixed(0, 1)),
            op(72, "YIELD_FROM", fixed(2, 1)),
            op(73, "GET_AWAITABLE", fixed(1, 1)).means(Semantics::Coerce(Coercion::Awaitable)),
            op(74, "LOAD_ASSERTION_ERROR", fixed(0, 1)),
            op(75, "INPLACE_LSHIFT", fixed(2, 1)).means(inplace(BinaryOp::LShift)),
            op(76, "INPLACE_RSHIFT", fixed(2, 1)).means(inplace(BinaryOp::RShift)),
            op(77, "INPLACE_AND", fixed(2, 1)).means(inplace(BinaryOp::And)),
            op(78, "INPLACE_XOR", fixed(2, 1)).means(inplace(BinaryOp::Xor)),
            op(79, "INPLACE_OR", fixed(2, 1)).means(inplace(BinaryOp::Or)),
            op(82, "LIST_TO_TUPLE", fixed(1, 1)),
            op(83, "RETURN_VALUE", fixed(1, 0)).returns().means(Semantics::Return),
            op(84, "IMPORT_STAR", fixed(1, 0)),
            op(85, "SETUP_ANNOTATIONS", fixed(0, 0)),
            op(86, "YIELD_VALUE", fixed(1, 1)),
            op(87, "POP_BLOCK", fixed(0, 0)).means(Semantics::Nop),
            op(89, "POP_EXCEPT", fixed(3, 0)),
            op(90, "STORE_NAME", fixed(1, 0)).means(Semantics::Store(Name)),
            op(91, "DELETE_NAME", fixed(0, 0)),
            op(92, "UNPACK_SEQUENCE", computed(|oparg, _| Some(StackEffect::new(1, oparg)))),
            // Pops the exhausted iterator when jumping
            op(
                93,
                "FOR_ITER",
                branching(StackEffect::pop(1), StackEffect::new(1, 2)),
            )
            .branches(Forward)
            .means(Semantics::ForIter),
            op(
                94,
                "UNPACK_EX",
                computed(|oparg, _| Some(StackEffect::new(1, (oparg & 0xFF) + (oparg >> 8) + 1))),
            ),
            op(95, "STORE_ATTR", fixed(2, 0)),
            op(96, "DELETE_ATTR", fixed(1, 0)),
            op(97, "STORE_GLOBAL", fixed(1, 0)).means(Semantics::Store(Global)),
            op(98, "DELETE_GLOBAL", fixed(0, 0)),
            op(99, "ROT_N", computed(|oparg, _| Some(StackEffect::balanced(oparg))))
                .means(Semantics::Rotate),
            op(100, "LOAD_CONST", fixed(0, 1)).means(Semantics::LoadConst),
            op(101, "LOAD_NAME", fixed(0, 1)).means(Semantics::Load(Name)),
            op(102, "BUILD_TUPLE", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::Tuple)),
            op(103, "BUILD_LIST", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::List)),
            op(104, "BUILD_SET", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::Set)),
            op(
                105,
                "BUILD_MAP",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_mul(2)?, 1))),
            )
            .means(Semantics::Build(Container::Map)),
            op(106, "LOAD_ATTR", fixed(1, 1)).means(Semantics::LoadAttr { method_bit: false }),
            op(107, "COMPARE_OP", fixed(2, 1)).means(Semantics::Compare {
                shift: 0,
                bool_bit: None,
            }),
            op(108, "IMPORT_NAME", fixed(2, 1)),
            op(109, "IMPORT_FROM", fixed(1, 2)),
            op(110, "JUMP_FORWARD", fixed(0, 0)).jumps(Forward).means(Semantics::Nop),
            // The value stays on the stack when jumping
            op(
                111,
                "JUMP_IF_FALSE_OR_POP",
                branching(StackEffect::balanced(1), StackEffect::pop(1)),
            )
            .branches(Absolute)
            .means(Semantics::Branch(IfFalse)),
            op(
                112,
                "JUMP_IF_TRUE_OR_POP",
                branching(StackEffect::balanced(1), StackEffect::pop(1)),
            )
            .branches(Absolute)
            .means(Semantics::Branch(IfTrue)),
            op(113, "JUMP_ABSOLUTE", fixed(0, 0)).jumps(Absolute).means(Semantics::Nop),
            op(114, "POP_JUMP_IF_FALSE", fixed(1, 0))
                .branches(Absolute)
                .means(Semantics::Branch(IfFalse)),
            op(115, "POP_JUMP_IF_TRUE", fixed(1, 0))
                .branches(Absolute)
                .means(Semantics::Branch(IfTrue)),
            op(116, "LOAD_GLOBAL", fixed(0, 1)).means(Semantics::LoadGlobal(NullSlot::Never)),
            op(117, "IS_OP", fixed(2, 1)).means(Semantics::Negatable {
                plain: BinaryOp::Is,
                negated: BinaryOp::IsNot,
            }),
            op(118, "CONTAINS_OP", fixed(2, 1)).means(Semantics::Negatable {
                plain: BinaryOp::In,
                negated: BinaryOp::NotIn,
            }),
            op(119, "RERAISE", fixed(3, 0)).raises(),
            op(121, "JUMP_IF_NOT_EXC_MATCH", fixed(2, 0)).branches(Absolute),
            // The handler is entered with the exception triple and the saved state
            op(
                122,
                "SETUP_FINALLY",
                branching(StackEffect::push(6), StackEffect::zero()),
            )
            .sets_up_handler(Forward),
            op(124, "LOAD_FAST", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(125, "STORE_FAST", fixed(1, 0)).means(Semantics::Store(Fast)),
            op(126, "DELETE_FAST", fixed(0, 0)),
            op(129, "GEN_START", fixed(1, 0)),
            op(130, "RAISE_VARARGS", computed(|oparg, _| Some(StackEffect::pop(oparg)))).raises(),
            op(
                131,
                "CALL_FUNCTION",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(1)?, 1))),
            )
            .calls()
            .means(Semantics::Call(CallShape::new(1, false))),
            // Code object and qualified name plus one value per flag
            op(
                132,
                "MAKE_FUNCTION",
                computed(|oparg, _| Some(StackEffect::new((oparg & 0xF).count_ones() + 2, 1))),
            )
            .means(Semantics::MakeFunction { qualname: true }),
            op(133, "BUILD_SLICE", computed(build_slice)).means(Semantics::Build(Container::Slice)),
            op(135, "LOAD_CLOSURE", fixed(0, 1)).means(Semantics::Load(Cell)),
            op(136, "LOAD_DEREF", fixed(0, 1)).means(Semantics::Load(Cell)),
            op(137, "STORE_DEREF", fixed(1, 0)).means(Semantics::Store(Cell)),
            op(138, "DELETE_DEREF", fixed(0, 0)),
            op(
                141,
                "CALL_FUNCTION_KW",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, 1))),
            )
            .calls()
            .means(Semantics::Call(CallShape::new(1, true))),
            op(
                142,
                "CALL_FUNCTION_EX",
                computed(|oparg, _| Some(StackEffect::new(2 + (oparg & 1), 1))),
            )
            .calls(),
            op(
                143,
                "SETUP_WITH",
                branching(StackEffect::new(1, 7), StackEffect::new(1, 2)),
            )
            .sets_up_handler(Forward),
            op(EXTENDED_ARG, "EXTENDED_ARG", fixed(0, 0)).means(Semantics::Nop),
            op(145, "LIST_APPEND", computed(append_into)),
            op(146, "SET_ADD", computed(append_into)),
            op(
                147,
                "MAP_ADD",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, oparg))),
            ),
            op(148, "LOAD_CLASSDEREF", fixed(0, 1)).means(Semantics::Load(Cell)),
            op(152, "MATCH_CLASS", fixed(3, 2)),
            op(
                154,
                "SETUP_ASYNC_WITH",
                branching(StackEffect::new(1, 6), StackEffect::zero()),
            )
            .sets_up_handler(Forward),
            op(155, "FORMAT_VALUE", computed(format_value)),
            op(
                156,
                "BUILD_CONST_KEY_MAP",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(1)?, 1))),
            ),
            op(157, "BUILD_STRING", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::String)),
            op(160, "LOAD_METHOD", fixed(1, 2)).means(Semantics::LoadMethod),
            op(
                161,
                "CALL_METHOD",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, 1))),
            )
            .calls()
            .means(Semantics::Call(CallShape::new(2, false))),
            op(162, "LIST_EXTEND", computed(append_into)),
            op(163, "SET_UPDATE", computed(append_into)),
            op(164, "DICT_MERGE", computed(append_into)),
            op(165, "DICT_UPDATE", computed(append_into)),
        ])
}

fn build_slice(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(if oparg == 3 { 3 } else { 2 }, 1))
}

/// With a format spec on the stack (`oparg & 0x4`) two values become one
fn format_value(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(if oparg & 0x4 == 0x4 { 2 } else { 1 }, 1))
}

/// Pops a value into the container `oparg` entries down the stack
fn append_into(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(oparg.checked_add(1)?, oparg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::FlowKind;

    #[test]
    fn table_is_valid() {
        let table = table().unwrap();

        assert_eq!(table.get(100).unwrap().mnemonic, "LOAD_CONST");
        assert_eq!(table.extended_arg(), Some(EXTENDED_ARG));
        assert_eq!(
            table.by_mnemonic("SETUP_FINALLY").unwrap().flow,
            FlowKind::SetupHandler
        );
        assert!(table.iter().all(|info| info.cache_entries == 0));
    }

    #[test]
    fn jump_dependent_effects() {
        let table = table().unwrap();
        let for_iter = table.by_mnemonic("FOR_ITER").unwrap();

        assert_eq!(for_iter.stack_effect(0, true).unwrap().net_total(), -1);
        assert_eq!(for_iter.stack_effect(0, false).unwrap().net_total(), 1);

        let make_function = table.by_mnemonic("MAKE_FUNCTION").unwrap();
        assert_eq!(make_function.stack_effect(0x08, false), Some(StackEffect::new(3, 1)));
    }
}
