use crate::{
    opcodes::{branching, computed, fixed, op, JumpAddressing::*, OpcodeTable, TableError},
    semantics::{
        binary, BinaryOp, CallShape, Coercion, Container, NullSlot, PlaceKind::*, Semantics,
        Test::*, UnaryOp, BINARY_OPERATORS,
    },
    unmarshal::format::MarshalFormat,
    utils::StackEffect,
    version::PyVersion,
};

pub const EXTENDED_ARG: u8 = 144;

/// Python 3.11 opcodes. Specialized variants only exist at runtime and never appear in marshalled code.
/// From https://github.com/python/cpython/blob/3.11/Include/opcode.h
pub fn table() -> Result<OpcodeTable, TableError> {
    OpcodeTable::builder(PyVersion::new(3, 11), MarshalFormat::V311)
        .extended_arg(EXTENDED_ARG)
        .build(vec![
            op(0, "CACHE", fixed(0, 0)).means(Semantics::Nop),
            op(1, "POP_TOP", fixed(1, 0)).means(Semantics::Pop),
            op(2, "PUSH_NULL", fixed(0, 1)).means(Semantics::PushNull),
            op(9, "NOP", fixed(0, 0)).means(Semantics::Nop),
            op(10, "UNARY_POSITIVE", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Positive)),
            op(11, "UNARY_NEGATIVE", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Negative)),
            op(12, "UNARY_NOT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Not)),
            op(15, "UNARY_INVERT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Invert)),
            op(25, "BINARY_SUBSCR", fixed(2, 1)).with_caches(4).means(binary(BinaryOp::Subscript)),
            op(30, "GET_LEN", fixed(1, 2)),
            op(31, "MATCH_MAPPING", fixed(1, 2)),
            op(32, "MATCH_SEQUENCE", fixed(1, 2)),
            op(33, "MATCH_KEYS", fixed(2, 3)),
            op(35, "PUSH_EXC_INFO", fixed(1, 2)),
            op(36, "CHECK_EXC_MATCH", fixed(2, 2)),
            op(37, "CHECK_EG_MATCH", fixed(2, 2)),
            op(49, "WITH_EXCEPT_START", fixed(4, 5)),
            op(50, "GET_AITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::AsyncIter)),
            op(51, "GET_ANEXT", fixed(1, 2)),
            op(52, "BEFORE_ASYNC_WITH", fixed(1, 2)),
            op(53, "BEFORE_WITH", fixed(1, 2)),
            op(54, "END_ASYNC_FOR", fixed(2, 0)),
            op(60, "STORE_SUBSCR", fixed(3, 0)).with_caches(1),
            op(61, "DELETE_SUBSCR", fixed(2, 0)),
            op(68, "GET_ITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::Iter)),
            op(69, "GET_YIELD_FROM_ITER", fixed(1, 1)),
            op(70, "PRINT_EXPR", fixed(1, 0)),
            op(71, "LOAD_BUILD_CLASS", fixed(0, 1)),
            op(74, "LOAD_ASSERTION_ERROR", fixed(0, 1)),
            // Pushes the generator, popped again right after
            op(75, "RETURN_GENERATOR", fixed(0, 1)),
            op(82, "LIST_TO_TUPLE", fixed(1, 1)),
            op(83, "RETURN_VALUE", fixed(1, 0)).returns().means(Semantics::Return),
            op(84, "IMPORT_STAR", fixed(1, 0)),
            op(85, "SETUP_ANNOTATIONS", fixed(0, 0)),
            op(86, "YIELD_VALUE", fixed(1, 1)),
            op(87, "ASYNC_GEN_WRAP", fixed(1, 1)),
            op(88, "PREP_RERAISE_STAR", fixed(2, 1)),
            op(89, "POP_EXCEPT", fixed(1, 0)),
            op(90, "STORE_NAME", fixed(1, 0)).means(Semantics::Store(Name)),
            op(91, "DELETE_NAME", fixed(0, 0)),
            op(
                92,
                "UNPACK_SEQUENCE",
                computed(|oparg, _| Some(StackEffect::new(1, oparg))),
            )
            .with_caches(1),
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
            op(95, "STORE_ATTR", fixed(2, 0)).with_caches(4),
            op(96, "DELETE_ATTR", fixed(1, 0)),
            op(97, "STORE_GLOBAL", fixed(1, 0)).means(Semantics::Store(Global)),
            op(98, "DELETE_GLOBAL", fixed(0, 0)),
            op(99, "SWAP", computed(|oparg, _| Some(StackEffect::balanced(oparg))))
                .means(Semantics::Swap),
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
            op(106, "LOAD_ATTR", fixed(1, 1))
                .with_caches(4)
                .means(Semantics::LoadAttr { method_bit: false }),
            op(107, "COMPARE_OP", fixed(2, 1))
                .with_caches(2)
                .means(Semantics::Compare {
                    shift: 0,
                    bool_bit: None,
                }),
            op(108, "IMPORT_NAME", fixed(2, 1)),
            op(109, "IMPORT_FROM", fixed(1, 2)),
            op(110, "JUMP_FORWARD", fixed(0, 0)).jumps(Forward).means(Semantics::Nop),
            op(
                111,
                "JUMP_IF_FALSE_OR_POP",
                branching(StackEffect::balanced(1), StackEffect::pop(1)),
            )
            .branches(Forward)
            .means(Semantics::Branch(IfFalse)),
            op(
                112,
                "JUMP_IF_TRUE_OR_POP",
                branching(StackEffect::balanced(1), StackEffect::pop(1)),
            )
            .branches(Forward)
            .means(Semantics::Branch(IfTrue)),
            op(114, "POP_JUMP_FORWARD_IF_FALSE", fixed(1, 0))
                .branches(Forward)
                .means(Semantics::Branch(IfFalse)),
            op(115, "POP_JUMP_FORWARD_IF_TRUE", fixed(1, 0))
                .branches(Forward)
                .means(Semantics::Branch(IfTrue)),
            // NULL and the global when the low bit is set
            op(
                116,
                "LOAD_GLOBAL",
                computed(|oparg, _| Some(StackEffect::push((oparg & 1) + 1))),
            )
            .with_caches(5)
            .means(Semantics::LoadGlobal(NullSlot::Before)),
            op(117, "IS_OP", fixed(2, 1)).means(Semantics::Negatable {
                plain: BinaryOp::Is,
                negated: BinaryOp::IsNot,
            }),
            op(118, "CONTAINS_OP", fixed(2, 1)).means(Semantics::Negatable {
                plain: BinaryOp::In,
                negated: BinaryOp::NotIn,
            }),
            op(119, "RERAISE", fixed(1, 0)).raises(),
            op(
                120,
                "COPY",
                computed(|oparg, _| Some(StackEffect::new(oparg, oparg.checked_add(1)?))),
            )
            .means(Semantics::Copy),
            op(122, "BINARY_OP", fixed(2, 1))
                .with_caches(1)
                .means(Semantics::BinaryOperator(&BINARY_OPERATORS)),
            op(
                123,
                "SEND",
                branching(StackEffect::new(2, 1), StackEffect::balanced(2)),
            )
            .branches(Forward),
            op(124, "LOAD_FAST", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(125, "STORE_FAST", fixed(1, 0)).means(Semantics::Store(Fast)),
            op(126, "DELETE_FAST", fixed(0, 0)),
            op(128, "POP_JUMP_FORWARD_IF_NOT_NONE", fixed(1, 0))
                .branches(Forward)
                .means(Semantics::Branch(IfNotNone)),
            op(129, "POP_JUMP_FORWARD_IF_NONE", fixed(1, 0))
                .branches(Forward)
                .means(Semantics::Branch(IfNone)),
            op(130, "RAISE_VARARGS", computed(|oparg, _| Some(StackEffect::pop(oparg)))).raises(),
            op(131, "GET_AWAITABLE", fixed(1, 1)).means(Semantics::Coerce(Coercion::Awaitable)),
            op(
                132,
                "MAKE_FUNCTION",
                computed(|oparg, _| Some(StackEffect::new((oparg & 0xF).count_ones() + 1, 1))),
            )
            .means(Semantics::MakeFunction { qualname: false }),
            op(133, "BUILD_SLICE", computed(build_slice)).means(Semantics::Build(Container::Slice)),
            op(134, "JUMP_BACKWARD_NO_INTERRUPT", fixed(0, 0))
                .jumps(Backward)
                .means(Semantics::Nop),
            op(135, "MAKE_CELL", fixed(0, 0)).means(Semantics::Nop),
            op(136, "LOAD_CLOSURE", fixed(0, 1)).means(Semantics::Load(Deref)),
            op(137, "LOAD_DEREF", fixed(0, 1)).means(Semantics::Load(Deref)),
            op(138, "STORE_DEREF", fixed(1, 0)).means(Semantics::Store(Deref)),
            op(139, "DELETE_DEREF", fixed(0, 0)),
            op(140, "JUMP_BACKWARD", fixed(0, 0)).jumps(Backward).means(Semantics::Nop),
            // NULL, callable, positional tuple and the optional mapping
            op(
                142,
                "CALL_FUNCTION_EX",
                computed(|oparg, _| Some(StackEffect::new(3 + (oparg & 1), 1))),
            )
            .calls(),
            op(EXTENDED_ARG, "EXTENDED_ARG", fixed(0, 0)).means(Semantics::Nop),
            op(145, "LIST_APPEND", computed(append_into)),
            op(146, "SET_ADD", computed(append_into)),
            op(
                147,
                "MAP_ADD",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, oparg))),
            ),
            op(148, "LOAD_CLASSDEREF", fixed(0, 1)).means(Semantics::Load(Deref)),
            op(149, "COPY_FREE_VARS", fixed(0, 0)).means(Semantics::Nop),
            op(151, "RESUME", fixed(0, 0)).means(Semantics::Nop),
            op(152, "MATCH_CLASS", fixed(3, 1)),
            op(155, "FORMAT_VALUE", computed(format_value)),
            op(
                156,
                "BUILD_CONST_KEY_MAP",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(1)?, 1))),
            ),
            op(157, "BUILD_STRING", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::String)),
            op(160, "LOAD_METHOD", fixed(1, 2)).with_caches(10).means(Semantics::LoadMethod),
            op(162, "LIST_EXTEND", computed(append_into)),
            op(163, "SET_UPDATE", computed(append_into)),
            op(164, "DICT_MERGE", computed(append_into)),
            op(165, "DICT_UPDATE", computed(append_into)),
            op(166, "PRECALL", fixed(0, 0)).with_caches(1).means(Semantics::Nop),
            // NULL and callable or method and self, then the arguments
            op(171, "CALL", computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, 1))))
                .with_caches(4)
                .calls()
                .means(Semantics::Call(CallShape::new(2, false))),
            op(172, "KW_NAMES", fixed(0, 0)).means(Semantics::KwNames),
            op(173, "POP_JUMP_BACKWARD_IF_NOT_NONE", fixed(1, 0))
                .branches(Backward)
                .means(Semantics::Branch(IfNotNone)),
            op(174, "POP_JUMP_BACKWARD_IF_NONE", fixed(1, 0))
                .branches(Backward)
                .means(Semantics::Branch(IfNone)),
            op(175, "POP_JUMP_BACKWARD_IF_FALSE", fixed(1, 0))
                .branches(Backward)
                .means(Semantics::Branch(IfFalse)),
            op(176, "POP_JUMP_BACKWARD_IF_TRUE", fixed(1, 0))
                .branches(Backward)
                .means(Semantics::Branch(IfTrue)),
        ])
}

fn build_slice(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(if oparg == 3 { 3 } else { 2 }, 1))
}

fn format_value(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(if oparg & 0x4 == 0x4 { 2 } else { 1 }, 1))
}

fn append_into(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(oparg.checked_add(1)?, oparg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::decode_stream;

    #[test]
    fn table_is_valid() {
        let table = table().unwrap();

        assert_eq!(table.by_mnemonic("LOAD_GLOBAL").unwrap().cache_entries, 5);
        assert_eq!(table.get(151).unwrap().mnemonic, "RESUME");
        assert!(table.get(3).is_none(), "specialized opcodes are not marshalled");
    }

    #[test]
    fn backward_jumps_count_from_the_end() {
        let table = table().unwrap();

        // NOP, NOP, JUMP_BACKWARD 2
        let instructions = decode_stream(&[9, 0, 9, 0, 140, 2], &table).unwrap();

        assert_eq!(table.jump_target(&instructions[2]), Some(2));
    }
}
