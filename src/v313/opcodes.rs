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

pub const EXTENDED_ARG: u8 = 71;

/// Python 3.13 renumbered every opcode: the ones with an operand now start at 44 and the specialized
/// family starts after RESUME.
/// From https://github.com/python/cpython/blob/3.13/Include/opcode_ids.h
pub fn table() -> Result<OpcodeTable, TableError> {
    OpcodeTable::builder(PyVersion::new(3, 13), MarshalFormat::V311)
        .extended_arg(EXTENDED_ARG)
        .build(vec![
            op(0, "CACHE", fixed(0, 0)).means(Semantics::Nop),
            op(1, "BEFORE_ASYNC_WITH", fixed(1, 2)),
            op(2, "BEFORE_WITH", fixed(1, 2)),
            op(4, "BINARY_SLICE", fixed(3, 1)),
            op(5, "BINARY_SUBSCR", fixed(2, 1)).with_caches(1).means(binary(BinaryOp::Subscript)),
            op(6, "CHECK_EG_MATCH", fixed(2, 2)),
            op(7, "CHECK_EXC_MATCH", fixed(2, 2)),
            op(8, "CLEANUP_THROW", fixed(3, 2)),
            op(9, "DELETE_SUBSCR", fixed(2, 0)),
            op(10, "END_ASYNC_FOR", fixed(2, 0)),
            op(11, "END_FOR", fixed(1, 0)).means(Semantics::Pop),
            op(12, "END_SEND", fixed(2, 1)),
            op(13, "EXIT_INIT_CHECK", fixed(1, 0)),
            op(14, "FORMAT_SIMPLE", fixed(1, 1)),
            op(15, "FORMAT_WITH_SPEC", fixed(2, 1)),
            op(16, "GET_AITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::AsyncIter)),
            op(18, "GET_ANEXT", fixed(1, 2)),
            op(19, "GET_ITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::Iter)),
            op(20, "GET_LEN", fixed(1, 2)),
            op(21, "GET_YIELD_FROM_ITER", fixed(1, 1)),
            op(22, "INTERPRETER_EXIT", fixed(1, 0)).returns(),
            op(23, "LOAD_ASSERTION_ERROR", fixed(0, 1)),
            op(24, "LOAD_BUILD_CLASS", fixed(0, 1)),
            op(25, "LOAD_LOCALS", fixed(0, 1)),
            op(26, "MAKE_FUNCTION", fixed(1, 1)).means(Semantics::MakeFunction { qualname: false }),
            op(27, "MATCH_KEYS", fixed(2, 3)),
            op(28, "MATCH_MAPPING", fixed(1, 2)),
            op(29, "MATCH_SEQUENCE", fixed(1, 2)),
            op(30, "NOP", fixed(0, 0)).means(Semantics::Nop),
            op(31, "POP_EXCEPT", fixed(1, 0)),
            op(32, "POP_TOP", fixed(1, 0)).means(Semantics::Pop),
            op(33, "PUSH_EXC_INFO", fixed(1, 2)),
            op(34, "PUSH_NULL", fixed(0, 1)).means(Semantics::PushNull),
            op(35, "RETURN_GENERATOR", fixed(0, 1)),
            op(36, "RETURN_VALUE", fixed(1, 0)).returns().means(Semantics::Return),
            op(37, "SETUP_ANNOTATIONS", fixed(0, 0)),
            op(38, "STORE_SLICE", fixed(4, 0)),
            op(39, "STORE_SUBSCR", fixed(3, 0)).with_caches(1),
            op(40, "TO_BOOL", fixed(1, 1)).with_caches(3).means(Semantics::Coerce(Coercion::Bool)),
            op(41, "UNARY_INVERT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Invert)),
            op(42, "UNARY_NEGATIVE", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Negative)),
            op(43, "UNARY_NOT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Not)),
            op(44, "WITH_EXCEPT_START", fixed(4, 5)),
            op(45, "BINARY_OP", fixed(2, 1))
                .with_caches(1)
                .means(Semantics::BinaryOperator(&BINARY_OPERATORS)),
            op(
                46,
                "BUILD_CONST_KEY_MAP",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(1)?, 1))),
            ),
            op(47, "BUILD_LIST", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::List)),
            op(
                48,
                "BUILD_MAP",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_mul(2)?, 1))),
            )
            .means(Semantics::Build(Container::Map)),
            op(49, "BUILD_SET", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::Set)),
            op(
                50,
                "BUILD_SLICE",
                computed(|oparg, _| Some(StackEffect::new(if oparg == 3 { 3 } else { 2 }, 1))),
            )
            .means(Semantics::Build(Container::Slice)),
            op(51, "BUILD_STRING", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::String)),
            op(52, "BUILD_TUPLE", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::Tuple)),
            op(53, "CALL", computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, 1))))
                .with_caches(3)
                .calls()
                .means(Semantics::Call(CallShape::new(2, false))),
            op(
                54,
                "CALL_FUNCTION_EX",
                computed(|oparg, _| Some(StackEffect::new(3 + (oparg & 1), 1))),
            )
            .calls(),
            op(55, "CALL_INTRINSIC_1", fixed(1, 1)),
            op(56, "CALL_INTRINSIC_2", fixed(2, 1)),
            // The keyword names tuple sits on top of the arguments
            op(
                57,
                "CALL_KW",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(3)?, 1))),
            )
            .calls()
            .means(Semantics::Call(CallShape::new(2, true))),
            op(58, "COMPARE_OP", fixed(2, 1))
                .with_caches(1)
                .means(Semantics::Compare {
                    shift: 5,
                    bool_bit: Some(16),
                }),
            op(59, "CONTAINS_OP", fixed(2, 1))
                .with_caches(1)
                .means(Semantics::Negatable {
                    plain: BinaryOp::In,
                    negated: BinaryOp::NotIn,
                }),
            op(60, "CONVERT_VALUE", fixed(1, 1)),
            op(
                61,
                "COPY",
                computed(|oparg, _| Some(StackEffect::new(oparg, oparg.checked_add(1)?))),
            )
            .means(Semantics::Copy),
            op(62, "COPY_FREE_VARS", fixed(0, 0)).means(Semantics::Nop),
            op(63, "DELETE_ATTR", fixed(1, 0)),
            op(64, "DELETE_DEREF", fixed(0, 0)),
            op(65, "DELETE_FAST", fixed(0, 0)),
            op(66, "DELETE_GLOBAL", fixed(0, 0)),
            op(67, "DELETE_NAME", fixed(0, 0)),
            op(68, "DICT_MERGE", computed(append_into)),
            op(69, "DICT_UPDATE", computed(append_into)),
            op(70, "ENTER_EXECUTOR", fixed(0, 0)),
            op(EXTENDED_ARG, "EXTENDED_ARG", fixed(0, 0)).means(Semantics::Nop),
            op(72, "FOR_ITER", fixed(1, 2))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::ForIter),
            op(73, "GET_AWAITABLE", fixed(1, 1)).means(Semantics::Coerce(Coercion::Awaitable)),
            op(74, "IMPORT_FROM", fixed(1, 2)),
            op(75, "IMPORT_NAME", fixed(2, 1)),
            op(76, "IS_OP", fixed(2, 1)).means(Semantics::Negatable {
                plain: BinaryOp::Is,
                negated: BinaryOp::IsNot,
            }),
            op(77, "JUMP_BACKWARD", fixed(0, 0))
                .with_caches(1)
                .jumps(Backward)
                .means(Semantics::Nop),
            op(78, "JUMP_BACKWARD_NO_INTERRUPT", fixed(0, 0)).jumps(Backward).means(Semantics::Nop),
            op(79, "JUMP_FORWARD", fixed(0, 0)).jumps(Forward).means(Semantics::Nop),
            op(80, "LIST_APPEND", computed(append_into)),
            op(81, "LIST_EXTEND", computed(append_into)),
            op(
                82,
                "LOAD_ATTR",
                computed(|oparg, _| Some(StackEffect::new(1, 1 + (oparg & 1)))),
            )
            .with_caches(9)
            .means(Semantics::LoadAttr { method_bit: true }),
            op(83, "LOAD_CONST", fixed(0, 1)).means(Semantics::LoadConst),
            op(84, "LOAD_DEREF", fixed(0, 1)).means(Semantics::Load(Deref)),
            op(85, "LOAD_FAST", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(86, "LOAD_FAST_AND_CLEAR", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(87, "LOAD_FAST_CHECK", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(88, "LOAD_FAST_LOAD_FAST", fixed(0, 2)).means(Semantics::LoadFastPair),
            op(89, "LOAD_FROM_DICT_OR_DEREF", fixed(1, 1)),
            op(90, "LOAD_FROM_DICT_OR_GLOBALS", fixed(1, 1)),
            op(
                91,
                "LOAD_GLOBAL",
                computed(|oparg, _| Some(StackEffect::push((oparg & 1) + 1))),
            )
            .with_caches(4)
            .means(Semantics::LoadGlobal(NullSlot::After)),
            op(92, "LOAD_NAME", fixed(0, 1)).means(Semantics::Load(Name)),
            op(
                93,
                "LOAD_SUPER_ATTR",
                computed(|oparg, _| Some(StackEffect::new(3, 1 + (oparg & 1)))),
            )
            .with_caches(1),
            op(94, "MAKE_CELL", fixed(0, 0)).means(Semantics::Nop),
            op(
                95,
                "MAP_ADD",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, oparg))),
            ),
            op(96, "MATCH_CLASS", fixed(3, 1)),
            op(97, "POP_JUMP_IF_FALSE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfFalse)),
            op(98, "POP_JUMP_IF_NONE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfNone)),
            op(99, "POP_JUMP_IF_NOT_NONE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfNotNone)),
            op(100, "POP_JUMP_IF_TRUE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfTrue)),
            op(101, "RAISE_VARARGS", computed(|oparg, _| Some(StackEffect::pop(oparg)))).raises(),
            op(
                102,
                "RERAISE",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(1)?, oparg))),
            )
            .raises(),
            op(103, "RETURN_CONST", fixed(0, 0)).returns().means(Semantics::ReturnConst),
            op(104, "SEND", fixed(2, 2)).with_caches(1).branches(Forward),
            op(105, "SET_ADD", computed(append_into)),
            // Attribute value and function in, function out
            op(106, "SET_FUNCTION_ATTRIBUTE", fixed(2, 1)).means(Semantics::SetFunctionAttribute),
            op(107, "SET_UPDATE", computed(append_into)),
            op(108, "STORE_ATTR", fixed(2, 0)).with_caches(4),
            op(109, "STORE_DEREF", fixed(1, 0)).means(Semantics::Store(Deref)),
            op(110, "STORE_FAST", fixed(1, 0)).means(Semantics::Store(Fast)),
            op(111, "STORE_FAST_LOAD_FAST", fixed(1, 1)).means(Semantics::StoreFastLoadFast),
            op(112, "STORE_FAST_STORE_FAST", fixed(2, 0)).means(Semantics::StoreFastPair),
            op(113, "STORE_GLOBAL", fixed(1, 0)).means(Semantics::Store(Global)),
            op(114, "STORE_NAME", fixed(1, 0)).means(Semantics::Store(Name)),
            op(115, "SWAP", computed(|oparg, _| Some(StackEffect::balanced(oparg))))
                .means(Semantics::Swap),
            op(
                116,
                "UNPACK_EX",
                computed(|oparg, _| Some(StackEffect::new(1, (oparg & 0xFF) + (oparg >> 8) + 1))),
            ),
            op(117, "UNPACK_SEQUENCE", computed(|oparg, _| Some(StackEffect::new(1, oparg))))
                .with_caches(1),
            op(118, "YIELD_VALUE", fixed(1, 1)),
            op(149, "RESUME", fixed(0, 0)).means(Semantics::Nop),
        ])
}

fn append_into(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(oparg.checked_add(1)?, oparg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_valid() {
        let table = table().unwrap();

        assert_eq!(table.get(149).unwrap().mnemonic, "RESUME");
        assert_eq!(table.by_mnemonic("TO_BOOL").unwrap().cache_entries, 3);
        assert!(table.is_extended_arg(71));
        assert!(table.by_mnemonic("KW_NAMES").is_none());
    }

    #[test]
    fn conditional_jumps_skip_their_cache() {
        let table = table().unwrap();
        let info = table.by_mnemonic("POP_JUMP_IF_TRUE").unwrap();

        assert_eq!(table.instruction_len(info), 4);
    }
}
