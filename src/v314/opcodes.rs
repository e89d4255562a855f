use crate::{
    opcodes::{branching, computed, fixed, op, JumpAddressing::*, OpcodeTable, TableError},
    semantics::{
        BinaryOp, CallShape, Coercion, Container, NullSlot, PlaceKind::*, Semantics, Test::*,
        UnaryOp, BINARY_OPERATORS_WITH_SUBSCRIPT,
    },
    unmarshal::format::MarshalFormat,
    utils::StackEffect,
    version::PyVersion,
};

pub const EXTENDED_ARG: u8 = 69;

// From https://github.com/python/cpython/blob/3.14/Include/opcode_ids.h
pub fn table() -> Result<OpcodeTable, TableError> {
    OpcodeTable::builder(PyVersion::new(3, 14), MarshalFormat::V311)
        .extended_arg(EXTENDED_ARG)
        .build(vec![
            op(0, "CACHE", fixed(0, 0)).means(Semantics::Nop),
            op(1, "BINARY_SLICE", fixed(3, 1)),
            op(2, "BUILD_TEMPLATE", fixed(2, 1)),
            // Callable, NULL or self, positional tuple and keyword dict (or NULL)
            op(4, "CALL_FUNCTION_EX", fixed(4, 1)).calls(),
            op(5, "CHECK_EG_MATCH", fixed(2, 2)),
            op(6, "CHECK_EXC_MATCH", fixed(2, 2)),
            op(7, "CLEANUP_THROW", fixed(3, 2)),
            op(8, "DELETE_SUBSCR", fixed(2, 0)),
            op(9, "END_FOR", fixed(1, 0)).means(Semantics::Pop),
            op(10, "END_SEND", fixed(2, 1)),
            op(11, "EXIT_INIT_CHECK", fixed(1, 0)),
            op(12, "FORMAT_SIMPLE", fixed(1, 1)),
            op(13, "FORMAT_WITH_SPEC", fixed(2, 1)),
            op(14, "GET_AITER", fixed(1, 1)).means(Semantics::Coerce(Coercion::AsyncIter)),
            op(15, "GET_ANEXT", fixed(1, 2)),
            // The iterator and its index (or NULL)
            op(16, "GET_ITER", fixed(1, 2)).means(Semantics::IterWithIndex),
            op(18, "GET_LEN", fixed(1, 2)),
            op(19, "GET_YIELD_FROM_ITER", fixed(1, 1)),
            op(20, "INTERPRETER_EXIT", fixed(1, 0)).returns(),
            op(21, "LOAD_BUILD_CLASS", fixed(0, 1)),
            op(22, "LOAD_LOCALS", fixed(0, 1)),
            op(23, "MAKE_FUNCTION", fixed(1, 1)).means(Semantics::MakeFunction { qualname: false }),
            op(24, "MATCH_KEYS", fixed(2, 3)),
            op(25, "MATCH_MAPPING", fixed(1, 2)),
            op(26, "MATCH_SEQUENCE", fixed(1, 2)),
            op(27, "NOP", fixed(0, 0)).means(Semantics::Nop),
            op(28, "NOT_TAKEN", fixed(0, 0)).means(Semantics::Nop),
            op(29, "POP_EXCEPT", fixed(1, 0)),
            op(30, "POP_ITER", fixed(2, 0)).means(Semantics::Pop),
            op(31, "POP_TOP", fixed(1, 0)).means(Semantics::Pop),
            op(32, "PUSH_EXC_INFO", fixed(1, 2)),
            op(33, "PUSH_NULL", fixed(0, 1)).means(Semantics::PushNull),
            op(34, "RETURN_GENERATOR", fixed(0, 1)),
            op(35, "RETURN_VALUE", fixed(1, 0)).returns().means(Semantics::Return),
            op(36, "SETUP_ANNOTATIONS", fixed(0, 0)),
            op(37, "STORE_SLICE", fixed(4, 0)),
            op(38, "STORE_SUBSCR", fixed(3, 0)).with_caches(1),
            op(39, "TO_BOOL", fixed(1, 1)).with_caches(3).means(Semantics::Coerce(Coercion::Bool)),
            op(40, "UNARY_INVERT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Invert)),
            op(41, "UNARY_NEGATIVE", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Negative)),
            op(42, "UNARY_NOT", fixed(1, 1)).means(Semantics::Unary(UnaryOp::Not)),
            op(43, "WITH_EXCEPT_START", fixed(5, 6)),
            // Subscripts go through BINARY_OP too
            op(44, "BINARY_OP", fixed(2, 1))
                .with_caches(5)
                .means(Semantics::BinaryOperator(&BINARY_OPERATORS_WITH_SUBSCRIPT)),
            op(
                45,
                "BUILD_INTERPOLATION",
                computed(|oparg, _| Some(StackEffect::new(2 + (oparg & 1), 1))),
            ),
            op(46, "BUILD_LIST", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::List)),
            op(
                47,
                "BUILD_MAP",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_mul(2)?, 1))),
            )
            .means(Semantics::Build(Container::Map)),
            op(48, "BUILD_SET", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::Set)),
            op(
                49,
                "BUILD_SLICE",
                computed(|oparg, _| Some(StackEffect::new(if oparg == 3 { 3 } else { 2 }, 1))),
            )
            .means(Semantics::Build(Container::Slice)),
            op(50, "BUILD_STRING", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::String)),
            op(51, "BUILD_TUPLE", computed(|oparg, _| Some(StackEffect::new(oparg, 1))))
                .means(Semantics::Build(Container::Tuple)),
            op(52, "CALL", computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, 1))))
                .with_caches(3)
                .calls()
                .means(Semantics::Call(CallShape::new(2, false))),
            op(53, "CALL_INTRINSIC_1", fixed(1, 1)),
            op(54, "CALL_INTRINSIC_2", fixed(2, 1)),
            op(55, "CALL_KW", computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(3)?, 1))))
                .with_caches(3)
                .calls()
                .means(Semantics::Call(CallShape::new(2, true))),
            op(56, "COMPARE_OP", fixed(2, 1))
                .with_caches(1)
                .means(Semantics::Compare {
                    shift: 5,
                    bool_bit: Some(16),
                }),
            op(57, "CONTAINS_OP", fixed(2, 1))
                .with_caches(1)
                .means(Semantics::Negatable {
                    plain: BinaryOp::In,
                    negated: BinaryOp::NotIn,
                }),
            op(58, "CONVERT_VALUE", fixed(1, 1)),
            op(
                59,
                "COPY",
                computed(|oparg, _| Some(StackEffect::new(oparg, oparg.checked_add(1)?))),
            )
            .means(Semantics::Copy),
            op(60, "COPY_FREE_VARS", fixed(0, 0)).means(Semantics::Nop),
            op(61, "DELETE_ATTR", fixed(1, 0)),
            op(62, "DELETE_DEREF", fixed(0, 0)),
            op(63, "DELETE_FAST", fixed(0, 0)),
            op(64, "DELETE_GLOBAL", fixed(0, 0)),
            op(65, "DELETE_NAME", fixed(0, 0)),
            op(66, "DICT_MERGE", computed(append_into)),
            op(67, "DICT_UPDATE", computed(append_into)),
            op(68, "END_ASYNC_FOR", fixed(2, 0)),
            op(EXTENDED_ARG, "EXTENDED_ARG", fixed(0, 0)).means(Semantics::Nop),
            op(70, "FOR_ITER", fixed(2, 3))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::ForIter),
            op(71, "GET_AWAITABLE", fixed(1, 1)).means(Semantics::Coerce(Coercion::Awaitable)),
            op(72, "IMPORT_FROM", fixed(1, 2)),
            op(73, "IMPORT_NAME", fixed(2, 1)),
            op(74, "IS_OP", fixed(2, 1)).means(Semantics::Negatable {
                plain: BinaryOp::Is,
                negated: BinaryOp::IsNot,
            }),
            op(75, "JUMP_BACKWARD", fixed(0, 0))
                .with_caches(1)
                .jumps(Backward)
                .means(Semantics::Nop),
            op(76, "JUMP_BACKWARD_NO_INTERRUPT", fixed(0, 0)).jumps(Backward).means(Semantics::Nop),
            op(77, "JUMP_FORWARD", fixed(0, 0)).jumps(Forward).means(Semantics::Nop),
            op(78, "LIST_APPEND", computed(append_into)),
            op(79, "LIST_EXTEND", computed(append_into)),
            op(
                80,
                "LOAD_ATTR",
                computed(|oparg, _| Some(StackEffect::new(1, 1 + (oparg & 1)))),
            )
            .with_caches(9)
            .means(Semantics::LoadAttr { method_bit: true }),
            op(81, "LOAD_COMMON_CONSTANT", fixed(0, 1)),
            op(82, "LOAD_CONST", fixed(0, 1)).means(Semantics::LoadConst),
            op(83, "LOAD_DEREF", fixed(0, 1)).means(Semantics::Load(Deref)),
            op(84, "LOAD_FAST", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(85, "LOAD_FAST_AND_CLEAR", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(86, "LOAD_FAST_BORROW", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(87, "LOAD_FAST_BORROW_LOAD_FAST_BORROW", fixed(0, 2)).means(Semantics::LoadFastPair),
            op(88, "LOAD_FAST_CHECK", fixed(0, 1)).means(Semantics::Load(Fast)),
            op(89, "LOAD_FAST_LOAD_FAST", fixed(0, 2)).means(Semantics::LoadFastPair),
            op(90, "LOAD_FROM_DICT_OR_DEREF", fixed(1, 1)),
            op(91, "LOAD_FROM_DICT_OR_GLOBALS", fixed(1, 1)),
            op(
                92,
                "LOAD_GLOBAL",
                computed(|oparg, _| Some(StackEffect::push((oparg & 1) + 1))),
            )
            .with_caches(4)
            .means(Semantics::LoadGlobal(NullSlot::After)),
            op(93, "LOAD_NAME", fixed(0, 1)).means(Semantics::Load(Name)),
            op(94, "LOAD_SMALL_INT", fixed(0, 1)).means(Semantics::LoadSmallInt),
            // The bound method and self, or the function and NULL
            op(95, "LOAD_SPECIAL", fixed(1, 2)),
            op(
                96,
                "LOAD_SUPER_ATTR",
                computed(|oparg, _| Some(StackEffect::new(3, 1 + (oparg & 1)))),
            )
            .with_caches(1),
            op(97, "MAKE_CELL", fixed(0, 0)).means(Semantics::Nop),
            op(
                98,
                "MAP_ADD",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(2)?, oparg))),
            ),
            op(99, "MATCH_CLASS", fixed(3, 1)),
            op(100, "POP_JUMP_IF_FALSE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfFalse)),
            op(101, "POP_JUMP_IF_NONE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfNone)),
            op(102, "POP_JUMP_IF_NOT_NONE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfNotNone)),
            op(103, "POP_JUMP_IF_TRUE", fixed(1, 0))
                .with_caches(1)
                .branches(Forward)
                .means(Semantics::Branch(IfTrue)),
            op(104, "RAISE_VARARGS", computed(|oparg, _| Some(StackEffect::pop(oparg)))).raises(),
            op(
                105,
                "RERAISE",
                computed(|oparg, _| Some(StackEffect::new(oparg.checked_add(1)?, oparg))),
            )
            .raises(),
            op(106, "SEND", fixed(2, 2)).with_caches(1).branches(Forward),
            op(107, "SET_ADD", computed(append_into)),
            op(108, "SET_FUNCTION_ATTRIBUTE", fixed(2, 1)).means(Semantics::SetFunctionAttribute),
            op(109, "SET_UPDATE", computed(append_into)),
            op(110, "STORE_ATTR", fixed(2, 0)).with_caches(4),
            op(111, "STORE_DEREF", fixed(1, 0)).means(Semantics::Store(Deref)),
            op(112, "STORE_FAST", fixed(1, 0)).means(Semantics::Store(Fast)),
            op(113, "STORE_FAST_LOAD_FAST", fixed(1, 1)).means(Semantics::StoreFastLoadFast),
            op(114, "STORE_FAST_STORE_FAST", fixed(2, 0)).means(Semantics::StoreFastPair),
            op(115, "STORE_GLOBAL", fixed(1, 0)).means(Semantics::Store(Global)),
            op(116, "STORE_NAME", fixed(1, 0)).means(Semantics::Store(Name)),
            op(117, "SWAP", computed(|oparg, _| Some(StackEffect::balanced(oparg))))
                .means(Semantics::Swap),
            op(
                118,
                "UNPACK_EX",
                computed(|oparg, _| Some(StackEffect::new(1, (oparg & 0xFF) + (oparg >> 8) + 1))),
            ),
            op(119, "UNPACK_SEQUENCE", computed(|oparg, _| Some(StackEffect::new(1, oparg))))
                .with_caches(1),
            op(120, "YIELD_VALUE", fixed(1, 1)),
            op(128, "RESUME", fixed(0, 0)).means(Semantics::Nop),
        ])
}

fn append_into(oparg: u32, _: bool) -> Option<StackEffect> {
    Some(StackEffect::new(oparg.checked_add(1)?, oparg))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn table_is_valid() {
        let table = table().unwrap();

        assert_eq!(table.get(128).unwrap().mnemonic, "RESUME");
        assert_eq!(table.get(94).unwrap().mnemonic, "LOAD_SMALL_INT");
        assert_eq!(table.by_mnemonic("BINARY_OP").unwrap().cache_entries, 5);
        assert!(table.by_mnemonic("RETURN_CONST").is_none());
        assert!(table.by_mnemonic("BINARY_SUBSCR").is_none());
    }

    #[test]
    fn loops_keep_iterator_and_index() {
        let table = table().unwrap();

        let depth = ["GET_ITER", "FOR_ITER", "END_FOR", "POP_ITER"]
            .iter()
            .try_fold(1u32, |depth, name| {
                let effect = table.by_mnemonic(name).unwrap().stack_effect(0, false).unwrap();
                effect.apply(depth)
            });

        assert_eq!(depth, Ok(0));
    }
}
