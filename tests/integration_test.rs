use std::sync::Arc;

use num_bigint::BigInt;
use num_complex::Complex;
use ordered_float::OrderedFloat;
use pretty_assertions::assert_eq;
use pyc_analyzer::{
    analyze_all, load_value,
    prelude::*,
    semantics::{BinaryOp, Operator, PlaceKind},
    unmarshal::{decode, decode_with_options, format::MarshalFormat, UnmarshalOptions},
    value::LocalKind,
};
use rayon::prelude::*;

use crate::common::{assemble, dumps, function, Writer, NESTED_314};

mod common;

fn loads(bytes: &[u8], format: MarshalFormat) -> Value {
    let tree = decode_with_options(bytes, &format, &UnmarshalOptions::default())
        .unwrap()
        .tree;

    tree.materialize(tree.root()).unwrap()
}

#[test]
fn values_survive_a_round_trip() {
    common::setup();

    let big = -(BigInt::from(1) << 100u32);
    let value = Value::Tuple(vec![
        Value::None,
        Value::StopIteration,
        Value::Ellipsis,
        Value::Bool(true),
        Value::Bool(false),
        Value::SmallInt(-5),
        Value::SmallInt(1 << 40),
        Value::BigInt(big),
        Value::Float(OrderedFloat(1.5)),
        Value::Complex(Complex::new(OrderedFloat(0.5), OrderedFloat(-2.0))),
        Value::Bytes(b"\x00\xff".to_vec()),
        Value::String("héllo".into()),
        Value::String("x".repeat(300)),
        Value::List(vec![Value::SmallInt(1), Value::List(vec![])]),
        Value::Dict(vec![
            (Value::String("a".into()), Value::SmallInt(1)),
            (Value::SmallInt(2), Value::Tuple(vec![Value::None])),
        ]),
        Value::Set(vec![Value::SmallInt(3), Value::String("b".into())]),
        Value::FrozenSet(vec![]),
        Value::Tuple((0..300).map(Value::SmallInt).collect()),
    ]);

    assert_eq!(loads(&dumps(&value, MarshalFormat::V311), MarshalFormat::V311), value);
}

#[test]
fn shared_values_collapse_into_references() {
    common::setup();

    let shared = Value::String("shared".into());
    let mut writer = Writer::new(MarshalFormat::V311);
    writer.begin_tuple(2).write_flagged(&shared).write_ref(0);
    let bytes = writer.finish();

    let tree = decode_with_options(&bytes, &MarshalFormat::V311, &UnmarshalOptions::default())
        .unwrap()
        .tree;

    assert_eq!(
        tree.root(),
        &Value::Tuple(vec![
            Value::Reference(ObjectRef(0)),
            Value::Reference(ObjectRef(0))
        ])
    );
    assert_eq!(tree.objects(), &[shared.clone()]);
    assert_eq!(
        tree.materialize(tree.root()).unwrap(),
        Value::Tuple(vec![shared.clone(), shared])
    );
}

fn module_with_broken_function(table: &OpcodeTable) -> CodeObject {
    let good = function(
        "outer.good",
        assemble(table, &[("RESUME", 0), ("LOAD_CONST", 0), ("RETURN_VALUE", 0)]),
        vec![Value::None],
    );
    let broken = function("outer.broken", vec![151, 0, 0xFF, 0], vec![]);

    function(
        "<module>",
        assemble(
            table,
            &[
                ("RESUME", 0),
                ("LOAD_CONST", 0),
                ("LOAD_CONST", 1),
                ("BUILD_TUPLE", 2),
                ("POP_TOP", 0),
                ("RETURN_CONST", 2),
            ],
        ),
        vec![
            Value::Code(Box::new(good)),
            Value::Code(Box::new(broken)),
            Value::None,
        ],
    )
}

#[test]
fn code_objects_survive_a_round_trip() {
    common::setup();

    let table = builtin_registry().unwrap().resolve(PyVersion::new(3, 12)).unwrap();
    let module = Value::Code(Box::new(module_with_broken_function(&table)));

    assert_eq!(loads(&dumps(&module, MarshalFormat::V311), MarshalFormat::V311), module);
}

#[test]
fn legacy_code_objects_survive_a_round_trip() {
    common::setup();

    let code = CodeObject {
        argcount: 1,
        nlocals: 1,
        stacksize: 3,
        code: vec![100, 0, 83, 0],
        consts: vec![Value::None],
        localsplusnames: vec!["a".into(), "b".into(), "c".into()],
        localspluskinds: vec![LocalKind::LOCAL, LocalKind::CELL, LocalKind::FREE],
        filename: "legacy.py".into(),
        name: "legacy".into(),
        qualname: "legacy".into(),
        firstlineno: 3,
        linetable: vec![0, 1],
        ..Default::default()
    };
    let value = Value::Code(Box::new(code));

    assert_eq!(loads(&dumps(&value, MarshalFormat::V310), MarshalFormat::V310), value);
}

#[test]
fn truncated_code_objects() {
    common::setup();

    let table = builtin_registry().unwrap().resolve(PyVersion::new(3, 12)).unwrap();
    let bytes = dumps(
        &Value::Code(Box::new(module_with_broken_function(&table))),
        MarshalFormat::V311,
    );

    for len in 0..bytes.len() {
        assert!(
            matches!(
                decode(&bytes[..len], &table),
                Err(DecodeError::Truncated { .. })
            ),
            "prefix of {len} bytes"
        );
    }
}

#[test]
fn batch_reports_failures_per_code_object() {
    common::setup();

    let table = builtin_registry().unwrap().resolve(PyVersion::new(3, 12)).unwrap();
    let bytes = dumps(
        &Value::Code(Box::new(module_with_broken_function(&table))),
        MarshalFormat::V311,
    );

    let tree = load_value(&bytes, (3, 12)).unwrap();
    let report = analyze_all(&tree, (3, 12)).unwrap();

    assert_eq!(
        report
            .analyses
            .iter()
            .map(|a| a.code.qualname.as_str())
            .collect::<Vec<_>>(),
        vec!["<module>", "outer.good"]
    );
    assert_eq!(
        report.failures,
        vec![Failure {
            index: 2,
            qualname: "outer.broken".into(),
            firstlineno: 1,
            error: Error::Decode(DecodeError::UnknownOpcode {
                offset: 2,
                opcode: 0xFF
            }),
        }]
    );
    assert_eq!(report.analyses[0].cfg.max_stack_depth(), 2);
}

#[test]
fn parallel_analysis_shares_one_table() {
    common::setup();

    let table = builtin_registry().unwrap().resolve(PyVersion::new(3, 14)).unwrap();
    let tree = decode(NESTED_314, &table).unwrap();

    let graphs = tree
        .code_objects()
        .par_iter()
        .map(|code| -> Result<ControlFlowGraph, Error> {
            let table = Arc::clone(&table);
            let instructions = decode_stream(&code.code, &table)?;

            Ok(analyze(&instructions, &table, None, &AnalysisOptions::default())?)
        })
        .collect::<Result<Vec<_>, Error>>()
        .unwrap();

    let report = analyze_all(&tree, (3, 14)).unwrap();

    assert_eq!(
        graphs,
        report
            .analyses
            .iter()
            .map(|a| a.cfg.clone())
            .collect::<Vec<_>>()
    );
}

#[test]
fn every_builtin_table_handles_extended_jumps() {
    common::setup();

    let registry = builtin_registry().unwrap();

    for version in registry.versions() {
        let table = registry.get(version).unwrap();

        let mut code = vec![("JUMP_FORWARD", 300)];
        code.extend(std::iter::repeat(("NOP", 0)).take(300));
        code.extend([("LOAD_CONST", 0), ("RETURN_VALUE", 0)]);

        let instructions = decode_stream(&assemble(table, &code), table).unwrap();

        assert_eq!(instructions[1].arg, 300, "Python {version}");
        assert_eq!(
            instructions
                .get_jump_target(1, table)
                .map(|(index, i)| (index, i.mnemonic)),
            Some((302, "LOAD_CONST")),
            "Python {version}"
        );

        let cfg = analyze(&instructions, table, None, &AnalysisOptions::default()).unwrap();

        assert_eq!(cfg.blocks.len(), 3, "Python {version}");
        assert_eq!(cfg.reachable(), vec![0, 2], "Python {version}");
        assert_eq!(cfg.blocks[1].entry_depth, None, "Python {version}");
        assert_eq!(cfg.max_stack_depth(), 1, "Python {version}");
    }
}

#[test]
fn every_builtin_table_lifts_the_same_statement() {
    common::setup();

    let registry = builtin_registry().unwrap();
    let name = |index| Expr::Load(Place::new(PlaceKind::Name, index));

    for version in registry.versions() {
        let table = registry.get(version).unwrap();
        let code = [
            ("LOAD_NAME", 0),
            ("LOAD_NAME", 1),
            ("IS_OP", 1),
            ("STORE_NAME", 2),
            ("LOAD_CONST", 0),
            ("RETURN_VALUE", 0),
        ];

        let instructions = decode_stream(&assemble(table, &code), table).unwrap();
        let options = AnalysisOptions::default();
        let cfg = analyze(&instructions, table, None, &options).unwrap();
        let sir = lift(&instructions, table, &cfg, &options).unwrap();
        let block = sir.block(0).unwrap();

        assert_eq!(
            block.statements,
            vec![Statement::Store {
                place: Place::new(PlaceKind::Name, 2),
                value: Expr::Binary {
                    op: Operator::plain(BinaryOp::IsNot),
                    lhs: Box::new(name(0)),
                    rhs: Box::new(name(1)),
                },
            }],
            "Python {version}"
        );
        assert_eq!(block.to_string(), "name[2] = (name[0] is not name[1])\nreturn consts[0]");
    }
}
