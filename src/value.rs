use bitflags::bitflags;
use num_bigint::BigInt;
use num_complex::Complex;
use ordered_float::OrderedFloat;

use crate::error::DecodeError;

/// Limit used by [`ValueTree::materialize`]. Shared objects are copied at every use, so the materialized
/// tree can nest deeper than the encoded one.
pub const MATERIALIZE_DEPTH_LIMIT: usize = 512;

/// Index into the interning table of a [`ValueTree`], in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub usize);

bitflags! {
    /// `co_flags` of a code object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x1;
        const NEWLOCALS = 0x2;
        const VARARGS = 0x4;
        const VARKEYWORDS = 0x8;
        const NESTED = 0x10;
        const GENERATOR = 0x20;
        const NOFREE = 0x40;
        const COROUTINE = 0x80;
        const ITERABLE_COROUTINE = 0x100;
        const ASYNC_GENERATOR = 0x200;
        const HAS_DOCSTRING = 0x4000000;
        const METHOD = 0x8000000;
        const FUTURE_DIVISION = 0x20000;
        const FUTURE_ABSOLUTE_IMPORT = 0x40000;
        const FUTURE_WITH_STATEMENT = 0x80000;
        const FUTURE_PRINT_FUNCTION = 0x100000;
        const FUTURE_UNICODE_LITERALS = 0x200000;
        const FUTURE_BARRY_AS_BDFL = 0x400000;
        const FUTURE_GENERATOR_STOP = 0x800000;
        const FUTURE_ANNOTATIONS = 0x1000000;
    }
}

bitflags! {
    /// Kind of a "fast locals plus" slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LocalKind: u8 {
        const ARG_POS = 0x02;
        const ARG_KW = 0x04;
        const ARG_VAR = 0x08;
        const HIDDEN = 0x10;
        const LOCAL = 0x20;
        const CELL = 0x40;
        const FREE = 0x80;
    }
}

/// A decoded marshal object.
///
/// Objects flagged for interning live in the [`ValueTree`] arena and every site citing them, including the
/// first one, holds a [`Value::Reference`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    None,
    StopIteration,
    Ellipsis,
    Bool(bool),
    SmallInt(i64),
    BigInt(BigInt),
    Float(OrderedFloat<f64>),
    Complex(Complex<OrderedFloat<f64>>),
    Bytes(Vec<u8>),
    String(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// Key/value pairs in encoded order
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Code(Box<CodeObject>),
    Reference(ObjectRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::StopIteration => "StopIteration",
            Value::Ellipsis => "Ellipsis",
            Value::Bool(_) => "bool",
            Value::SmallInt(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(_) => "complex",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Code(_) => "code",
            Value::Reference(_) => "reference",
        }
    }

    pub fn as_code(&self) -> Option<&CodeObject> {
        match self {
            Value::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Direct children in encoded order. Dict pairs yield the key before the value.
    fn children(&self) -> Vec<&Value> {
        match self {
            Value::Tuple(items) | Value::List(items) | Value::Set(items) | Value::FrozenSet(items) => {
                items.iter().collect()
            }
            Value::Dict(pairs) => pairs.iter().flat_map(|(k, v)| [k, v]).collect(),
            Value::Code(code) => code.consts.iter().collect(),
            _ => vec![],
        }
    }
}

/// A compiled unit with its version specific field layout normalised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CodeObject {
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    /// Zero for layouts that no longer store it
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    /// For layouts with separate varnames, cellvars and freevars this is their concatenation in that order
    pub localsplusnames: Vec<String>,
    pub localspluskinds: Vec<LocalKind>,
    pub filename: String,
    pub name: String,
    /// Equal to `name` for layouts without a qualified name
    pub qualname: String,
    pub firstlineno: u32,
    /// Line number table, kept verbatim (lnotab or the newer location table)
    pub linetable: Vec<u8>,
    /// Exception table, kept verbatim. Empty for versions without one.
    pub exceptiontable: Vec<u8>,
}

impl CodeObject {
    fn names_of_kind(&self, kind: LocalKind) -> Vec<&str> {
        self.localsplusnames
            .iter()
            .zip(self.localspluskinds.iter())
            .filter(|(_, k)| k.contains(kind))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn varnames(&self) -> Vec<&str> {
        self.names_of_kind(LocalKind::LOCAL)
    }

    pub fn cellvars(&self) -> Vec<&str> {
        self.names_of_kind(LocalKind::CELL)
    }

    pub fn freevars(&self) -> Vec<&str> {
        self.names_of_kind(LocalKind::FREE)
    }
}

/// The result of one decode: the top level value plus the interning arena its references point into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTree {
    root: Value,
    objects: Vec<Value>,
    /// Byte offset each object was registered at
    offsets: Vec<usize>,
}

impl ValueTree {
    pub(crate) fn new(root: Value, objects: Vec<Value>, offsets: Vec<usize>) -> Self {
        ValueTree {
            root,
            objects,
            offsets,
        }
    }

    /// The top level value with a leading reference resolved.
    pub fn root(&self) -> &Value {
        self.resolve(&self.root).unwrap_or(&self.root)
    }

    pub fn root_code(&self) -> Option<&CodeObject> {
        self.root().as_code()
    }

    pub fn objects(&self) -> &[Value] {
        &self.objects
    }

    pub fn get(&self, index: ObjectRef) -> Option<&Value> {
        self.objects.get(index.0)
    }

    /// Byte offset of the tag that registered `index`.
    pub fn offset_of(&self, index: ObjectRef) -> Option<usize> {
        self.offsets.get(index.0).copied()
    }

    /// Follows a reference one step. Arena slots never hold references themselves, so this is all the
    /// resolution a consumer needs. Non-reference values are returned as is.
    pub fn resolve<'a>(&'a self, value: &'a Value) -> Option<&'a Value> {
        match value {
            Value::Reference(index) => self.get(*index),
            other => Some(other),
        }
    }

    /// Deep copy of `value` with every reference inlined.
    pub fn materialize(&self, value: &Value) -> Result<Value, DecodeError> {
        let mut active = vec![false; self.objects.len()];
        self.materialize_inner(value, &mut active, 0, 0)
    }

    /// `origin` is the input offset of the innermost object being expanded, reported when the depth limit
    /// is hit.
    fn materialize_inner(
        &self,
        value: &Value,
        active: &mut [bool],
        depth: usize,
        origin: usize,
    ) -> Result<Value, DecodeError> {
        if depth > MATERIALIZE_DEPTH_LIMIT {
            return Err(DecodeError::TooDeep {
                offset: origin,
                limit: MATERIALIZE_DEPTH_LIMIT,
            });
        }

        let items = |items: &[Value], active: &mut [bool]| {
            items
                .iter()
                .map(|v| self.materialize_inner(v, active, depth + 1, origin))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(match value {
            Value::Reference(index) => {
                let offset = self.offset_of(*index).unwrap_or(0);
                let target = self.get(*index).ok_or(DecodeError::BadReference {
                    offset,
                    index: index.0 as u32,
                    registered: self.objects.len(),
                })?;

                if active[index.0] {
                    return Err(DecodeError::RecursiveReference {
                        offset,
                        index: index.0 as u32,
                    });
                }

                active[index.0] = true;
                let result = self.materialize_inner(target, active, depth + 1, offset);
                active[index.0] = false;

                result?
            }
            Value::Tuple(v) => Value::Tuple(items(v, active)?),
            Value::List(v) => Value::List(items(v, active)?),
            Value::Set(v) => Value::Set(items(v, active)?),
            Value::FrozenSet(v) => Value::FrozenSet(items(v, active)?),
            Value::Dict(pairs) => Value::Dict(
                pairs
                    .iter()
                    .map(|(k, v)| {
                        Ok((
                            self.materialize_inner(k, active, depth + 1, origin)?,
                            self.materialize_inner(v, active, depth + 1, origin)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?,
            ),
            Value::Code(code) => {
                let mut code = code.clone();
                code.consts = items(&code.consts, active)?;
                Value::Code(code)
            }
            scalar => scalar.clone(),
        })
    }

    /// Every code object reachable from the root in pre-order, nested ones included. Each arena slot is
    /// visited once no matter how many sites cite it.
    pub fn code_objects(&self) -> Vec<&CodeObject> {
        let mut found = vec![];
        let mut visited = vec![false; self.objects.len()];
        let mut stack = vec![&self.root];

        while let Some(value) = stack.pop() {
            let value = match value {
                Value::Reference(index) => {
                    match visited.get_mut(index.0) {
                        Some(seen) if !*seen => *seen = true,
                        _ => continue,
                    }

                    match self.get(*index) {
                        Some(value) => value,
                        None => continue,
                    }
                }
                value => value,
            };

            if let Value::Code(code) = value {
                found.push(code.as_ref());
            }

            stack.extend(value.children().into_iter().rev());
        }

        found
    }
}
