//! Decoder for the interpreter's marshal format.
//!
//! Every leading tag byte selects a rule. Composite rules recurse with an explicit depth counter, and
//! tags carrying the reference flag register their value in an arena so later `r` tags can cite it by
//! index. The parts that changed between releases (code object layout, container extents) come from a
//! [`MarshalFormat`].

pub mod format;

use indexmap::IndexSet;
use log::{debug, trace};
use num_bigint::BigInt;
use num_complex::Complex;
use num_traits::{ToPrimitive, Zero};
use ordered_float::OrderedFloat;

use crate::{
    error::DecodeError,
    opcodes::OpcodeTable,
    value::{CodeFlags, CodeObject, LocalKind, ObjectRef, Value, ValueTree},
};
use format::{CodeField, Extent, MarshalFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmarshalOptions {
    /// Maximum number of nested composites (containers and code objects)
    pub max_depth: usize,
    /// Stop after the first value instead of requiring it to span the whole input
    pub allow_trailing: bool,
}

impl Default for UnmarshalOptions {
    fn default() -> Self {
        UnmarshalOptions {
            max_depth: 200,
            allow_trailing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub tree: ValueTree,
    /// Bytes taken by the value, the remainder starts here
    pub consumed: usize,
}

/// Decodes one value spanning all of `bytes`, using the marshal rules of `table`'s interpreter version.
pub fn decode(bytes: &[u8], table: &OpcodeTable) -> Result<ValueTree, DecodeError> {
    debug!(
        "Unmarshalling {} bytes as Python {}",
        bytes.len(),
        table.version()
    );

    decode_with_options(bytes, table.marshal_format(), &UnmarshalOptions::default())
        .map(|decoded| decoded.tree)
}

pub fn decode_with_options(
    bytes: &[u8],
    format: &MarshalFormat,
    options: &UnmarshalOptions,
) -> Result<Decoded, DecodeError> {
    let mut unmarshaller = Unmarshaller::new(bytes, format, options);

    let root = unmarshaller.read_object()?;
    let consumed = unmarshaller.pos;

    if !options.allow_trailing && consumed < bytes.len() {
        return Err(DecodeError::TrailingData {
            offset: consumed,
            remaining: bytes.len() - consumed,
        });
    }

    debug!(
        "Decoded {} bytes, {} interned objects",
        consumed,
        unmarshaller.slots.len()
    );

    Ok(Decoded {
        tree: unmarshaller.finish(root),
        consumed,
    })
}

struct Unmarshaller<'a> {
    bytes: &'a [u8],
    pos: usize,
    format: &'a MarshalFormat,
    options: &'a UnmarshalOptions,
    depth: usize,
    /// `None` while the composite registered there is still being decoded
    slots: Vec<Option<Value>>,
    offsets: Vec<usize>,
}

/// Code object fields as they are read, before the layout specific parts are normalised
#[derive(Default)]
struct CodeParts {
    argcount: u32,
    posonlyargcount: u32,
    kwonlyargcount: u32,
    nlocals: u32,
    stacksize: u32,
    flags: u32,
    code: Vec<u8>,
    consts: Vec<Value>,
    names: Vec<String>,
    varnames: Vec<String>,
    freevars: Vec<String>,
    cellvars: Vec<String>,
    localsplusnames: Option<Vec<String>>,
    localspluskinds: Option<Vec<u8>>,
    filename: String,
    name: String,
    qualname: Option<String>,
    firstlineno: u32,
    linetable: Vec<u8>,
    exceptiontable: Vec<u8>,
}

impl CodeParts {
    fn into_code_object(self) -> CodeObject {
        let (localsplusnames, localspluskinds) =
            match (self.localsplusnames, self.localspluskinds) {
                (Some(names), Some(kinds)) => (
                    names,
                    kinds.into_iter().map(LocalKind::from_bits_retain).collect(),
                ),
                _ => {
                    let kinds = std::iter::repeat(LocalKind::LOCAL)
                        .take(self.varnames.len())
                        .chain(std::iter::repeat(LocalKind::CELL).take(self.cellvars.len()))
                        .chain(std::iter::repeat(LocalKind::FREE).take(self.freevars.len()))
                        .collect();

                    let names = self
                        .varnames
                        .into_iter()
                        .chain(self.cellvars)
                        .chain(self.freevars)
                        .collect();

                    (names, kinds)
                }
            };

        CodeObject {
            argcount: self.argcount,
            posonlyargcount: self.posonlyargcount,
            kwonlyargcount: self.kwonlyargcount,
            nlocals: self.nlocals,
            stacksize: self.stacksize,
            flags: CodeFlags::from_bits_retain(self.flags),
            code: self.code,
            consts: self.consts,
            names: self.names,
            localsplusnames,
            localspluskinds,
            qualname: self.qualname.unwrap_or_else(|| self.name.clone()),
            filename: self.filename,
            name: self.name,
            firstlineno: self.firstlineno,
            linetable: self.linetable,
            exceptiontable: self.exceptiontable,
        }
    }
}

impl<'a> Unmarshaller<'a> {
    fn new(bytes: &'a [u8], format: &'a MarshalFormat, options: &'a UnmarshalOptions) -> Self {
        Unmarshaller {
            bytes,
            pos: 0,
            format,
            options,
            depth: 0,
            slots: vec![],
            offsets: vec![],
        }
    }

    fn finish(self, root: Value) -> ValueTree {
        // Every reservation is filled once its composite completes
        let objects = self
            .slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Value::None))
            .collect();

        ValueTree::new(root, objects, self.offsets)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }

        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut array = [0; N];
        array.copy_from_slice(self.read_exact(N)?);
        Ok(array)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Payload with a `u32` length prefix
    fn read_sized(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }

    /// Payload with a single byte length prefix
    fn read_short_sized(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u8()? as usize;
        self.read_exact(len)
    }

    fn read_utf8(&mut self, short: bool) -> Result<String, DecodeError> {
        let offset = self.pos;
        let bytes = if short {
            self.read_short_sized()?
        } else {
            self.read_sized()?
        };

        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    fn read_text_float(&mut self) -> Result<OrderedFloat<f64>, DecodeError> {
        let offset = self.pos;
        let text = self.read_short_sized()?;

        std::str::from_utf8(text)
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
            .map(OrderedFloat)
            .ok_or(DecodeError::InvalidNumber { offset })
    }

    /// A long stored as a signed digit count followed by base 2**15 digits, least significant first.
    fn read_long(&mut self) -> Result<Value, DecodeError> {
        let offset = self.pos;
        let count = self.read_i32()?;
        let digits = self.read_exact(count.unsigned_abs() as usize * 2)?;

        let mut value = BigInt::zero();

        for digit in digits.chunks_exact(2).rev() {
            let digit = u16::from_le_bytes([digit[0], digit[1]]);

            if digit >= 1 << 15 {
                return Err(DecodeError::InvalidNumber { offset });
            }

            value = (value << 15u32) + digit;
        }

        if count < 0 {
            value = -value;
        }

        Ok(match value.to_i64() {
            Some(small) => Value::SmallInt(small),
            None => Value::BigInt(value),
        })
    }

    fn read_extent(&mut self, extent: Extent) -> Result<Option<usize>, DecodeError> {
        Ok(match extent {
            Extent::Count32 => Some(self.read_u32()? as usize),
            Extent::Count8 => Some(self.read_u8()? as usize),
            Extent::Sentinel => None,
        })
    }

    fn read_items(&mut self, extent: Extent) -> Result<Vec<Value>, DecodeError> {
        match self.read_extent(extent)? {
            Some(count) => {
                // A count can claim far more than the input holds
                let mut items = Vec::with_capacity(count.min(self.remaining()));

                for _ in 0..count {
                    items.push(self.read_object()?);
                }

                Ok(items)
            }
            None => {
                let mut items = vec![];

                while let Some(item) = self.read_entry()? {
                    items.push(item);
                }

                Ok(items)
            }
        }
    }

    fn read_pairs(&mut self, extent: Extent) -> Result<Vec<(Value, Value)>, DecodeError> {
        let mut pairs = vec![];

        match self.read_extent(extent)? {
            Some(count) => {
                for _ in 0..count {
                    let key = self.read_object()?;
                    pairs.push((key, self.read_object()?));
                }
            }
            None => {
                while let Some(key) = self.read_entry()? {
                    pairs.push((key, self.read_object()?));
                }
            }
        }

        Ok(pairs)
    }

    /// Set members in first occurrence order. Members are compared after resolving references to finished
    /// slots, so a reference and an inline copy of the same value count as duplicates.
    fn read_set_items(&mut self, extent: Extent) -> Result<Vec<Value>, DecodeError> {
        let items = self.read_items(extent)?;

        let mut seen = IndexSet::with_capacity(items.len());
        let unique: Vec<bool> = items
            .iter()
            .map(|item| seen.insert(self.member_key(item)))
            .collect();

        Ok(items
            .into_iter()
            .zip(unique)
            .filter_map(|(item, unique)| unique.then_some(item))
            .collect())
    }

    /// The value a set member stands for. References to slots still being decoded stay as they are.
    fn member_key<'v>(&'v self, item: &'v Value) -> &'v Value {
        match item {
            Value::Reference(ObjectRef(index)) => match self.slots.get(*index) {
                Some(Some(value)) => value,
                _ => item,
            },
            other => other,
        }
    }

    fn register(&mut self, value: Value, offset: usize) -> Value {
        self.slots.push(Some(value));
        self.offsets.push(offset);
        Value::Reference(ObjectRef(self.slots.len() - 1))
    }

    fn reserve(&mut self, offset: usize) -> usize {
        self.slots.push(None);
        self.offsets.push(offset);
        self.slots.len() - 1
    }

    fn read_object(&mut self) -> Result<Value, DecodeError> {
        let offset = self.pos;

        self.read_entry()?
            .ok_or(DecodeError::UnexpectedNull { offset })
    }

    /// Reads one value, `None` for the NULL tag
    fn read_entry(&mut self) -> Result<Option<Value>, DecodeError> {
        let offset = self.pos;
        let byte = self.read_u8()?;

        let flagged = byte & self.format.ref_flag != 0;
        let tag = byte & !self.format.ref_flag;

        trace!("{:?} at offset {offset}{}", tag as char, if flagged { " (ref)" } else { "" });

        let value = match tag {
            b'0' => return Ok(None),
            b'N' => Value::None,
            b'T' => Value::Bool(true),
            b'F' => Value::Bool(false),
            b'S' => Value::StopIteration,
            b'.' => Value::Ellipsis,
            b'i' => Value::SmallInt(self.read_i32()?.into()),
            b'I' => Value::SmallInt(i64::from_le_bytes(self.read_array()?)),
            b'l' => self.read_long()?,
            b'g' => Value::Float(OrderedFloat(self.read_f64()?)),
            b'f' => Value::Float(self.read_text_float()?),
            b'y' => {
                let re = self.read_f64()?;
                Value::Complex(Complex::new(OrderedFloat(re), OrderedFloat(self.read_f64()?)))
            }
            b'x' => {
                let re = self.read_text_float()?;
                Value::Complex(Complex::new(re, self.read_text_float()?))
            }
            b's' => Value::Bytes(self.read_sized()?.to_vec()),
            b'u' | b't' | b'a' | b'A' => Value::String(self.read_utf8(false)?),
            b'z' | b'Z' => Value::String(self.read_utf8(true)?),
            b'r' => {
                let index = self.read_u32()?;

                if index as usize >= self.slots.len() {
                    return Err(DecodeError::BadReference {
                        offset,
                        index,
                        registered: self.slots.len(),
                    });
                }

                return Ok(Some(Value::Reference(ObjectRef(index as usize))));
            }
            b'(' | b')' | b'[' | b'{' | b'<' | b'>' | b'c' => {
                return self.read_composite(tag, flagged, offset).map(Some);
            }
            _ => return Err(DecodeError::MalformedTag { offset, tag: byte }),
        };

        Ok(Some(if flagged {
            self.register(value, offset)
        } else {
            value
        }))
    }

    fn read_composite(&mut self, tag: u8, flagged: bool, offset: usize) -> Result<Value, DecodeError> {
        self.depth += 1;

        if self.depth > self.options.max_depth {
            return Err(DecodeError::TooDeep {
                offset,
                limit: self.options.max_depth,
            });
        }

        // Reserved before the children so their references see the final index
        let slot = flagged.then(|| self.reserve(offset));

        let format = self.format;
        let value = match tag {
            b'(' => Value::Tuple(self.read_items(format.tuple)?),
            b')' => Value::Tuple(self.read_items(format.small_tuple)?),
            b'[' => Value::List(self.read_items(format.list)?),
            b'{' => Value::Dict(self.read_pairs(format.dict)?),
            b'<' => Value::Set(self.read_set_items(format.set)?),
            b'>' => Value::FrozenSet(self.read_set_items(format.frozenset)?),
            _ => Value::Code(Box::new(self.read_code()?)),
        };

        self.depth -= 1;

        Ok(match slot {
            Some(index) => {
                self.slots[index] = Some(value);
                Value::Reference(ObjectRef(index))
            }
            None => value,
        })
    }

    fn read_code(&mut self) -> Result<CodeObject, DecodeError> {
        let mut parts = CodeParts::default();

        for field in self.format.code_layout {
            match field {
                CodeField::ArgCount => parts.argcount = self.read_u32()?,
                CodeField::PosOnlyArgCount => parts.posonlyargcount = self.read_u32()?,
                CodeField::KwOnlyArgCount => parts.kwonlyargcount = self.read_u32()?,
                CodeField::NLocals => parts.nlocals = self.read_u32()?,
                CodeField::StackSize => parts.stacksize = self.read_u32()?,
                CodeField::Flags => parts.flags = self.read_u32()?,
                CodeField::FirstLineNo => parts.firstlineno = self.read_u32()?,
                CodeField::Code => parts.code = self.read_bytes_field()?,
                CodeField::Consts => parts.consts = self.read_tuple_field()?,
                CodeField::Names => parts.names = self.read_names_field()?,
                CodeField::VarNames => parts.varnames = self.read_names_field()?,
                CodeField::FreeVars => parts.freevars = self.read_names_field()?,
                CodeField::CellVars => parts.cellvars = self.read_names_field()?,
                CodeField::LocalsPlusNames => {
                    parts.localsplusnames = Some(self.read_names_field()?)
                }
                CodeField::LocalsPlusKinds => {
                    parts.localspluskinds = Some(self.read_bytes_field()?)
                }
                CodeField::FileName => parts.filename = self.read_str_field()?,
                CodeField::Name => parts.name = self.read_str_field()?,
                CodeField::QualName => parts.qualname = Some(self.read_str_field()?),
                CodeField::LineTable => parts.linetable = self.read_bytes_field()?,
                CodeField::ExceptionTable => parts.exceptiontable = self.read_bytes_field()?,
            }
        }

        Ok(parts.into_code_object())
    }

    /// Follows a reference for a field that needs the finished value
    fn resolve<'v>(&'v self, value: &'v Value, offset: usize) -> Result<&'v Value, DecodeError> {
        match value {
            Value::Reference(ObjectRef(index)) => match self.slots.get(*index) {
                Some(Some(value)) => Ok(value),
                Some(None) => Err(DecodeError::RecursiveReference {
                    offset,
                    index: *index as u32,
                }),
                None => Err(DecodeError::BadReference {
                    offset,
                    index: *index as u32,
                    registered: self.slots.len(),
                }),
            },
            value => Ok(value),
        }
    }

    fn read_bytes_field(&mut self) -> Result<Vec<u8>, DecodeError> {
        let offset = self.pos;
        let value = self.read_object()?;

        match self.resolve(&value, offset)? {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(DecodeError::UnexpectedType {
                offset,
                expected: "bytes",
            }),
        }
    }

    fn read_str_field(&mut self) -> Result<String, DecodeError> {
        let offset = self.pos;
        let value = self.read_object()?;

        match self.resolve(&value, offset)? {
            Value::String(s) => Ok(s.clone()),
            _ => Err(DecodeError::UnexpectedType {
                offset,
                expected: "str",
            }),
        }
    }

    /// Tuple elements are kept as decoded, references included
    fn read_tuple_field(&mut self) -> Result<Vec<Value>, DecodeError> {
        let offset = self.pos;
        let value = self.read_object()?;

        match self.resolve(&value, offset)? {
            Value::Tuple(items) => Ok(items.clone()),
            _ => Err(DecodeError::UnexpectedType {
                offset,
                expected: "tuple",
            }),
        }
    }

    fn read_names_field(&mut self) -> Result<Vec<String>, DecodeError> {
        let offset = self.pos;

        self.read_tuple_field()?
            .iter()
            .map(|item| match self.resolve(item, offset)? {
                Value::String(s) => Ok(s.clone()),
                _ => Err(DecodeError::UnexpectedType {
                    offset,
                    expected: "tuple of str",
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn loads(bytes: &[u8]) -> Result<ValueTree, DecodeError> {
        decode_with_options(bytes, &MarshalFormat::V311, &UnmarshalOptions::default())
            .map(|decoded| decoded.tree)
    }

    fn materialized(bytes: &[u8]) -> Value {
        let tree = loads(bytes).unwrap();
        tree.materialize(tree.root()).unwrap()
    }

    // def f():
    //     return 5
    const TRIVIAL: &[u8] = include_bytes!("../../tests/data/trivial_314.bin");

    // def f(x):
    //     def g(y):
    //         return x+y
    //     return g
    const NESTED: &[u8] = include_bytes!("../../tests/data/nested_314.bin");

    #[test]
    fn singletons() {
        assert_eq!(materialized(b"N"), Value::None);
        assert_eq!(materialized(b"T"), Value::Bool(true));
        assert_eq!(materialized(b"F"), Value::Bool(false));
        assert_eq!(materialized(b"S"), Value::StopIteration);
        assert_eq!(materialized(b"."), Value::Ellipsis);
    }

    #[test]
    fn numbers() {
        assert_eq!(materialized(b"i\x01\x01\x00\x00"), Value::SmallInt(257));
        assert_eq!(
            materialized(b"I\xff\xff\xff\xff\xff\xff\xff\xff"),
            Value::SmallInt(-1)
        );
        assert_eq!(materialized(b"f\x04257."), Value::Float(OrderedFloat(257.0)));
        assert_eq!(
            materialized(b"g\x00\x00\x00\x00\x00\x00\xf0?"),
            Value::Float(OrderedFloat(1.0))
        );
        assert_eq!(
            materialized(b"x\x03257\x05-257."),
            Value::Complex(Complex::new(OrderedFloat(257.0), OrderedFloat(-257.0)))
        );
        assert_eq!(
            loads(b"f\x03abc"),
            Err(DecodeError::InvalidNumber { offset: 1 })
        );
    }

    #[test]
    fn longs() {
        // 1 + 1 * 2**15
        assert_eq!(
            materialized(b"l\x02\x00\x00\x00\x01\x00\x01\x00"),
            Value::SmallInt(32769)
        );
        assert_eq!(
            materialized(b"l\xfe\xff\xff\xff\x01\x00\x01\x00"),
            Value::SmallInt(-32769)
        );
        // 2**75 does not fit an i64
        assert_eq!(
            materialized(b"l\x06\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x01\x00"),
            Value::BigInt(BigInt::from(1) << 75u32)
        );
        assert_eq!(
            loads(b"l\x01\x00\x00\x00\x00\x80"),
            Err(DecodeError::InvalidNumber { offset: 1 })
        );
    }

    #[test]
    fn strings() {
        for bytes in [
            &b"u\x03\x00\x00\x00abc"[..],
            b"t\x03\x00\x00\x00abc",
            b"a\x03\x00\x00\x00abc",
            b"A\x03\x00\x00\x00abc",
            b"z\x03abc",
            b"Z\x03abc",
        ] {
            assert_eq!(materialized(bytes), Value::String("abc".into()));
        }

        assert_eq!(materialized(b"s\x02\x00\x00\x00\xff\x00"), Value::Bytes(vec![0xff, 0]));
        assert_eq!(
            loads(b"u\x01\x00\x00\x00\xff"),
            Err(DecodeError::InvalidUtf8 { offset: 1 })
        );
    }

    #[test]
    fn shared_references() {
        let tree = loads(b"\xa9\x02\xe9\x01\x00\x00\x00r\x01\x00\x00\x00").unwrap();

        assert_eq!(
            tree.root(),
            &Value::Tuple(vec![
                Value::Reference(ObjectRef(1)),
                Value::Reference(ObjectRef(1))
            ])
        );
        assert_eq!(tree.get(ObjectRef(1)), Some(&Value::SmallInt(1)));
        assert_eq!(tree.offset_of(ObjectRef(1)), Some(2));
    }

    #[test]
    fn dicts_end_at_null() {
        assert_eq!(
            materialized(b"{\xda\x01a\xe9\x01\x00\x00\x00\xda\x01br\x00\x00\x00\x000"),
            Value::Dict(vec![
                (Value::String("a".into()), Value::SmallInt(1)),
                (Value::String("b".into()), Value::String("a".into())),
            ])
        );
    }

    #[test]
    fn sets_drop_duplicates() {
        assert_eq!(
            materialized(b"<\x03\x00\x00\x00\xe9\x02\x00\x00\x00\xe9\x01\x00\x00\x00r\x00\x00\x00\x00"),
            Value::Set(vec![Value::SmallInt(2), Value::SmallInt(1)])
        );
        assert_eq!(
            materialized(b">\x02\x00\x00\x00NN"),
            Value::FrozenSet(vec![Value::None])
        );
    }

    #[test]
    fn set_members_compare_through_references() {
        // ("a", {r0, "a"})
        assert_eq!(
            materialized(b")\x02\xda\x01a<\x02\x00\x00\x00r\x00\x00\x00\x00z\x01a"),
            Value::Tuple(vec![
                Value::String("a".into()),
                Value::Set(vec![Value::String("a".into())]),
            ])
        );
    }

    #[test]
    fn large_sets() {
        let count = 200_000u32;
        let mut bytes = vec![b'<'];
        bytes.extend_from_slice(&count.to_le_bytes());
        for n in 0..count {
            bytes.push(b'i');
            bytes.extend_from_slice(&(n % 150_000).to_le_bytes());
        }

        let Value::Set(items) = loads(&bytes).unwrap().root().clone() else {
            panic!("expected a set");
        };

        assert_eq!(items.len(), 150_000);
        assert_eq!(items[149_999], Value::SmallInt(149_999));
    }

    #[test]
    fn trivial_code_object() {
        let tree = loads(TRIVIAL).unwrap();
        let code = tree.root_code().unwrap();

        assert_eq!(code.argcount, 0);
        assert_eq!(code.stacksize, 1);
        assert_eq!(code.flags, CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS);
        assert_eq!(code.code, b"\x80\x00^\x05#\x00");
        assert_eq!(code.consts, vec![Value::Reference(ObjectRef(2))]);
        assert_eq!(tree.resolve(&code.consts[0]), Some(&Value::SmallInt(5)));
        assert!(code.names.is_empty());
        assert!(code.localsplusnames.is_empty());
        assert_eq!(code.filename, "example");
        assert_eq!(code.name, "f");
        assert_eq!(code.qualname, "f");
        assert_eq!(code.firstlineno, 1);
        assert_eq!(code.linetable, b"\x80\x00\xd9\x0b\x0c");
        assert!(code.exceptiontable.is_empty());
    }

    #[test]
    fn nested_code_objects() {
        let tree = loads(NESTED).unwrap();
        let codes = tree.code_objects();

        assert_eq!(
            codes.iter().map(|c| c.qualname.as_str()).collect::<Vec<_>>(),
            vec!["f", "f.<locals>.g"]
        );

        let (f, g) = (codes[0], codes[1]);

        assert_eq!(f.varnames(), vec!["x", "g"]);
        assert_eq!(f.cellvars(), vec!["x"]);
        assert_eq!(g.varnames(), vec!["y"]);
        assert_eq!(g.freevars(), vec!["x"]);
        assert_eq!(g.firstlineno, 2);
        // Both name tuples cite the same interned empty tuple
        assert!(f.names.is_empty() && g.names.is_empty());
    }

    #[test]
    fn every_prefix_is_truncated() {
        for len in 0..NESTED.len() {
            let result = loads(&NESTED[..len]);

            assert!(
                matches!(result, Err(DecodeError::Truncated { .. })),
                "prefix of {len} bytes gave {result:?}"
            );
        }
    }

    #[test]
    fn decoding_is_idempotent() {
        assert_eq!(loads(NESTED).unwrap(), loads(NESTED).unwrap());
    }

    #[test]
    fn depth_is_capped() {
        let mut bytes = b"[\x01\x00\x00\x00".repeat(10_000);
        bytes.push(b'N');

        assert_eq!(
            loads(&bytes),
            Err(DecodeError::TooDeep {
                offset: 1000,
                limit: 200
            })
        );

        let options = UnmarshalOptions {
            max_depth: 10_001,
            ..Default::default()
        };
        let shallow = b"[\x01\x00\x00\x00[\x00\x00\x00\x00";
        assert!(decode_with_options(shallow, &MarshalFormat::V311, &options).is_ok());
    }

    #[test]
    fn bad_references() {
        assert_eq!(
            loads(b"(\x02\x00\x00\x00\xe9\x01\x00\x00\x00r\x01\x00\x00\x00"),
            Err(DecodeError::BadReference {
                offset: 10,
                index: 1,
                registered: 1
            })
        );
    }

    #[test]
    fn self_reference_is_kept_as_reference() {
        let tree = loads(b"\xa9\x01r\x00\x00\x00\x00").unwrap();

        assert_eq!(tree.root(), &Value::Tuple(vec![Value::Reference(ObjectRef(0))]));
        assert_eq!(
            tree.materialize(tree.root()),
            Err(DecodeError::RecursiveReference {
                offset: 0,
                index: 0
            })
        );
    }

    #[test]
    fn code_field_citing_itself() {
        // A code object whose bytecode field points back at the code object
        let mut bytes = b"\xe3".to_vec();
        bytes.extend([0; 20]);
        bytes.extend(b"r\x00\x00\x00\x00");

        assert_eq!(
            loads(&bytes),
            Err(DecodeError::RecursiveReference {
                offset: 21,
                index: 0
            })
        );
    }

    #[test]
    fn malformed_tags() {
        assert_eq!(loads(b"?"), Err(DecodeError::MalformedTag { offset: 0, tag: b'?' }));
        assert_eq!(
            loads(b"(\x01\x00\x00\x00W"),
            Err(DecodeError::MalformedTag { offset: 5, tag: b'W' })
        );
        assert_eq!(
            loads(b"[\x01\x00\x00\x000"),
            Err(DecodeError::UnexpectedNull { offset: 5 })
        );
    }

    #[test]
    fn trailing_data() {
        assert_eq!(
            loads(b"NN"),
            Err(DecodeError::TrailingData {
                offset: 1,
                remaining: 1
            })
        );

        let options = UnmarshalOptions {
            allow_trailing: true,
            ..Default::default()
        };
        let decoded = decode_with_options(b"NN", &MarshalFormat::V311, &options).unwrap();

        assert_eq!(decoded.consumed, 1);
        assert_eq!(decoded.tree.root(), &Value::None);
    }

    #[test]
    fn legacy_layout_is_normalised() {
        let mut bytes = b"c".to_vec();
        // argcount, posonly, kwonly, nlocals, stacksize, flags
        for field in [1u32, 0, 0, 2, 2, 0x43] {
            bytes.extend(field.to_le_bytes());
        }
        bytes.extend(b"s\x04\x00\x00\x00d\x00S\x00"); // code
        bytes.extend(b")\x01N"); // consts
        bytes.extend(b")\x00"); // names
        bytes.extend(b")\x02z\x01az\x01b"); // varnames
        bytes.extend(b")\x01z\x01c"); // freevars
        bytes.extend(b")\x00"); // cellvars
        bytes.extend(b"z\x04m.py"); // filename
        bytes.extend(b"z\x01h"); // name
        bytes.extend(7u32.to_le_bytes());
        bytes.extend(b"s\x00\x00\x00\x00"); // lnotab

        let tree =
            decode_with_options(&bytes, &MarshalFormat::V310, &UnmarshalOptions::default())
                .unwrap()
                .tree;
        let code = tree.root_code().unwrap();

        assert_eq!(code.nlocals, 2);
        assert_eq!(code.localsplusnames, vec!["a", "b", "c"]);
        assert_eq!(code.varnames(), vec!["a", "b"]);
        assert_eq!(code.freevars(), vec!["c"]);
        assert_eq!(code.qualname, "h");
        assert_eq!(code.firstlineno, 7);
        assert!(code.exceptiontable.is_empty());
    }
}
