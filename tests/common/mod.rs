#![allow(dead_code)]

use std::sync::Once;

use num_bigint::{BigInt, Sign};
use num_traits::{ToPrimitive, Zero};
use pyc_analyzer::{
    opcodes::OpcodeTable,
    unmarshal::format::{CodeField, MarshalFormat},
    value::{CodeObject, Value},
};

pub const TRIVIAL_314: &[u8] = include_bytes!("../data/trivial_314.bin");
pub const NESTED_314: &[u8] = include_bytes!("../data/nested_314.bin");

static LOGGER_INIT: Once = Once::new();

pub fn setup() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Serializes values the way the interpreter's marshal module does, for a given code object layout.
/// Nothing is flagged for the reference table unless written through [`Writer::write_flagged`].
pub struct Writer {
    format: MarshalFormat,
    out: Vec<u8>,
}

impl Writer {
    pub fn new(format: MarshalFormat) -> Self {
        Writer {
            format,
            out: vec![],
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn sized(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.out.extend_from_slice(bytes);
    }

    /// Writes a value with the reference flag set on its tag
    pub fn write_flagged(&mut self, value: &Value) -> &mut Self {
        let start = self.out.len();
        self.write(value);
        self.out[start] |= self.format.ref_flag;
        self
    }

    pub fn write_ref(&mut self, index: u32) -> &mut Self {
        self.out.push(b'r');
        self.u32(index);
        self
    }

    /// Starts a small tuple whose items the caller writes next
    pub fn begin_tuple(&mut self, len: u8) -> &mut Self {
        self.out.extend_from_slice(&[b')', len]);
        self
    }

    pub fn write_null(&mut self) -> &mut Self {
        self.out.push(b'0');
        self
    }

    pub fn write(&mut self, value: &Value) -> &mut Self {
        match value {
            Value::None => self.out.push(b'N'),
            Value::StopIteration => self.out.push(b'S'),
            Value::Ellipsis => self.out.push(b'.'),
            Value::Bool(true) => self.out.push(b'T'),
            Value::Bool(false) => self.out.push(b'F'),
            Value::SmallInt(n) => match i32::try_from(*n) {
                Ok(small) => {
                    self.out.push(b'i');
                    self.out.extend_from_slice(&small.to_le_bytes());
                }
                Err(_) => self.long(&BigInt::from(*n)),
            },
            Value::BigInt(n) => self.long(n),
            Value::Float(f) => {
                self.out.push(b'g');
                self.out.extend_from_slice(&f.0.to_le_bytes());
            }
            Value::Complex(c) => {
                self.out.push(b'y');
                self.out.extend_from_slice(&c.re.0.to_le_bytes());
                self.out.extend_from_slice(&c.im.0.to_le_bytes());
            }
            Value::Bytes(bytes) => {
                self.out.push(b's');
                self.sized(bytes);
            }
            Value::String(s) => self.string(s),
            Value::Tuple(items) => {
                if items.len() < 256 {
                    self.out.push(b')');
                    self.out.push(items.len() as u8);
                } else {
                    self.out.push(b'(');
                    self.u32(items.len() as u32);
                }
                self.items(items);
            }
            Value::List(items) => {
                self.out.push(b'[');
                self.u32(items.len() as u32);
                self.items(items);
            }
            Value::Dict(pairs) => {
                self.out.push(b'{');
                for (key, value) in pairs {
                    self.write(key).write(value);
                }
                self.write_null();
            }
            Value::Set(items) => {
                self.out.push(b'<');
                self.u32(items.len() as u32);
                self.items(items);
            }
            Value::FrozenSet(items) => {
                self.out.push(b'>');
                self.u32(items.len() as u32);
                self.items(items);
            }
            Value::Code(code) => self.code(code),
            Value::Reference(index) => {
                self.write_ref(index.0 as u32);
            }
        }

        self
    }

    fn items(&mut self, items: &[Value]) {
        for item in items {
            self.write(item);
        }
    }

    fn string(&mut self, s: &str) {
        if s.is_ascii() && s.len() < 256 {
            self.out.push(b'z');
            self.out.push(s.len() as u8);
            self.out.extend_from_slice(s.as_bytes());
        } else {
            self.out.push(b'u');
            self.sized(s.as_bytes());
        }
    }

    fn long(&mut self, n: &BigInt) {
        let mut magnitude = n.magnitude().clone();
        let mut digits = vec![];

        while !magnitude.is_zero() {
            let digit = (&magnitude & num_bigint::BigUint::from(0x7FFFu32))
                .to_u16()
                .unwrap();
            digits.push(digit);
            magnitude >>= 15u32;
        }

        let count = digits.len() as i32;

        self.out.push(b'l');
        self.out.extend_from_slice(
            &(if n.sign() == Sign::Minus { -count } else { count }).to_le_bytes(),
        );
        for digit in digits {
            self.out.extend_from_slice(&digit.to_le_bytes());
        }
    }

    fn names(&mut self, names: &[&str]) {
        let names: Vec<Value> = names.iter().map(|n| Value::String(n.to_string())).collect();
        self.write(&Value::Tuple(names));
    }

    fn code(&mut self, code: &CodeObject) {
        self.out.push(b'c');

        for field in self.format.code_layout {
            match field {
                CodeField::ArgCount => self.u32(code.argcount),
                CodeField::PosOnlyArgCount => self.u32(code.posonlyargcount),
                CodeField::KwOnlyArgCount => self.u32(code.kwonlyargcount),
                CodeField::NLocals => self.u32(code.nlocals),
                CodeField::StackSize => self.u32(code.stacksize),
                CodeField::Flags => self.u32(code.flags.bits()),
                CodeField::FirstLineNo => self.u32(code.firstlineno),
                CodeField::Code => {
                    self.write(&Value::Bytes(code.code.clone()));
                }
                CodeField::Consts => {
                    self.write(&Value::Tuple(code.consts.clone()));
                }
                CodeField::Names => {
                    let names: Vec<&str> = code.names.iter().map(String::as_str).collect();
                    self.names(&names);
                }
                CodeField::VarNames => self.names(&code.varnames()),
                CodeField::FreeVars => self.names(&code.freevars()),
                CodeField::CellVars => self.names(&code.cellvars()),
                CodeField::LocalsPlusNames => {
                    let names: Vec<&str> =
                        code.localsplusnames.iter().map(String::as_str).collect();
                    self.names(&names);
                }
                CodeField::LocalsPlusKinds => {
                    let kinds = code.localspluskinds.iter().map(|k| k.bits()).collect();
                    self.write(&Value::Bytes(kinds));
                }
                CodeField::FileName => self.string(&code.filename),
                CodeField::Name => self.string(&code.name),
                CodeField::QualName => self.string(&code.qualname),
                CodeField::LineTable => {
                    self.write(&Value::Bytes(code.linetable.clone()));
                }
                CodeField::ExceptionTable => {
                    self.write(&Value::Bytes(code.exceptiontable.clone()));
                }
            }
        }
    }
}

pub fn dumps(value: &Value, format: MarshalFormat) -> Vec<u8> {
    let mut writer = Writer::new(format);
    writer.write(value);
    writer.finish()
}

/// Encodes `(mnemonic, operand)` pairs with zeroed inline caches. Operands above a byte get
/// EXTENDED_ARG prefixes.
pub fn assemble(table: &OpcodeTable, code: &[(&str, u32)]) -> Vec<u8> {
    let mut out = vec![];

    for (mnemonic, arg) in code {
        let info = table
            .by_mnemonic(mnemonic)
            .unwrap_or_else(|| panic!("{mnemonic} is not in the {} table", table.version()));

        let extended = table.extended_arg().unwrap();
        for shift in [24, 16, 8] {
            if *arg >> shift != 0 {
                out.extend_from_slice(&[extended, (arg >> shift) as u8]);
            }
        }

        out.extend_from_slice(&[info.code, *arg as u8]);
        out.resize(out.len() + info.cache_entries as usize * table.code_unit() as usize, 0);
    }

    out
}

/// A function with only the fields analysis looks at
pub fn function(qualname: &str, code: Vec<u8>, consts: Vec<Value>) -> CodeObject {
    CodeObject {
        stacksize: 2,
        code,
        consts,
        filename: "<test>".into(),
        name: qualname.rsplit('.').next().unwrap_or(qualname).into(),
        qualname: qualname.into(),
        firstlineno: 1,
        ..Default::default()
    }
}
