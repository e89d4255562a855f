//! Marshal layout rules that differ between interpreter releases.

/// How a container declares its number of elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// Little endian `u32` count before the elements
    Count32,
    /// Single byte count before the elements
    Count8,
    /// Elements until a NULL tag
    Sentinel,
}

/// A field of a serialized code object, in the order a layout lists them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeField {
    ArgCount,
    PosOnlyArgCount,
    KwOnlyArgCount,
    NLocals,
    StackSize,
    Flags,
    Code,
    Consts,
    Names,
    VarNames,
    FreeVars,
    CellVars,
    LocalsPlusNames,
    LocalsPlusKinds,
    FileName,
    Name,
    QualName,
    FirstLineNo,
    LineTable,
    ExceptionTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalFormat {
    pub code_layout: &'static [CodeField],
    pub tuple: Extent,
    pub small_tuple: Extent,
    pub list: Extent,
    pub dict: Extent,
    pub set: Extent,
    pub frozenset: Extent,
    /// Bit on the type tag marking an object for the reference table
    pub ref_flag: u8,
}

const LAYOUT_V38: &[CodeField] = &[
    CodeField::ArgCount,
    CodeField::PosOnlyArgCount,
    CodeField::KwOnlyArgCount,
    CodeField::NLocals,
    CodeField::StackSize,
    CodeField::Flags,
    CodeField::Code,
    CodeField::Consts,
    CodeField::Names,
    CodeField::VarNames,
    CodeField::FreeVars,
    CodeField::CellVars,
    CodeField::FileName,
    CodeField::Name,
    CodeField::FirstLineNo,
    CodeField::LineTable,
];

const LAYOUT_V311: &[CodeField] = &[
    CodeField::ArgCount,
    CodeField::PosOnlyArgCount,
    CodeField::KwOnlyArgCount,
    CodeField::StackSize,
    CodeField::Flags,
    CodeField::Code,
    CodeField::Consts,
    CodeField::Names,
    CodeField::LocalsPlusNames,
    CodeField::LocalsPlusKinds,
    CodeField::FileName,
    CodeField::Name,
    CodeField::QualName,
    CodeField::FirstLineNo,
    CodeField::LineTable,
    CodeField::ExceptionTable,
];

impl MarshalFormat {
    /// Python 3.8 up to 3.10
    pub const V310: MarshalFormat = MarshalFormat {
        code_layout: LAYOUT_V38,
        tuple: Extent::Count32,
        small_tuple: Extent::Count8,
        list: Extent::Count32,
        dict: Extent::Sentinel,
        set: Extent::Count32,
        frozenset: Extent::Count32,
        ref_flag: 0x80,
    };

    /// Python 3.11 and later
    pub const V311: MarshalFormat = MarshalFormat {
        code_layout: LAYOUT_V311,
        ..MarshalFormat::V310
    };
}
