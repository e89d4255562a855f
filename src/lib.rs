//! Decoding and control flow analysis of marshalled Python code objects.
//!
//! The engine is version independent: everything that changes between interpreter releases lives in
//! the opcode tables of [`v310`] to [`v314`], handed out by a [`registry::Registry`].

pub mod analysis;
pub mod cfg;
pub mod error;
pub mod instructions;
pub mod opcodes;
pub mod registry;
pub mod semantics;
pub mod sir;
pub mod traits;
pub mod unmarshal;
pub mod utils;
pub mod v310;
pub mod v311;
pub mod v312;
pub mod v313;
pub mod v314;
pub mod value;
pub mod version;

use analysis::{AnalysisSession, BatchReport};
use error::{AnalysisError, Error};
use registry::builtin_registry;
use value::ValueTree;
use version::PyVersion;

pub mod prelude {
    pub use crate::analysis::{AnalysisSession, BatchReport, CodeAnalysis, Failure};
    pub use crate::cfg::{analyze, AnalysisOptions, Block, ControlFlowGraph, Edge, EdgeKind};
    pub use crate::error::{AnalysisError, DecodeError, Error};
    pub use crate::instructions::{decode_stream, DecodedInstruction, Instructions};
    pub use crate::opcodes::{FlowKind, JumpAddressing, OpcodeInfo, OpcodeTable};
    pub use crate::registry::{builtin_registry, Registry};
    pub use crate::semantics::Semantics;
    pub use crate::sir::{lift, Expr, Place, Sir, SirBlock, Statement};
    pub use crate::traits::{ExceptionTableProvider, InstructionAccess};
    pub use crate::utils::{ExceptionTableEntry, StackEffect};
    pub use crate::value::{CodeObject, ObjectRef, Value, ValueTree};
    pub use crate::version::PyVersion;
}

/// Unmarshals `bytes` (the payload after the pyc header) with the builtin table for `version`.
pub fn load_value(bytes: &[u8], version: impl Into<PyVersion>) -> Result<ValueTree, Error> {
    let table = builtin_registry()?.resolve(version.into())?;

    Ok(unmarshal::decode(bytes, &table)?)
}

/// Decodes and analyses every code object in `tree` with the builtin table for `version`. Per object
/// failures end up in the report.
pub fn analyze_all(
    tree: &ValueTree,
    version: impl Into<PyVersion>,
) -> Result<BatchReport<'_>, Error> {
    let version = version.into();
    let table = builtin_registry()?
        .get(version)
        .ok_or(AnalysisError::UnsupportedVersion(version))?;

    Ok(AnalysisSession::new(tree, table).run())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const TRIVIAL: &[u8] = include_bytes!("../tests/data/trivial_314.bin");

    #[test]
    fn load_and_analyze() {
        let tree = load_value(TRIVIAL, (3, 14)).unwrap();
        let report = analyze_all(&tree, (3, 14)).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.analyses.len(), 1);
        assert_eq!(report.analyses[0].code.name, "f");
        assert_eq!(report.analyses[0].cfg.exits(), vec![0]);
    }

    #[test]
    fn unknown_versions() {
        assert_eq!(
            load_value(TRIVIAL, (2, 7)).unwrap_err(),
            Error::Analysis(AnalysisError::UnsupportedVersion(PyVersion::new(2, 7)))
        );

        let tree = load_value(TRIVIAL, (3, 14)).unwrap();
        assert!(analyze_all(&tree, "3.9".parse::<PyVersion>().unwrap()).is_err());
    }
}
