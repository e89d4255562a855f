use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use log::debug;

use crate::{
    error::{AnalysisError, Error},
    opcodes::{OpcodeTable, TableError},
    v310, v311, v312, v313, v314,
    version::PyVersion,
};

/// Opcode tables by interpreter version. Tables are handed out as shared, read only views.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tables: IndexMap<PyVersion, Arc<OpcodeTable>>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Registry::default()
    }

    /// All tables that ship with the crate
    pub fn builtin() -> Result<Self, TableError> {
        let mut registry = Registry::new();

        for table in [
            v310::opcodes::table()?,
            v311::opcodes::table()?,
            v312::opcodes::table()?,
            v313::opcodes::table()?,
            v314::opcodes::table()?,
        ] {
            registry.register(table);
        }

        Ok(registry)
    }

    /// Adds a table, replacing the one registered for the same version. Returns the replaced table.
    ///
    /// Tables can only be obtained through [`crate::opcodes::TableBuilder::build`], so they are always
    /// valid here.
    pub fn register(&mut self, table: OpcodeTable) -> Option<Arc<OpcodeTable>> {
        debug!(
            "Registering opcode table for Python {} ({} opcodes)",
            table.version(),
            table.len()
        );

        self.tables.insert(table.version(), Arc::new(table))
    }

    /// Borrowed view of the table for `version`
    pub fn get(&self, version: PyVersion) -> Option<&OpcodeTable> {
        self.tables.get(&version).map(Arc::as_ref)
    }

    pub fn resolve(&self, version: PyVersion) -> Result<Arc<OpcodeTable>, AnalysisError> {
        self.tables
            .get(&version)
            .cloned()
            .ok_or(AnalysisError::UnsupportedVersion(version))
    }

    /// Registered versions in registration order
    pub fn versions(&self) -> impl Iterator<Item = PyVersion> + '_ {
        self.tables.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// The process wide registry of builtin tables, built on first use.
pub fn builtin_registry() -> Result<&'static Registry, Error> {
    static REGISTRY: OnceLock<Result<Registry, TableError>> = OnceLock::new();

    REGISTRY
        .get_or_init(Registry::builtin)
        .as_ref()
        .map_err(|e| Error::InvalidTable(e.clone()))
}
