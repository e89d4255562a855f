//! Decoding and analysis of every code object in a value tree.

use std::cell::OnceCell;

use log::{debug, trace, warn};

use crate::{
    cfg::{self, AnalysisOptions, ControlFlowGraph},
    error::Error,
    instructions::{decode_stream, Instructions},
    opcodes::OpcodeTable,
    sir::{self, Sir},
    traits::ExceptionTableProvider,
    value::{CodeObject, ValueTree},
};

/// The decoded instructions of one code object and the graph built from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAnalysis<'a> {
    pub code: &'a CodeObject,
    pub instructions: Instructions,
    pub cfg: ControlFlowGraph,
    /// Present when [`AnalysisOptions::lift_expressions`] is set
    pub sir: Option<Sir>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Position in [`ValueTree::code_objects`]
    pub index: usize,
    pub qualname: String,
    pub firstlineno: u32,
    pub error: Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchReport<'a> {
    pub analyses: Vec<CodeAnalysis<'a>>,
    pub failures: Vec<Failure>,
}

impl BatchReport<'_> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of code objects the batch covered
    pub fn total(&self) -> usize {
        self.analyses.len() + self.failures.len()
    }
}

/// Analyses the code objects of one value tree on demand. Results are cached per code object for the
/// lifetime of the session.
pub struct AnalysisSession<'a> {
    table: &'a OpcodeTable,
    codes: Vec<&'a CodeObject>,
    exceptions: Option<&'a dyn ExceptionTableProvider>,
    options: AnalysisOptions,
    cache: Vec<OnceCell<Result<CodeAnalysis<'a>, Error>>>,
}

impl<'a> AnalysisSession<'a> {
    pub fn new(tree: &'a ValueTree, table: &'a OpcodeTable) -> Self {
        let codes = tree.code_objects();

        debug!(
            "Analysis session for Python {} over {} code objects",
            table.version(),
            codes.len()
        );

        AnalysisSession {
            table,
            cache: codes.iter().map(|_| OnceCell::new()).collect(),
            codes,
            exceptions: None,
            options: AnalysisOptions::default(),
        }
    }

    /// Adds exception edges from the ranges the provider extracts from each code object
    pub fn with_exception_tables(mut self, provider: &'a dyn ExceptionTableProvider) -> Self {
        self.exceptions = Some(provider);
        self
    }

    pub fn with_options(mut self, options: AnalysisOptions) -> Self {
        self.options = options;
        self
    }

    pub fn code_objects(&self) -> &[&'a CodeObject] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Analysis of the code object at `index`, computed on first request. `None` if there is no such
    /// code object.
    pub fn analyze(&self, index: usize) -> Option<&Result<CodeAnalysis<'a>, Error>> {
        let code = *self.codes.get(index)?;

        Some(self.cache[index].get_or_init(|| {
            analyze_code(code, self.table, self.exceptions, &self.options)
        }))
    }

    /// Analyses every code object. A failing code object is reported and does not stop the others.
    pub fn run(self) -> BatchReport<'a> {
        let mut report = BatchReport::default();

        for (index, (&code, cell)) in self.codes.iter().zip(self.cache).enumerate() {
            let result = cell
                .into_inner()
                .unwrap_or_else(|| analyze_code(code, self.table, self.exceptions, &self.options));

            match result {
                Ok(analysis) => report.analyses.push(analysis),
                Err(error) => {
                    warn!("Analysis of {} failed: {}", code.qualname, error);

                    report.failures.push(Failure {
                        index,
                        qualname: code.qualname.clone(),
                        firstlineno: code.firstlineno,
                        error,
                    });
                }
            }
        }

        debug!(
            "Analysed {} code objects, {} failed",
            report.total(),
            report.failures.len()
        );

        report
    }
}

fn analyze_code<'a>(
    code: &'a CodeObject,
    table: &OpcodeTable,
    provider: Option<&dyn ExceptionTableProvider>,
    options: &AnalysisOptions,
) -> Result<CodeAnalysis<'a>, Error> {
    trace!("Analysing {} ({} bytes)", code.qualname, code.code.len());

    let instructions = decode_stream(&code.code, table)?;
    let exceptions = provider.map(|p| p.exception_table(code)).transpose()?;
    let cfg = cfg::analyze(&instructions, table, exceptions.as_deref(), options)?;
    let sir = match options.lift_expressions {
        true => Some(sir::lift(&instructions, table, &cfg, options)?),
        false => None,
    };

    Ok(CodeAnalysis {
        code,
        instructions,
        cfg,
        sir,
    })
}
