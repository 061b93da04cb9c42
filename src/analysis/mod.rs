//! The leakage analysis engines and the trait the pipeline drives them
//! through.

pub mod callstack;
pub mod controlflow;
pub mod dump;
pub mod instruction;
pub(crate) mod leakage;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::debug;

use crate::core::types::TestcaseId;
use crate::symbols::SymbolResolver;
use crate::trace::TraceFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Txt,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<OutputFormat> {
        match s {
            "csv" => Ok(OutputFormat::Csv),
            "txt" => Ok(OutputFormat::Txt),
            other => bail!("unrecognized output format {:?} (expected csv or txt)", other),
        }
    }
}

#[derive(Clone)]
pub struct AnalysisOptions {
    /// Required root directory for result files; each analyzer writes into
    /// a subdirectory named after itself.
    pub output_directory: PathBuf,
    pub output_format: OutputFormat,
    /// When set, analyzers additionally dump their full per-testcase data.
    pub dump_full_data: bool,
    /// Cooperative cancellation token, checked between testcases and
    /// between output chunks.
    pub cancel: Arc<AtomicBool>,
}

impl AnalysisOptions {
    pub fn new(output_directory: PathBuf) -> AnalysisOptions {
        AnalysisOptions {
            output_directory,
            output_format: OutputFormat::default(),
            dump_full_data: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One analysis engine. `add_trace` takes `&self` so that parallel-safe
/// engines can be fed concurrently from several worker threads; engines that
/// report `is_parallel_safe() == false` must be fed sequentially in
/// ascending testcase order.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_parallel_safe(&self) -> bool;

    fn add_trace(&self, testcase_id: TestcaseId, trace: &TraceFile) -> Result<()>;

    /// Runs once after every trace has been added; computes scores and
    /// writes the result files.
    fn finish(&self) -> Result<()>;
}

/// No-op analyzer, useful as a pipeline stand-in when measuring overhead.
pub struct PassthroughAnalyzer;

impl Analyzer for PassthroughAnalyzer {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn is_parallel_safe(&self) -> bool {
        true
    }

    fn add_trace(&self, testcase_id: TestcaseId, _trace: &TraceFile) -> Result<()> {
        debug!("passthrough: testcase {}", testcase_id);
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates an analyzer by its module name.
pub fn create_analyzer(
    name: &str,
    options: &AnalysisOptions,
    resolver: &Arc<SymbolResolver>,
) -> Result<Box<dyn Analyzer>> {
    Ok(match name {
        "instruction-memory-access-trace-leakage" => Box::new(
            instruction::InstructionLeakageAnalyzer::new(options.clone(), resolver.clone()),
        ),
        "call-stack-memory-access-trace-leakage" => Box::new(
            callstack::CallStackLeakageAnalyzer::new(options.clone(), resolver.clone()),
        ),
        "control-flow-leakage" => Box::new(controlflow::ControlFlowLeakageAnalyzer::new(
            options.clone(),
            resolver.clone(),
        )),
        "dump" => Box::new(dump::TraceDumpAnalyzer::new(options.clone(), resolver.clone())),
        "passthrough" => Box::new(PassthroughAnalyzer),
        other => bail!("unknown analysis module {:?}", other),
    })
}
