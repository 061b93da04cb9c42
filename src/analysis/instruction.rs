//! Instruction-level memory-access leakage: one rolling digest per
//! instruction per testcase, aggregated into digest histograms and scored.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{info, warn};
use serde_derive::Serialize;

use crate::analysis::leakage::{
    memory_access_ids, score_histogram, DigestHistogram,
};
use crate::analysis::{AnalysisOptions, Analyzer};
use crate::core::types::TestcaseId;
use crate::report::{self, ScoreRow};
use crate::symbols::SymbolResolver;
use crate::trace::TraceFile;
use crate::util::hash::AccessDigest;

pub struct InstructionLeakageAnalyzer {
    options: AnalysisOptions,
    resolver: Arc<SymbolResolver>,
    state: Mutex<HashMap<u64, DigestHistogram>>,
}

impl InstructionLeakageAnalyzer {
    pub fn new(options: AnalysisOptions, resolver: Arc<SymbolResolver>) -> Self {
        InstructionLeakageAnalyzer {
            options,
            resolver,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Digest of every memory-accessing instruction in one trace.
    fn trace_digests(trace: &TraceFile) -> Result<HashMap<u64, AccessDigest>> {
        let mut digests: HashMap<u64, AccessDigest> = HashMap::new();
        let mut entries = trace.stream_with_prefix()?;
        while let Some(entry) = entries.next_entry()? {
            if let Some((instruction, address)) = memory_access_ids(entry) {
                digests.entry(instruction).or_default().update(address);
            }
        }
        Ok(digests)
    }

    pub(crate) fn scored_rows(&self) -> Vec<ScoreRow> {
        let state = self.state.lock().unwrap();
        let mut saturated = 0usize;
        let rows: Vec<ScoreRow> = state
            .iter()
            .map(|(&instruction, histogram)| {
                let stats = score_histogram(histogram);
                if stats.saturates(histogram.testcase_count) {
                    saturated += 1;
                }
                ScoreRow {
                    call_stack: None,
                    sort_key: (0, instruction),
                    label: self.resolver.format_instruction(instruction),
                    stats,
                }
            })
            .collect();
        if saturated > 0 {
            warn!(
                "{} instruction(s) reach the mutual-information ceiling; \
                 run more testcases for a meaningful estimate",
                saturated
            );
        }
        rows
    }

    fn write_full_data(&self, dir: &std::path::Path) -> Result<()> {
        #[derive(Serialize)]
        struct DigestDump<'a> {
            digest: String,
            count: u32,
            testcases: &'a [TestcaseId],
        }
        #[derive(Serialize)]
        struct InstructionDump<'a> {
            instruction: String,
            instruction_id: u64,
            testcase_count: u32,
            digests: Vec<DigestDump<'a>>,
        }

        let state = self.state.lock().unwrap();
        let mut out = report::open_report(dir, "full-data.json")?;
        let mut instructions: Vec<&u64> = state.keys().collect();
        instructions.sort();
        for &instruction in instructions {
            let histogram = &state[&instruction];
            let empty = HashMap::new();
            let testcases = histogram.hash_testcases.as_ref().unwrap_or(&empty);
            let mut digests: Vec<(&AccessDigest, &u32)> = histogram.hash_counts.iter().collect();
            digests.sort_by_key(|(digest, _)| **digest);
            let record = InstructionDump {
                instruction: self.resolver.format_instruction(instruction),
                instruction_id: instruction,
                testcase_count: histogram.testcase_count,
                digests: digests
                    .into_iter()
                    .map(|(digest, &count)| DigestDump {
                        digest: digest.to_string(),
                        count,
                        testcases: testcases.get(digest).map_or(&[][..], |t| &t[..]),
                    })
                    .collect(),
            };
            serde_json::to_writer(&mut out, &record)?;
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }
}

impl Analyzer for InstructionLeakageAnalyzer {
    fn name(&self) -> &'static str {
        "instruction-memory-access-trace-leakage"
    }

    fn is_parallel_safe(&self) -> bool {
        true
    }

    fn add_trace(&self, testcase_id: TestcaseId, trace: &TraceFile) -> Result<()> {
        // The whole trace is folded locally first; the shared map is only
        // locked for the merge.
        let digests = Self::trace_digests(trace)
            .with_context(|| format!("failed to decode trace of testcase {}", testcase_id))?;

        let mut state = self.state.lock().unwrap();
        for (instruction, digest) in digests {
            state.entry(instruction).or_default().record(
                digest,
                testcase_id,
                self.options.dump_full_data,
            );
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let dir = self.options.output_directory.join(self.name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;

        let rows = self.scored_rows();
        report::write_score_reports(&dir, self.options.output_format, &rows, &self.options.cancel)?;
        if self.options.dump_full_data {
            self.write_full_data(&dir)?;
        }
        info!("{}: scored {} instruction(s)", self.name(), rows.len());
        Ok(())
    }
}
