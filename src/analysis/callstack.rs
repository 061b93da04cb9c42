//! Call-stack-aware memory-access leakage: digests are partitioned by
//! (call-stack id, instruction id), so the same instruction reached through
//! different call chains is scored separately.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{info, warn};
use serde_derive::Serialize;

use crate::analysis::leakage::{memory_access_ids, score_histogram, DigestHistogram};
use crate::analysis::{AnalysisOptions, Analyzer};
use crate::core::types::{instruction_id, BranchKind, TestcaseId, TraceEntry, ROOT_STACK_ID};
use crate::report::{self, ScoreRow};
use crate::symbols::SymbolResolver;
use crate::trace::TraceFile;
use crate::util::hash::{call_stack_id, AccessDigest};

/// Linkage record for one call-stack id; walking `parent` links leads to the
/// root (id 0).
#[derive(Clone, Copy)]
struct StackRecord {
    parent: u64,
    target_instruction: u64,
}

#[derive(Default)]
struct CallStackState {
    stacks: HashMap<u64, StackRecord>,
    instructions: HashMap<(u64, u64), DigestHistogram>,
    /// stack id -> (testcase, hits), kept only for the full-data dump.
    hits: Option<HashMap<u64, Vec<(TestcaseId, u32)>>>,
}

pub struct CallStackLeakageAnalyzer {
    options: AnalysisOptions,
    resolver: Arc<SymbolResolver>,
    state: Mutex<CallStackState>,
}

/// One node of the per-testcase call tree built during ingest.
struct LocalNode {
    stack_id: u64,
    parent_stack_id: u64,
    target_instruction: u64,
    hits: u32,
    children: HashMap<u64, usize>,
    digests: HashMap<u64, AccessDigest>,
}

impl LocalNode {
    fn root() -> LocalNode {
        LocalNode {
            stack_id: ROOT_STACK_ID,
            parent_stack_id: ROOT_STACK_ID,
            target_instruction: 0,
            hits: 1,
            children: HashMap::new(),
            digests: HashMap::new(),
        }
    }
}

impl CallStackLeakageAnalyzer {
    pub fn new(options: AnalysisOptions, resolver: Arc<SymbolResolver>) -> Self {
        CallStackLeakageAnalyzer {
            options,
            resolver,
            state: Mutex::new(CallStackState::default()),
        }
    }

    /// Builds the per-testcase call tree and the digests hanging off it.
    fn build_local_tree(testcase_id: TestcaseId, trace: &TraceFile) -> Result<Vec<LocalNode>> {
        let mut nodes = vec![LocalNode::root()];
        let mut stack: Vec<usize> = vec![0];

        let mut entries = trace.stream_with_prefix()?;
        while let Some(entry) = entries.next_entry()? {
            match *entry {
                TraceEntry::Branch {
                    taken: true,
                    kind: BranchKind::Call,
                    destination_image_id,
                    destination_offset,
                    ..
                } => {
                    let target = instruction_id(destination_image_id, destination_offset);
                    let current = *stack.last().unwrap();
                    let child = match nodes[current].children.get(&target) {
                        Some(&index) => index,
                        None => {
                            let parent_stack_id = nodes[current].stack_id;
                            nodes.push(LocalNode {
                                stack_id: call_stack_id(parent_stack_id, target),
                                parent_stack_id,
                                target_instruction: target,
                                hits: 0,
                                children: HashMap::new(),
                                digests: HashMap::new(),
                            });
                            let index = nodes.len() - 1;
                            nodes[current].children.insert(target, index);
                            index
                        }
                    };
                    nodes[child].hits += 1;
                    stack.push(child);
                }
                TraceEntry::Branch {
                    kind: BranchKind::Return,
                    ..
                } => {
                    if stack.len() > 1 {
                        stack.pop();
                    } else {
                        warn!(
                            "testcase {}: return without matching call, staying at root",
                            testcase_id
                        );
                    }
                }
                _ => {
                    if let Some((instruction, address)) = memory_access_ids(entry) {
                        let current = *stack.last().unwrap();
                        nodes[current]
                            .digests
                            .entry(instruction)
                            .or_default()
                            .update(address);
                    }
                }
            }
        }
        Ok(nodes)
    }

    pub(crate) fn scored_rows(&self) -> Vec<ScoreRow> {
        let state = self.state.lock().unwrap();
        let mut saturated = 0usize;
        let rows: Vec<ScoreRow> = state
            .instructions
            .iter()
            .map(|(&(stack, instruction), histogram)| {
                let stats = score_histogram(histogram);
                if stats.saturates(histogram.testcase_count) {
                    saturated += 1;
                }
                ScoreRow {
                    call_stack: Some(stack),
                    sort_key: (stack, instruction),
                    label: self.resolver.format_instruction(instruction),
                    stats,
                }
            })
            .collect();
        if saturated > 0 {
            warn!(
                "{} call-stack/instruction pair(s) reach the mutual-information ceiling; \
                 run more testcases for a meaningful estimate",
                saturated
            );
        }
        rows
    }

    /// Leaf-to-root instruction labels for one stack id.
    fn stack_labels(&self, state: &CallStackState, mut stack_id: u64) -> Vec<String> {
        let mut labels = Vec::new();
        while stack_id != ROOT_STACK_ID {
            match state.stacks.get(&stack_id) {
                Some(record) => {
                    labels.push(self.resolver.format_instruction(record.target_instruction));
                    stack_id = record.parent;
                }
                None => {
                    labels.push(format!("<unknown CS-{:016X}>", stack_id));
                    break;
                }
            }
        }
        labels
    }

    fn write_call_stacks(&self, dir: &std::path::Path) -> Result<()> {
        let state = self.state.lock().unwrap();
        let mut listed: Vec<(u64, Vec<String>)> = state
            .stacks
            .keys()
            .map(|&id| (id, self.stack_labels(&state, id)))
            .collect();
        listed.push((ROOT_STACK_ID, Vec::new()));
        report::write_call_stacks(dir, &listed)
    }

    fn write_full_data(&self, dir: &std::path::Path) -> Result<()> {
        #[derive(Serialize)]
        struct StackDump {
            call_stack: String,
            hits: Vec<(TestcaseId, u32)>,
        }

        let state = self.state.lock().unwrap();
        let mut out = report::open_report(dir, "full-data.json")?;
        if let Some(hits) = &state.hits {
            let mut ids: Vec<&u64> = hits.keys().collect();
            ids.sort();
            for &id in ids {
                let mut per_testcase = hits[&id].clone();
                per_testcase.sort();
                let record = StackDump {
                    call_stack: format!("CS-{:016X}", id),
                    hits: per_testcase,
                };
                serde_json::to_writer(&mut out, &record)?;
                writeln!(out)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

impl Analyzer for CallStackLeakageAnalyzer {
    fn name(&self) -> &'static str {
        "call-stack-memory-access-trace-leakage"
    }

    fn is_parallel_safe(&self) -> bool {
        true
    }

    fn add_trace(&self, testcase_id: TestcaseId, trace: &TraceFile) -> Result<()> {
        let nodes = Self::build_local_tree(testcase_id, trace)
            .with_context(|| format!("failed to decode trace of testcase {}", testcase_id))?;

        // Flatten into the shared aggregates; the arena is already in BFS-ish
        // creation order and stack ids are content-derived, so merging is a
        // plain union.
        let mut state = self.state.lock().unwrap();
        if self.options.dump_full_data && state.hits.is_none() {
            state.hits = Some(HashMap::new());
        }
        for node in &nodes {
            if node.stack_id != ROOT_STACK_ID {
                state.stacks.entry(node.stack_id).or_insert(StackRecord {
                    parent: node.parent_stack_id,
                    target_instruction: node.target_instruction,
                });
            }
            if let Some(hits) = &mut state.hits {
                hits.entry(node.stack_id)
                    .or_default()
                    .push((testcase_id, node.hits));
            }
            for (&instruction, digest) in &node.digests {
                state
                    .instructions
                    .entry((node.stack_id, instruction))
                    .or_default()
                    .record(*digest, testcase_id, self.options.dump_full_data);
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let dir = self.options.output_directory.join(self.name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;

        let rows = self.scored_rows();
        report::write_score_reports(&dir, self.options.output_format, &rows, &self.options.cancel)?;
        self.write_call_stacks(&dir)?;
        if self.options.dump_full_data {
            self.write_full_data(&dir)?;
        }
        info!(
            "{}: scored {} call-stack/instruction pair(s)",
            self.name(),
            rows.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{encode_entries, TraceFile, TracePrefix};

    fn call(source_offset: u32, destination_offset: u32) -> TraceEntry {
        TraceEntry::Branch {
            taken: true,
            kind: BranchKind::Call,
            source_image_id: 0,
            source_offset,
            destination_image_id: 0,
            destination_offset,
        }
    }

    fn ret(source_offset: u32, destination_offset: u32) -> TraceEntry {
        TraceEntry::Branch {
            taken: true,
            kind: BranchKind::Return,
            source_image_id: 0,
            source_offset,
            destination_image_id: 0,
            destination_offset,
        }
    }

    fn read(instruction_offset: u32, memory_offset: u32) -> TraceEntry {
        TraceEntry::ImageMemoryAccess {
            is_write: false,
            size: 8,
            instruction_image_id: 0,
            instruction_offset,
            memory_image_id: 0,
            memory_offset,
        }
    }

    fn analyzer() -> CallStackLeakageAnalyzer {
        CallStackLeakageAnalyzer::new(
            AnalysisOptions::new(std::env::temp_dir()),
            Arc::new(SymbolResolver::new()),
        )
    }

    fn add(analyzer: &CallStackLeakageAnalyzer, id: TestcaseId, entries: &[TraceEntry]) {
        let trace = TraceFile::from_bytes(encode_entries(entries), TracePrefix::empty(), id);
        analyzer.add_trace(id, &trace).unwrap();
    }

    #[test]
    fn same_instruction_under_different_stacks_is_scored_separately() {
        let analyzer = analyzer();
        for id in 0..2u32 {
            add(
                &analyzer,
                id,
                &[
                    // One access from f (entry 0x100), one from g (entry 0x200),
                    // both executing the same instruction 0x50.
                    call(0x10, 0x100),
                    read(0x50, 0xAAA),
                    ret(0x110, 0x14),
                    call(0x20, 0x200),
                    read(0x50, 0xBBB),
                    ret(0x210, 0x24),
                ],
            );
        }

        let state = analyzer.state.lock().unwrap();
        assert_eq!(state.stacks.len(), 2);
        assert_eq!(state.instructions.len(), 2);
        let instruction = instruction_id(0, 0x50);
        let f_stack = call_stack_id(ROOT_STACK_ID, instruction_id(0, 0x100));
        let g_stack = call_stack_id(ROOT_STACK_ID, instruction_id(0, 0x200));
        assert!(state.instructions.contains_key(&(f_stack, instruction)));
        assert!(state.instructions.contains_key(&(g_stack, instruction)));
        for histogram in state.instructions.values() {
            assert_eq!(histogram.testcase_count, 2);
            assert_eq!(histogram.hash_counts.len(), 1);
        }
    }

    #[test]
    fn nested_calls_chain_stack_ids() {
        let analyzer = analyzer();
        add(
            &analyzer,
            0,
            &[
                call(0x10, 0x100),
                call(0x110, 0x200),
                read(0x210, 0x1),
                ret(0x220, 0x114),
                ret(0x120, 0x14),
            ],
        );

        let state = analyzer.state.lock().unwrap();
        let outer = call_stack_id(ROOT_STACK_ID, instruction_id(0, 0x100));
        let inner = call_stack_id(outer, instruction_id(0, 0x200));
        assert!(state
            .instructions
            .contains_key(&(inner, instruction_id(0, 0x210))));
        assert_eq!(state.stacks[&inner].parent, outer);
    }

    #[test]
    fn imbalanced_return_stays_at_root() {
        let analyzer = analyzer();
        add(&analyzer, 0, &[ret(0x10, 0), read(0x20, 0x1)]);

        let state = analyzer.state.lock().unwrap();
        assert!(state
            .instructions
            .contains_key(&(ROOT_STACK_ID, instruction_id(0, 0x20))));
    }

    #[test]
    fn divergent_addresses_leak_within_one_stack() {
        let analyzer = analyzer();
        add(&analyzer, 0, &[call(0x10, 0x100), read(0x50, 0xA)]);
        add(&analyzer, 1, &[call(0x10, 0x100), read(0x50, 0xB)]);

        let rows = analyzer.scored_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stats.mutual_information, 1.0);
        let stack = call_stack_id(ROOT_STACK_ID, instruction_id(0, 0x100));
        assert_eq!(rows[0].call_stack, Some(stack));
    }

    #[test]
    fn call_stack_report_lists_leaf_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = CallStackLeakageAnalyzer::new(
            AnalysisOptions::new(dir.path().to_path_buf()),
            Arc::new(SymbolResolver::new()),
        );
        add(
            &analyzer,
            0,
            &[
                call(0x10, 0x100),
                call(0x110, 0x200),
                read(0x210, 0x1),
                ret(0x220, 0x114),
                ret(0x120, 0x14),
            ],
        );
        analyzer.finish().unwrap();

        let text = std::fs::read_to_string(
            dir.path()
                .join("call-stack-memory-access-trace-leakage")
                .join("call-stacks.txt"),
        )
        .unwrap();
        let outer = call_stack_id(ROOT_STACK_ID, instruction_id(0, 0x100));
        let inner = call_stack_id(outer, instruction_id(0, 0x200));
        assert!(text.contains("CS-0000000000000000: <root>"));
        assert!(text.contains(&format!(
            "CS-{:016X}: image0:0x200 => image0:0x100",
            inner
        )));
    }
}
