//! Human-readable trace dumps, mainly for debugging the preprocessor and
//! the trace format itself.

use std::fs;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::analysis::{AnalysisOptions, Analyzer};
use crate::core::types::{block_address_id, instruction_id, BranchKind, TestcaseId, TraceEntry};
use crate::report;
use crate::symbols::{BlockRegion, SymbolResolver};
use crate::trace::TraceFile;

pub struct TraceDumpAnalyzer {
    options: AnalysisOptions,
    resolver: Arc<SymbolResolver>,
}

impl TraceDumpAnalyzer {
    pub fn new(options: AnalysisOptions, resolver: Arc<SymbolResolver>) -> Self {
        TraceDumpAnalyzer { options, resolver }
    }

    fn format_entry(&self, entry: &TraceEntry) -> String {
        let code = |image: i32, offset: u32| {
            self.resolver.format_instruction(instruction_id(image, offset))
        };
        match *entry {
            TraceEntry::HeapAllocation { id, size, address } => {
                format!("heap alloc #{} size={} addr={:#x}", id, size, address)
            }
            TraceEntry::HeapFree { id } => format!("heap free #{}", id),
            TraceEntry::StackAllocation {
                id,
                instruction_image_id,
                instruction_offset,
                size,
                address,
            } => format!(
                "stack alloc #{} at {} size={} addr={:#x}",
                id,
                code(instruction_image_id, instruction_offset),
                size,
                address
            ),
            TraceEntry::Branch {
                taken,
                kind,
                source_image_id,
                source_offset,
                destination_image_id,
                destination_offset,
            } => {
                let verb = match kind {
                    BranchKind::Call => "call",
                    BranchKind::Return => "return",
                    BranchKind::Jump => "jump",
                };
                if taken {
                    format!(
                        "{} {} -> {}",
                        verb,
                        code(source_image_id, source_offset),
                        code(destination_image_id, destination_offset)
                    )
                } else {
                    format!("{} {} not taken", verb, code(source_image_id, source_offset))
                }
            }
            TraceEntry::ImageMemoryAccess {
                is_write,
                size,
                instruction_image_id,
                instruction_offset,
                memory_image_id,
                memory_offset,
            } => format!(
                "{} {} at {} size={}",
                if is_write { "write" } else { "read" },
                code(memory_image_id, memory_offset),
                code(instruction_image_id, instruction_offset),
                size
            ),
            TraceEntry::HeapMemoryAccess {
                is_write,
                size,
                instruction_image_id,
                instruction_offset,
                heap_block_id,
                memory_offset,
            } => format!(
                "{} {} at {} size={}",
                if is_write { "write" } else { "read" },
                self.resolver.format_address_in(
                    block_address_id(heap_block_id, memory_offset),
                    Some(BlockRegion::Heap),
                ),
                code(instruction_image_id, instruction_offset),
                size
            ),
            TraceEntry::StackMemoryAccess {
                is_write,
                size,
                instruction_image_id,
                instruction_offset,
                stack_block_id,
                memory_offset,
            } => format!(
                "{} {} at {} size={}",
                if is_write { "write" } else { "read" },
                self.resolver.format_address_in(
                    block_address_id(stack_block_id, memory_offset),
                    Some(BlockRegion::Stack),
                ),
                code(instruction_image_id, instruction_offset),
                size
            ),
        }
    }
}

impl Analyzer for TraceDumpAnalyzer {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn is_parallel_safe(&self) -> bool {
        true
    }

    fn add_trace(&self, testcase_id: TestcaseId, trace: &TraceFile) -> Result<()> {
        let dir = self.options.output_directory.join(self.name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        let mut out = report::open_report(&dir, &format!("dump_t{}.txt", testcase_id))?;

        writeln!(out, "--- prefix ---")?;
        for entry in trace.prefix().entries() {
            writeln!(out, "{}", self.format_entry(entry))?;
        }
        writeln!(out, "--- testcase {} ---", testcase_id)?;
        let mut entries = trace.stream()?;
        while let Some(entry) = entries.next_entry()? {
            writeln!(out, "{}", self.format_entry(entry))?;
        }
        out.flush()?;
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        info!("dump: trace listings written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{encode_entries, TraceFile, TracePrefix};

    #[test]
    fn dump_lists_prefix_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = TraceDumpAnalyzer::new(
            AnalysisOptions::new(dir.path().to_path_buf()),
            Arc::new(SymbolResolver::new()),
        );

        let prefix = Arc::new(
            TracePrefix::from_bytes(&encode_entries(&[TraceEntry::HeapAllocation {
                id: 1,
                size: 16,
                address: 0xA000,
            }]))
            .unwrap(),
        );
        let body = encode_entries(&[TraceEntry::HeapMemoryAccess {
            is_write: true,
            size: 4,
            instruction_image_id: 0,
            instruction_offset: 0x10,
            heap_block_id: 1,
            memory_offset: 8,
        }]);
        let trace = TraceFile::from_bytes(body, prefix, 3);
        analyzer.add_trace(3, &trace).unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("dump").join("dump_t3.txt")).unwrap();
        assert_eq!(
            text,
            "--- prefix ---\n\
             heap alloc #1 size=16 addr=0xa000\n\
             --- testcase 3 ---\n\
             write heap#1+0x8 at image0:0x10 size=4\n"
        );
    }
}
