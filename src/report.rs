//! Shared report emission: the four sorted text tables, the `;`-separated
//! CSV, and the call-stack listings. Lines are always written whole so an
//! interrupted run leaves well-formed files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use log::warn;

use crate::analysis::leakage::LeakageStatistics;
use crate::analysis::OutputFormat;

/// One scored program point, ready for emission.
pub(crate) struct ScoreRow {
    /// Call-stack id when the engine partitions by stack.
    pub call_stack: Option<u64>,
    /// Numeric sort key: (call-stack id or 0, instruction id).
    pub sort_key: (u64, u64),
    pub label: String,
    pub stats: LeakageStatistics,
}

impl ScoreRow {
    fn name(&self) -> String {
        match self.call_stack {
            Some(stack) => format!("[CS-{:016X}] {}", stack, self.label),
            None => self.label.clone(),
        }
    }
}

/// Formats a score without trailing zero noise; the value is still exact to
/// six decimals.
pub(crate) fn format_score(value: f64) -> String {
    let text = format!("{:.6}", value);
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn open_report(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    let file = File::create(&path)
        .with_context(|| format!("failed to create report file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn cancelled(cancel: &AtomicBool) -> bool {
    if cancel.load(Ordering::Relaxed) {
        warn!("cancellation requested, leaving remaining reports unwritten");
        true
    } else {
        false
    }
}

/// Emits the leakage tables: either four sorted text files or one CSV.
pub(crate) fn write_score_reports(
    dir: &Path,
    format: OutputFormat,
    rows: &[ScoreRow],
    cancel: &AtomicBool,
) -> Result<()> {
    match format {
        OutputFormat::Csv => write_csv(dir, rows),
        OutputFormat::Txt => write_text_tables(dir, rows, cancel),
    }
}

fn write_csv(dir: &Path, rows: &[ScoreRow]) -> Result<()> {
    let with_stack = rows.first().map_or(false, |r| r.call_stack.is_some());
    let mut out = open_report(dir, "memory-access-leakage.csv")?;
    if with_stack {
        write!(out, "call-stack;")?;
    }
    writeln!(
        out,
        "instruction;mutual-information;minimum-entropy;conditional-guessing-entropy;\
         minimum-conditional-guessing-entropy;minimum-conditional-guessing-entropy-digest"
    )?;

    let mut sorted: Vec<&ScoreRow> = rows.iter().collect();
    sorted.sort_by_key(|r| r.sort_key);
    for row in sorted {
        if let Some(stack) = row.call_stack {
            write!(out, "CS-{:016X};", stack)?;
        }
        writeln!(
            out,
            "{};{};{};{};{};{}",
            row.label,
            format_score(row.stats.mutual_information),
            format_score(row.stats.min_entropy),
            format_score(row.stats.conditional_guessing_entropy),
            format_score(row.stats.min_conditional_guessing_entropy),
            row.stats.min_guess_digest
        )?;
    }
    out.flush()?;
    Ok(())
}

fn write_text_tables(dir: &Path, rows: &[ScoreRow], cancel: &AtomicBool) -> Result<()> {
    // Highest scores first for the entropy measures, easiest targets first
    // for the guessing measures.
    let mut by_mi: Vec<&ScoreRow> = rows.iter().collect();
    by_mi.sort_by(|a, b| {
        b.stats
            .mutual_information
            .total_cmp(&a.stats.mutual_information)
            .then(a.sort_key.cmp(&b.sort_key))
    });
    let mut out = open_report(dir, "mutual-information.txt")?;
    for row in &by_mi {
        writeln!(out, "{}: {}", row.name(), format_score(row.stats.mutual_information))?;
    }
    out.flush()?;
    if cancelled(cancel) {
        return Ok(());
    }

    let mut by_me: Vec<&ScoreRow> = rows.iter().collect();
    by_me.sort_by(|a, b| {
        b.stats
            .min_entropy
            .total_cmp(&a.stats.min_entropy)
            .then(a.sort_key.cmp(&b.sort_key))
    });
    let mut out = open_report(dir, "minimum-entropy.txt")?;
    for row in &by_me {
        writeln!(out, "{}: {}", row.name(), format_score(row.stats.min_entropy))?;
    }
    out.flush()?;
    if cancelled(cancel) {
        return Ok(());
    }

    let mut by_cge: Vec<&ScoreRow> = rows.iter().collect();
    by_cge.sort_by(|a, b| {
        a.stats
            .conditional_guessing_entropy
            .total_cmp(&b.stats.conditional_guessing_entropy)
            .then(a.sort_key.cmp(&b.sort_key))
    });
    let mut out = open_report(dir, "conditional-guessing-entropy.txt")?;
    for row in &by_cge {
        writeln!(
            out,
            "{}: {}",
            row.name(),
            format_score(row.stats.conditional_guessing_entropy)
        )?;
    }
    out.flush()?;
    if cancelled(cancel) {
        return Ok(());
    }

    let mut by_min: Vec<&ScoreRow> = rows.iter().collect();
    by_min.sort_by(|a, b| {
        a.stats
            .min_conditional_guessing_entropy
            .total_cmp(&b.stats.min_conditional_guessing_entropy)
            .then(a.sort_key.cmp(&b.sort_key))
    });
    let mut out = open_report(dir, "minimum-conditional-guessing-entropy.txt")?;
    for row in &by_min {
        writeln!(
            out,
            "{}: {} (digest {})",
            row.name(),
            format_score(row.stats.min_conditional_guessing_entropy),
            row.stats.min_guess_digest
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Writes `call-stacks.txt`: one `CS-<16 hex>: <leaf> => ... => <root>` line
/// per stack, sorted by id.
pub(crate) fn write_call_stacks(dir: &Path, stacks: &[(u64, Vec<String>)]) -> Result<()> {
    let mut sorted: Vec<&(u64, Vec<String>)> = stacks.iter().collect();
    sorted.sort_by_key(|(id, _)| *id);

    let mut out = open_report(dir, "call-stacks.txt")?;
    for (id, labels) in sorted {
        if labels.is_empty() {
            writeln!(out, "CS-{:016X}: <root>", id)?;
        } else {
            writeln!(out, "CS-{:016X}: {}", id, labels.join(" => "))?;
        }
    }
    out.flush()?;
    Ok(())
}
