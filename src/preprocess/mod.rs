//! Converts the compressed textual traces emitted by the source tracer into
//! the binary format the analyzers consume.
//!
//! The textual format is line-based. A line is either a record
//! (`c`/`R`/`r`/`Y`/`j`/`m`, semicolon-separated fields), a dictionary
//! definition `L|<n>|<line>`, or a reference to an earlier definition: the
//! plain integer `<n>`, or a single character in `a..=s` encoding an id
//! within ±9 of the previous one. Consecutive relative references may be
//! packed onto one physical line, and any reference may carry a trailing
//! `|<suffix>` that is appended to the interned prefix.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};

use crate::core::io::TraceWriter;
use crate::core::types::{BranchKind, ImageInfo, TraceEntry};
use crate::trace::encode_entry;

/// Shared preprocessing state: the image table and the location interner.
/// One instance handles the prefix and every testcase of a run, so equal
/// source locations map to equal offsets across testcases.
#[derive(Default)]
pub struct Preprocessor {
    images: Vec<ImageInfo>,
    locations: HashMap<(i32, String), u32>,
    next_offset: HashMap<i32, u32>,
}

enum Frame {
    /// Traced callee; closed by its own `r` record.
    Internal { call_site: (i32, u32) },
    /// Untraced callee; closed by the caller-side `R` record.
    External,
}

impl Preprocessor {
    pub fn new() -> Preprocessor {
        Preprocessor::default()
    }

    pub fn images(&self) -> &[ImageInfo] {
        &self.images
    }

    /// Loads the `scripts.txt` sidecar (`<id>\t<path>` per line).
    pub fn load_scripts(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read script table {}", path.display()))?;
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (id, name) = line
                .split_once('\t')
                .with_context(|| format!("malformed script table line {:?}", line))?;
            let id: i32 = id
                .parse()
                .with_context(|| format!("bad script id in line {:?}", line))?;
            self.images.push(ImageInfo {
                id,
                name: name.to_string(),
                size: 0,
            });
        }
        Ok(())
    }

    /// Writes the `images.txt` sidecar the analyzer's symbol resolver reads.
    pub fn write_image_table(&self, path: &Path) -> Result<()> {
        let mut out = fs::File::create(path)
            .with_context(|| format!("failed to create image table {}", path.display()))?;
        for image in &self.images {
            writeln!(out, "{}\t{}\t{}", image.id, image.name, image.size)?;
        }
        Ok(())
    }

    /// Interns a textual source location into a dense per-image offset.
    fn location_offset(&mut self, file_id: i32, location: &str) -> u32 {
        if let Some(&offset) = self.locations.get(&(file_id, location.to_string())) {
            return offset;
        }
        let next = self.next_offset.entry(file_id).or_insert(1);
        let offset = *next;
        *next += 1;
        self.locations
            .insert((file_id, location.to_string()), offset);
        offset
    }

    /// Converts one textual trace into entries.
    pub fn preprocess_text(&mut self, text: &str, label: &str) -> Result<Vec<TraceEntry>> {
        let mut entries = Vec::new();
        let mut dictionary: HashMap<u64, String> = HashMap::new();
        let mut last_id: Option<u64> = None;
        let mut stack: Vec<Frame> = Vec::new();

        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            self.expand_line(
                line,
                &mut dictionary,
                &mut last_id,
                &mut stack,
                &mut entries,
            )
            .with_context(|| format!("{}: line {}", label, number + 1))?;
        }

        if !stack.is_empty() {
            warn!(
                "{}: {} call frame(s) left open at end of trace",
                label,
                stack.len()
            );
        }
        debug!("{}: {} entries", label, entries.len());
        Ok(entries)
    }

    fn expand_line(
        &mut self,
        line: &str,
        dictionary: &mut HashMap<u64, String>,
        last_id: &mut Option<u64>,
        stack: &mut Vec<Frame>,
        entries: &mut Vec<TraceEntry>,
    ) -> Result<()> {
        // Dictionary definition: L|<n>|<prefix>[|<variable part>].
        if let Some(rest) = line.strip_prefix("L|") {
            let (id, definition) = rest
                .split_once('|')
                .with_context(|| format!("malformed dictionary entry {:?}", line))?;
            let id: u64 = id
                .parse()
                .with_context(|| format!("bad dictionary id in {:?}", line))?;
            let (prefix, suffix) = match definition.rfind('|') {
                Some(at) => definition.split_at(at),
                None => (definition, ""),
            };
            let suffix = suffix.strip_prefix('|').unwrap_or(suffix);
            dictionary.insert(id, prefix.to_string());
            *last_id = Some(id);
            let record = format!("{}{}", prefix, suffix);
            return self.process_record(&record, stack, entries);
        }

        // Split off an optional per-occurrence suffix.
        let (reference, suffix) = match line.find('|') {
            Some(at) => (&line[..at], &line[at + 1..]),
            None => (line, ""),
        };

        // Absolute reference: a plain integer.
        if !reference.is_empty() && reference.bytes().all(|b| b.is_ascii_digit()) {
            let id: u64 = reference
                .parse()
                .with_context(|| format!("dictionary reference {:?} out of range", reference))?;
            let record = match dictionary.get(&id) {
                Some(prefix) => format!("{}{}", prefix, suffix),
                None => bail!("reference to undefined dictionary entry {}", id),
            };
            *last_id = Some(id);
            return self.process_record(&record, stack, entries);
        }

        // Relative references: one or more characters in a..=s, each moving
        // the previous id by -9..=9.
        if !reference.is_empty() && reference.bytes().all(|b| (b'a'..=b's').contains(&b)) {
            let count = reference.len();
            for (index, byte) in reference.bytes().enumerate() {
                let previous = match *last_id {
                    Some(id) => id,
                    None => bail!("relative dictionary reference before any definition"),
                };
                let delta = byte as i64 - b'j' as i64;
                let id = previous
                    .checked_add_signed(delta)
                    .with_context(|| format!("relative reference underflows in {:?}", line))?;
                let own_suffix = if index + 1 == count { suffix } else { "" };
                let record = match dictionary.get(&id) {
                    Some(prefix) => format!("{}{}", prefix, own_suffix),
                    None => bail!("reference to undefined dictionary entry {}", id),
                };
                *last_id = Some(id);
                self.process_record(&record, stack, entries)?;
            }
            return Ok(());
        }

        // A direct record line.
        self.process_record(line, stack, entries)
    }

    fn process_record(
        &mut self,
        record: &str,
        stack: &mut Vec<Frame>,
        entries: &mut Vec<TraceEntry>,
    ) -> Result<()> {
        let mut fields = record.split(';');
        let kind = fields.next().unwrap_or("");
        match kind {
            "c" => {
                let source_file = parse_i32(fields.next(), record)?;
                let source_offset = self.field_offset(source_file, fields.next(), record)?;
                let destination = fields
                    .next()
                    .with_context(|| format!("malformed call record {:?}", record))?;
                if destination == "E" {
                    // Untraced callee; its `R` record closes the frame.
                    stack.push(Frame::External);
                    return Ok(());
                }
                let destination_file: i32 = destination
                    .parse()
                    .with_context(|| format!("bad callee file id in {:?}", record))?;
                let destination_offset =
                    self.field_offset(destination_file, fields.next(), record)?;
                entries.push(TraceEntry::Branch {
                    taken: true,
                    kind: BranchKind::Call,
                    source_image_id: source_file,
                    source_offset,
                    destination_image_id: destination_file,
                    destination_offset,
                });
                stack.push(Frame::Internal {
                    call_site: (source_file, source_offset),
                });
            }
            "r" => {
                let source_file = parse_i32(fields.next(), record)?;
                let source_offset = self.field_offset(source_file, fields.next(), record)?;
                let call_site = loop {
                    match stack.pop() {
                        Some(Frame::Internal { call_site }) => break Some(call_site),
                        Some(Frame::External) => {
                            warn!("return crosses an unclosed external call in {:?}", record);
                        }
                        None => break None,
                    }
                };
                let (destination_image_id, destination_offset) = match call_site {
                    Some(site) => site,
                    None => {
                        warn!("return without matching call in {:?}", record);
                        (0, 0)
                    }
                };
                entries.push(TraceEntry::Branch {
                    taken: true,
                    kind: BranchKind::Return,
                    source_image_id: source_file,
                    source_offset,
                    destination_image_id,
                    destination_offset,
                });
            }
            "R" => {
                // Return to the caller after an external call; internal
                // frames were already closed by their own `r`.
                if matches!(stack.last(), Some(Frame::External)) {
                    stack.pop();
                }
            }
            // Yield and resume are indistinguishable upstream and both
            // irrelevant to the analyzers.
            "Y" => {}
            "j" => {
                let file = parse_i32(fields.next(), record)?;
                let source_offset = self.field_offset(file, fields.next(), record)?;
                let destination_offset = self.field_offset(file, fields.next(), record)?;
                entries.push(TraceEntry::Branch {
                    taken: true,
                    kind: BranchKind::Jump,
                    source_image_id: file,
                    source_offset,
                    destination_image_id: file,
                    destination_offset,
                });
            }
            "m" => {
                let mode = fields
                    .next()
                    .with_context(|| format!("malformed memory record {:?}", record))?;
                let is_write = match mode {
                    "r" => false,
                    "w" => true,
                    other => bail!("bad access mode {:?} in {:?}", other, record),
                };
                let file = parse_i32(fields.next(), record)?;
                let instruction_offset = self.field_offset(file, fields.next(), record)?;
                let object_id = parse_i32(fields.next(), record)?;
                let memory_offset: u32 = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .with_context(|| format!("bad memory offset in {:?}", record))?;
                entries.push(TraceEntry::HeapMemoryAccess {
                    is_write,
                    // The textual format carries no access width.
                    size: 1,
                    instruction_image_id: file,
                    instruction_offset,
                    heap_block_id: object_id,
                    memory_offset,
                });
            }
            other => bail!("unknown record kind {:?} in {:?}", other, record),
        }
        Ok(())
    }

    fn field_offset(&mut self, file_id: i32, field: Option<&str>, record: &str) -> Result<u32> {
        let location = field
            .filter(|f| !f.is_empty())
            .with_context(|| format!("missing location field in {:?}", record))?;
        Ok(self.location_offset(file_id, location))
    }

    /// Converts one textual trace file (optionally gzipped) into binary
    /// trace bytes, assembled through the in-memory writer.
    pub fn preprocess_file(&mut self, path: &Path) -> Result<Vec<u8>> {
        let mut text = String::new();
        if path.extension().map_or(false, |e| e == "gz") {
            GzDecoder::new(fs::File::open(path)?)
                .read_to_string(&mut text)
                .with_context(|| format!("failed to read {}", path.display()))?;
        } else {
            fs::File::open(path)
                .and_then(|mut f| f.read_to_string(&mut text))
                .with_context(|| format!("failed to read {}", path.display()))?;
        }
        let entries = self.preprocess_text(&text, &path.display().to_string())?;

        let mut writer = TraceWriter::buffered();
        for entry in &entries {
            encode_entry(&mut writer, entry)?;
        }
        Ok(writer.into_inner())
    }
}

fn parse_i32(field: Option<&str>, record: &str) -> Result<i32> {
    field
        .and_then(|f| f.parse().ok())
        .with_context(|| format!("bad integer field in {:?}", record))
}

fn write_trace(path: &Path, bytes: &[u8], compress: bool) -> Result<()> {
    if compress {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?;
    } else {
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Preprocesses a directory of textual traces: `scripts.txt` (optional),
/// `prefix.txt` (optional) and `t<ID>.txt` files become `images.txt`,
/// `prefix.trace` and `t<ID>.trace`, with `.gz` appended when compression
/// is requested.
pub fn preprocess_directory(input: &Path, output: &Path, compress: bool) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;

    let mut preprocessor = Preprocessor::new();
    let scripts = input.join("scripts.txt");
    if scripts.is_file() {
        preprocessor.load_scripts(&scripts)?;
    } else {
        warn!("no scripts.txt in {}, image names will be numeric", input.display());
    }

    let suffix = if compress { ".gz" } else { "" };

    let prefix = input.join("prefix.txt");
    if prefix.is_file() {
        let bytes = preprocessor.preprocess_file(&prefix)?;
        write_trace(&output.join(format!("prefix.trace{}", suffix)), &bytes, compress)?;
    }

    let mut testcases: Vec<(u32, std::path::PathBuf)> = Vec::new();
    for entry in fs::read_dir(input)
        .with_context(|| format!("failed to list input directory {}", input.display()))?
    {
        let path = entry?.path();
        let stem = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(id) = stem
            .strip_prefix('t')
            .and_then(|rest| rest.strip_suffix(".txt"))
            .and_then(|id| id.parse::<u32>().ok())
        {
            testcases.push((id, path));
        }
    }
    testcases.sort();

    for (id, path) in &testcases {
        let bytes = preprocessor.preprocess_file(path)?;
        write_trace(
            &output.join(format!("t{}.trace{}", id, suffix)),
            &bytes,
            compress,
        )?;
    }

    preprocessor.write_image_table(&output.join("images.txt"))?;
    info!(
        "preprocessed {} testcase trace(s) into {}",
        testcases.len(),
        output.display()
    );
    Ok(())
}
