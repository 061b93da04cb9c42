//! The binary trace format and the prefix-shared trace files built on it.
//!
//! A trace is a plain concatenation of framed entries: one tag byte followed
//! by a fixed-size little-endian payload per entry kind. The shared *prefix*
//! (the program's setup phase) is decoded once and referenced by every
//! per-testcase trace file; iterating "with prefix" chains the two.
//!
//! Files whose name ends in `.gz` are inflated into a memory buffer on open.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::Arc;

use flate2::read::GzDecoder;

use crate::core::io::{BufferReader, FileReader, TraceFormatError, TraceRead, TraceWriter};
use crate::core::types::{
    BranchKind, TestcaseId, TraceEntry, TAG_BRANCH, TAG_HEAP_ALLOCATION, TAG_HEAP_FREE,
    TAG_HEAP_MEMORY_ACCESS, TAG_IMAGE_MEMORY_ACCESS, TAG_STACK_ALLOCATION,
    TAG_STACK_MEMORY_ACCESS,
};

/// Decodes the entry at the reader's cursor, or `None` at end of data.
pub fn decode_entry<R: TraceRead>(
    reader: &mut R,
) -> Result<Option<TraceEntry>, TraceFormatError> {
    if reader.remaining() == 0 {
        return Ok(None);
    }
    let offset = reader.position();
    let tag = reader.read_u8()?;
    let entry = match tag {
        TAG_IMAGE_MEMORY_ACCESS => TraceEntry::ImageMemoryAccess {
            is_write: reader.read_bool()?,
            size: reader.read_i16()?,
            instruction_image_id: reader.read_i32()?,
            instruction_offset: reader.read_u32()?,
            memory_image_id: reader.read_i32()?,
            memory_offset: reader.read_u32()?,
        },
        TAG_HEAP_MEMORY_ACCESS => TraceEntry::HeapMemoryAccess {
            is_write: reader.read_bool()?,
            size: reader.read_i16()?,
            instruction_image_id: reader.read_i32()?,
            instruction_offset: reader.read_u32()?,
            heap_block_id: reader.read_i32()?,
            memory_offset: reader.read_u32()?,
        },
        TAG_STACK_MEMORY_ACCESS => TraceEntry::StackMemoryAccess {
            is_write: reader.read_bool()?,
            size: reader.read_i16()?,
            instruction_image_id: reader.read_i32()?,
            instruction_offset: reader.read_u32()?,
            stack_block_id: reader.read_i32()?,
            memory_offset: reader.read_u32()?,
        },
        TAG_HEAP_ALLOCATION => TraceEntry::HeapAllocation {
            id: reader.read_i32()?,
            size: reader.read_u32()?,
            address: reader.read_u64()?,
        },
        TAG_HEAP_FREE => TraceEntry::HeapFree {
            id: reader.read_i32()?,
        },
        TAG_BRANCH => {
            let flags = reader.read_u8()?;
            let kind = BranchKind::from_bits((flags >> 1) & 0b11)
                .ok_or(TraceFormatError::InvalidBranchKind { bits: flags, offset })?;
            TraceEntry::Branch {
                taken: flags & 1 != 0,
                kind,
                source_image_id: reader.read_i32()?,
                source_offset: reader.read_u32()?,
                destination_image_id: reader.read_i32()?,
                destination_offset: reader.read_u32()?,
            }
        }
        TAG_STACK_ALLOCATION => TraceEntry::StackAllocation {
            id: reader.read_i32()?,
            instruction_image_id: reader.read_i32()?,
            instruction_offset: reader.read_u32()?,
            size: reader.read_u32()?,
            address: reader.read_u64()?,
        },
        tag => return Err(TraceFormatError::UnknownTag { tag, offset }),
    };
    Ok(Some(entry))
}

/// Writes one framed entry; the exact inverse of [`decode_entry`].
pub fn encode_entry<W: std::io::Write>(
    writer: &mut TraceWriter<W>,
    entry: &TraceEntry,
) -> std::io::Result<()> {
    writer.write_u8(entry.tag())?;
    match *entry {
        TraceEntry::ImageMemoryAccess {
            is_write,
            size,
            instruction_image_id,
            instruction_offset,
            memory_image_id,
            memory_offset,
        } => {
            writer.write_bool(is_write)?;
            writer.write_i16(size)?;
            writer.write_i32(instruction_image_id)?;
            writer.write_u32(instruction_offset)?;
            writer.write_i32(memory_image_id)?;
            writer.write_u32(memory_offset)?;
        }
        TraceEntry::HeapMemoryAccess {
            is_write,
            size,
            instruction_image_id,
            instruction_offset,
            heap_block_id,
            memory_offset,
        } => {
            writer.write_bool(is_write)?;
            writer.write_i16(size)?;
            writer.write_i32(instruction_image_id)?;
            writer.write_u32(instruction_offset)?;
            writer.write_i32(heap_block_id)?;
            writer.write_u32(memory_offset)?;
        }
        TraceEntry::StackMemoryAccess {
            is_write,
            size,
            instruction_image_id,
            instruction_offset,
            stack_block_id,
            memory_offset,
        } => {
            writer.write_bool(is_write)?;
            writer.write_i16(size)?;
            writer.write_i32(instruction_image_id)?;
            writer.write_u32(instruction_offset)?;
            writer.write_i32(stack_block_id)?;
            writer.write_u32(memory_offset)?;
        }
        TraceEntry::HeapAllocation { id, size, address } => {
            writer.write_i32(id)?;
            writer.write_u32(size)?;
            writer.write_u64(address)?;
        }
        TraceEntry::HeapFree { id } => {
            writer.write_i32(id)?;
        }
        TraceEntry::Branch {
            taken,
            kind,
            source_image_id,
            source_offset,
            destination_image_id,
            destination_offset,
        } => {
            writer.write_u8((taken as u8) | ((kind as u8) << 1))?;
            writer.write_i32(source_image_id)?;
            writer.write_u32(source_offset)?;
            writer.write_i32(destination_image_id)?;
            writer.write_u32(destination_offset)?;
        }
        TraceEntry::StackAllocation {
            id,
            instruction_image_id,
            instruction_offset,
            size,
            address,
        } => {
            writer.write_i32(id)?;
            writer.write_i32(instruction_image_id)?;
            writer.write_u32(instruction_offset)?;
            writer.write_u32(size)?;
            writer.write_u64(address)?;
        }
    }
    Ok(())
}

/// Encodes a slice of entries into a fresh buffer.
pub fn encode_entries(entries: &[TraceEntry]) -> Vec<u8> {
    let mut writer = TraceWriter::buffered();
    for entry in entries {
        // Writing into a Vec cannot fail.
        encode_entry(&mut writer, entry).expect("in-memory encode failed");
    }
    writer.into_inner()
}

fn read_trace_bytes(path: &Path) -> Result<Vec<u8>, TraceFormatError> {
    let mut bytes = Vec::new();
    if path.extension().map_or(false, |e| e == "gz") {
        GzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;
    } else {
        File::open(path)?.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

/// The shared setup-phase trace, decoded once and then immutable. All
/// testcase files of a run hold it behind an `Arc`.
#[derive(Debug, Default)]
pub struct TracePrefix {
    entries: Vec<TraceEntry>,
}

impl TracePrefix {
    pub fn empty() -> Arc<TracePrefix> {
        Arc::new(TracePrefix::default())
    }

    pub fn from_bytes(data: &[u8]) -> Result<TracePrefix, TraceFormatError> {
        let mut reader = BufferReader::new(data);
        let mut entries = Vec::new();
        while let Some(entry) = decode_entry(&mut reader)? {
            entries.push(entry);
        }
        Ok(TracePrefix { entries })
    }

    pub fn from_file(path: &Path) -> Result<TracePrefix, TraceFormatError> {
        TracePrefix::from_bytes(&read_trace_bytes(path)?)
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }
}

enum TraceBody {
    Buffer(Vec<u8>),
    File(PathBuf),
}

/// One testcase's trace: a reference to the shared prefix plus a body that
/// is either held in memory or streamed from disk.
pub struct TraceFile {
    prefix: Arc<TracePrefix>,
    body: TraceBody,
    testcase_id: TestcaseId,
}

impl TraceFile {
    /// Opens a trace file; `.gz` bodies are inflated into memory, everything
    /// else is streamed from disk during iteration.
    pub fn open(
        path: &Path,
        prefix: Arc<TracePrefix>,
        testcase_id: TestcaseId,
    ) -> Result<TraceFile, TraceFormatError> {
        let body = if path.extension().map_or(false, |e| e == "gz") {
            TraceBody::Buffer(read_trace_bytes(path)?)
        } else {
            // Probe the file now so open errors surface here, not mid-run.
            FileReader::open(path)?;
            TraceBody::File(path.to_path_buf())
        };
        Ok(TraceFile {
            prefix,
            body,
            testcase_id,
        })
    }

    pub fn from_bytes(
        bytes: Vec<u8>,
        prefix: Arc<TracePrefix>,
        testcase_id: TestcaseId,
    ) -> TraceFile {
        TraceFile {
            prefix,
            body: TraceBody::Buffer(bytes),
            testcase_id,
        }
    }

    pub fn testcase_id(&self) -> TestcaseId {
        self.testcase_id
    }

    pub fn prefix(&self) -> &Arc<TracePrefix> {
        &self.prefix
    }

    fn body_reader(&self) -> Result<BodyReader<'_>, TraceFormatError> {
        Ok(match &self.body {
            TraceBody::Buffer(bytes) => BodyReader::Buffer(BufferReader::new(bytes)),
            TraceBody::File(path) => BodyReader::File(FileReader::open(path)?),
        })
    }

    /// Allocating iteration over the body entries.
    pub fn entries(&self) -> Result<EntryIter<'_>, TraceFormatError> {
        Ok(EntryIter {
            prefix: self.prefix.entries()[..0].iter(),
            reader: self.body_reader()?,
            failed: false,
        })
    }

    /// Allocating iteration over prefix entries followed by body entries.
    pub fn entries_with_prefix(&self) -> Result<EntryIter<'_>, TraceFormatError> {
        Ok(EntryIter {
            prefix: self.prefix.entries().iter(),
            reader: self.body_reader()?,
            failed: false,
        })
    }

    /// Non-allocating streaming decode of the body.
    pub fn stream(&self) -> Result<EntryDecoder<'_>, TraceFormatError> {
        Ok(EntryDecoder {
            prefix: self.prefix.entries()[..0].iter(),
            reader: self.body_reader()?,
            scratch: TraceEntry::HeapFree { id: 0 },
        })
    }

    /// Non-allocating streaming decode of prefix then body.
    pub fn stream_with_prefix(&self) -> Result<EntryDecoder<'_>, TraceFormatError> {
        Ok(EntryDecoder {
            prefix: self.prefix.entries().iter(),
            reader: self.body_reader()?,
            scratch: TraceEntry::HeapFree { id: 0 },
        })
    }
}

enum BodyReader<'a> {
    Buffer(BufferReader<'a>),
    File(FileReader),
}

impl TraceRead for BodyReader<'_> {
    fn position(&self) -> u64 {
        match self {
            BodyReader::Buffer(r) => r.position(),
            BodyReader::File(r) => r.position(),
        }
    }

    fn length(&self) -> u64 {
        match self {
            BodyReader::Buffer(r) => r.length(),
            BodyReader::File(r) => r.length(),
        }
    }

    fn seek_to(&mut self, position: u64) -> Result<(), TraceFormatError> {
        match self {
            BodyReader::Buffer(r) => r.seek_to(position),
            BodyReader::File(r) => r.seek_to(position),
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), TraceFormatError> {
        match self {
            BodyReader::Buffer(r) => r.read_bytes(buf),
            BodyReader::File(r) => r.read_bytes(buf),
        }
    }
}

/// Iterator yielding owned entries; a decode error ends the iteration after
/// being reported once.
pub struct EntryIter<'a> {
    prefix: slice::Iter<'a, TraceEntry>,
    reader: BodyReader<'a>,
    failed: bool,
}

impl Iterator for EntryIter<'_> {
    type Item = Result<TraceEntry, TraceFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(entry) = self.prefix.next() {
            return Some(Ok(*entry));
        }
        match decode_entry(&mut self.reader) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Streaming decoder for the hot path: one scratch entry is overwritten per
/// step and returned by reference. The reference is only valid until the
/// next call to [`EntryDecoder::next_entry`]; consumers that need to keep an
/// entry copy it (entries are `Copy`).
pub struct EntryDecoder<'a> {
    prefix: slice::Iter<'a, TraceEntry>,
    reader: BodyReader<'a>,
    scratch: TraceEntry,
}

impl EntryDecoder<'_> {
    pub fn next_entry(&mut self) -> Result<Option<&TraceEntry>, TraceFormatError> {
        if let Some(entry) = self.prefix.next() {
            self.scratch = *entry;
            return Ok(Some(&self.scratch));
        }
        match decode_entry(&mut self.reader)? {
            Some(entry) => {
                self.scratch = entry;
                Ok(Some(&self.scratch))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BranchKind;

    fn sample_entries() -> Vec<TraceEntry> {
        vec![
            TraceEntry::HeapAllocation {
                id: 1,
                size: 16,
                address: 0xA000,
            },
            TraceEntry::StackAllocation {
                id: 2,
                instruction_image_id: 0,
                instruction_offset: 0x40,
                size: 64,
                address: 0x7FFF_0000,
            },
            TraceEntry::Branch {
                taken: true,
                kind: BranchKind::Call,
                source_image_id: 0,
                source_offset: 0x10,
                destination_image_id: 1,
                destination_offset: 0x20,
            },
            TraceEntry::Branch {
                taken: false,
                kind: BranchKind::Jump,
                source_image_id: 1,
                source_offset: 0x24,
                destination_image_id: 0,
                destination_offset: 0,
            },
            TraceEntry::ImageMemoryAccess {
                is_write: false,
                size: 8,
                instruction_image_id: 1,
                instruction_offset: 0x28,
                memory_image_id: 0,
                memory_offset: 0x100,
            },
            TraceEntry::HeapMemoryAccess {
                is_write: true,
                size: 4,
                instruction_image_id: 1,
                instruction_offset: 0x2C,
                heap_block_id: 1,
                memory_offset: 8,
            },
            TraceEntry::StackMemoryAccess {
                is_write: false,
                size: 2,
                instruction_image_id: 1,
                instruction_offset: 0x30,
                stack_block_id: -1,
                memory_offset: 4,
            },
            TraceEntry::Branch {
                taken: true,
                kind: BranchKind::Return,
                source_image_id: 1,
                source_offset: 0x34,
                destination_image_id: 0,
                destination_offset: 0x14,
            },
            TraceEntry::HeapFree { id: 1 },
        ]
    }

    #[test]
    fn encode_decode_round_trip_is_byte_exact() {
        let entries = sample_entries();
        let bytes = encode_entries(&entries);

        let mut reader = BufferReader::new(&bytes);
        let mut decoded = Vec::new();
        while let Some(entry) = decode_entry(&mut reader).unwrap() {
            decoded.push(entry);
        }
        assert_eq!(decoded, entries);
        assert_eq!(encode_entries(&decoded), bytes);
    }

    #[test]
    fn unknown_tag_is_a_format_error_with_offset() {
        let mut bytes = encode_entries(&[TraceEntry::HeapFree { id: 3 }]);
        let bad_offset = bytes.len() as u64;
        bytes.push(0x99);

        let mut reader = BufferReader::new(&bytes);
        decode_entry(&mut reader).unwrap().unwrap();
        match decode_entry(&mut reader) {
            Err(TraceFormatError::UnknownTag { tag, offset }) => {
                assert_eq!(tag, 0x99);
                assert_eq!(offset, bad_offset);
            }
            other => panic!("expected unknown tag, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_payload_is_a_format_error() {
        let bytes = encode_entries(&[TraceEntry::HeapAllocation {
            id: 1,
            size: 2,
            address: 3,
        }]);
        let mut reader = BufferReader::new(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            decode_entry(&mut reader),
            Err(TraceFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn with_prefix_iteration_chains_prefix_then_body() {
        let all = sample_entries();
        let (head, tail) = all.split_at(3);
        let prefix = Arc::new(TracePrefix::from_bytes(&encode_entries(head)).unwrap());
        let trace = TraceFile::from_bytes(encode_entries(tail), prefix, 0);

        let body_only: Vec<TraceEntry> = trace
            .entries()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(body_only, tail);

        let chained: Vec<TraceEntry> = trace
            .entries_with_prefix()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chained, all);
    }

    #[test]
    fn streaming_decoder_yields_the_same_sequence() {
        let all = sample_entries();
        let (head, tail) = all.split_at(2);
        let prefix = Arc::new(TracePrefix::from_bytes(&encode_entries(head)).unwrap());
        let trace = TraceFile::from_bytes(encode_entries(tail), prefix, 7);

        let mut decoder = trace.stream_with_prefix().unwrap();
        let mut streamed = Vec::new();
        while let Some(entry) = decoder.next_entry().unwrap() {
            streamed.push(*entry);
        }
        assert_eq!(streamed, all);
    }

    #[test]
    fn gz_trace_files_are_inflated_on_open() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let entries = sample_entries();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.trace.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(&encode_entries(&entries)).unwrap();
        encoder.finish().unwrap();

        let trace = TraceFile::open(&path, TracePrefix::empty(), 1).unwrap();
        let decoded: Vec<TraceEntry> = trace
            .entries()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, entries);
    }
}
