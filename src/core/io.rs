//! Little-endian, position-cursor byte access over an in-memory buffer or a
//! file. Everything in the trace format goes through these readers, so reads
//! are bounds-checked and fail with the offending byte offset.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceFormatError {
    #[error("unknown trace entry tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: u64 },
    #[error("truncated trace entry at offset {offset}: {needed} more byte(s) expected")]
    Truncated { offset: u64, needed: u64 },
    #[error("invalid branch flags {bits:#04x} at offset {offset}")]
    InvalidBranchKind { bits: u8, offset: u64 },
    #[error("trace i/o failed")]
    Io(#[from] io::Error),
}

/// Position-addressable little-endian reads. Implemented by the buffer- and
/// file-backed readers below.
pub trait TraceRead {
    fn position(&self) -> u64;
    fn length(&self) -> u64;
    fn seek_to(&mut self, position: u64) -> Result<(), TraceFormatError>;
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), TraceFormatError>;

    fn remaining(&self) -> u64 {
        self.length().saturating_sub(self.position())
    }

    fn read_u8(&mut self) -> Result<u8, TraceFormatError> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool, TraceFormatError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_i16(&mut self) -> Result<i16, TraceFormatError> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_i16(&buf))
    }

    fn read_i32(&mut self) -> Result<i32, TraceFormatError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_i32(&buf))
    }

    fn read_u32(&mut self) -> Result<u32, TraceFormatError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn read_i64(&mut self) -> Result<i64, TraceFormatError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    fn read_u64(&mut self) -> Result<u64, TraceFormatError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }
}

/// Reader over a borrowed byte slice. Seeks are O(1).
pub struct BufferReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> BufferReader<'a> {
        BufferReader { data, position: 0 }
    }
}

impl TraceRead for BufferReader<'_> {
    fn position(&self) -> u64 {
        self.position as u64
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn seek_to(&mut self, position: u64) -> Result<(), TraceFormatError> {
        if position > self.data.len() as u64 {
            return Err(TraceFormatError::Truncated {
                offset: self.data.len() as u64,
                needed: position - self.data.len() as u64,
            });
        }
        self.position = position as usize;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), TraceFormatError> {
        let available = self.data.len() - self.position;
        if buf.len() > available {
            return Err(TraceFormatError::Truncated {
                offset: self.position as u64,
                needed: (buf.len() - available) as u64,
            });
        }
        buf.copy_from_slice(&self.data[self.position..self.position + buf.len()]);
        self.position += buf.len();
        Ok(())
    }
}

/// Buffered reader over a file on disk.
pub struct FileReader {
    inner: BufReader<File>,
    position: u64,
    length: u64,
}

impl FileReader {
    pub fn open(path: &Path) -> Result<FileReader, TraceFormatError> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        Ok(FileReader {
            inner: BufReader::new(file),
            position: 0,
            length,
        })
    }
}

impl TraceRead for FileReader {
    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn seek_to(&mut self, position: u64) -> Result<(), TraceFormatError> {
        self.inner.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), TraceFormatError> {
        let available = self.length.saturating_sub(self.position);
        if (buf.len() as u64) > available {
            return Err(TraceFormatError::Truncated {
                offset: self.position,
                needed: buf.len() as u64 - available,
            });
        }
        self.inner.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }
}

/// Mirrors the readers for the exact same byte layout. The in-memory variant
/// (`TraceWriter<Vec<u8>>`) is what the preprocessor assembles entries into.
pub struct TraceWriter<W: Write> {
    inner: W,
    position: u64,
}

impl TraceWriter<Vec<u8>> {
    pub fn buffered() -> TraceWriter<Vec<u8>> {
        TraceWriter::new(Vec::new())
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(inner: W) -> TraceWriter<W> {
        TraceWriter { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.inner.write_u8(value)?;
        self.position += 1;
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_i16(&mut self, value: i16) -> io::Result<()> {
        self.inner.write_i16::<LittleEndian>(value)?;
        self.position += 2;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.inner.write_i32::<LittleEndian>(value)?;
        self.position += 4;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.inner.write_u32::<LittleEndian>(value)?;
        self.position += 4;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> io::Result<()> {
        self.inner.write_i64::<LittleEndian>(value)?;
        self.position += 8;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.inner.write_u64::<LittleEndian>(value)?;
        self.position += 8;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
