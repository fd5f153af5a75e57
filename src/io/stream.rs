//! Package writer stream.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;

use crate::core::EndianWrite;
use crate::util::Result;

/// Output stream for writing package data.
///
/// Tracks the write position and, when byte swapping is on, writes every
/// multi-byte primitive big-endian.
pub struct OStream<W: Write + Seek = BufWriter<File>> {
    writer: W,
    pos: u64,
    byte_swap: bool,
}

impl OStream<BufWriter<File>> {
    /// Create a new output stream for the given file path.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(BufWriter::with_capacity(2 * 1024 * 1024, file)))
    }
}

impl OStream<Cursor<Vec<u8>>> {
    /// In-memory stream.
    pub fn memory() -> Self {
        Self::new(Cursor::new(Vec::new()))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

impl<W: Write + Seek> OStream<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, pos: 0, byte_swap: false }
    }

    pub fn set_byte_swap(&mut self, byte_swap: bool) {
        self.byte_swap = byte_swap;
    }

    #[inline]
    pub fn byte_swap(&self) -> bool {
        self.byte_swap
    }

    /// Get the current write position.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Write bytes and advance position.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.writer.write_i32_as(value, self.byte_swap)?;
        self.pos += 4;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32_as(value, self.byte_swap)?;
        self.pos += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64_as(value, self.byte_swap)?;
        self.pos += 8;
        Ok(())
    }

    /// Seek to a position and return it.
    pub fn seek_to(&mut self, pos: u64) -> Result<u64> {
        self.writer.flush()?;
        self.pos = self.writer.seek(SeekFrom::Start(pos))?;
        Ok(self.pos)
    }

    /// Seek to end and return the position.
    pub fn seek_end(&mut self) -> Result<u64> {
        self.writer.flush()?;
        self.pos = self.writer.seek(SeekFrom::End(0))?;
        Ok(self.pos)
    }

    /// Flush the buffer to the underlying writer.
    pub fn flush_all(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Seek> Write for OStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write + Seek> Seek for OStream<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.writer.seek(pos)?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_and_patch() {
        let mut s = OStream::memory();
        s.write_u32(0).unwrap();
        s.write_bytes(b"abcd").unwrap();
        assert_eq!(s.pos(), 8);
        s.seek_to(0).unwrap();
        s.write_u32(0xAABBCCDD).unwrap();
        assert_eq!(s.seek_end().unwrap(), 8);
        let bytes = s.into_bytes();
        assert_eq!(&bytes[..4], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&bytes[4..], b"abcd");
    }

    #[test]
    fn test_byte_swap() {
        let mut s = OStream::memory();
        s.set_byte_swap(true);
        s.write_i32(1).unwrap();
        assert_eq!(s.into_bytes(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_file_stream() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut s = OStream::create(tmp.path()).unwrap();
        s.write_u64(42).unwrap();
        s.flush_all().unwrap();
        drop(s);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), 42u64.to_le_bytes());
    }
}
