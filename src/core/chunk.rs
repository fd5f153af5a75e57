//! Compressed-chunk codec.
//!
//! Layout of one compressed block:
//!
//! ```text
//! [tag: u32][chunk_size: u32]                      tag info
//! [compressed_total: i32][uncompressed_total: i32] summary info
//! [compressed: i32][uncompressed: i32] * N         chunk directory
//! [chunk 0 bytes][chunk 1 bytes]...
//! ```
//!
//! Each chunk is compressed independently, so any uncompressed range can
//! be served by decompressing only the chunks that overlap it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

use tracing::{debug, trace};

use super::compression::{compress_memory, uncompress_memory, CompressionFlags};
use super::endian::{EndianRead, EndianWrite};
use crate::format::{LOADING_COMPRESSION_CHUNK_SIZE, PACKAGE_FILE_TAG, PACKAGE_FILE_TAG_SWAPPED};
use crate::util::{Error, Result};

/// Bytes taken by the tag and summary infos.
pub const CHUNK_HEADER_SIZE: u64 = 16;

/// Size pair of one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressedChunkInfo {
    pub compressed_size: i32,
    pub uncompressed_size: i32,
}

/// Write `data` as a compressed block at the current position.
///
/// The directory is written as zeros first and patched once the chunk
/// sizes are known. Returns the number of bytes written.
pub fn write_compressed<W: Write + Seek>(
    w: &mut W,
    data: &[u8],
    flags: CompressionFlags,
    chunk_size: usize,
    swap: bool,
) -> Result<u64> {
    let chunk_size = chunk_size.max(1);
    let start = w.stream_position()?;
    let count = data.len().div_ceil(chunk_size);

    w.write_u32_as(PACKAGE_FILE_TAG, swap)?;
    w.write_u32_as(chunk_size as u32, swap)?;
    for _ in 0..=count {
        w.write_i32_as(0, swap)?;
        w.write_i32_as(0, swap)?;
    }

    let mut infos = Vec::with_capacity(count);
    let mut total = 0usize;
    for piece in data.chunks(chunk_size) {
        let compressed = compress_memory(flags, piece)?;
        w.write_all(&compressed)?;
        total += compressed.len();
        infos.push(CompressedChunkInfo {
            compressed_size: compressed.len() as i32,
            uncompressed_size: piece.len() as i32,
        });
    }
    let end = w.stream_position()?;

    w.seek(SeekFrom::Start(start + 8))?;
    w.write_i32_as(total as i32, swap)?;
    w.write_i32_as(data.len() as i32, swap)?;
    for info in &infos {
        w.write_i32_as(info.compressed_size, swap)?;
        w.write_i32_as(info.uncompressed_size, swap)?;
    }
    w.seek(SeekFrom::Start(end))?;

    trace!(chunks = count, uncompressed = data.len(), compressed = total, "wrote compressed block");
    Ok(end - start)
}

/// Compress `data` into a standalone in-memory block.
pub fn compress_block(data: &[u8], flags: CompressionFlags, chunk_size: usize) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    write_compressed(&mut cursor, data, flags, chunk_size, false)?;
    Ok(cursor.into_inner())
}

/// Read a whole compressed block at the current position.
pub fn read_compressed<R: Read + Seek>(r: &mut R, flags: CompressionFlags) -> Result<Vec<u8>> {
    let dir = ChunkDirectory::read(r, flags)?;
    let data = dir.read_all(r)?;
    r.seek(SeekFrom::Start(dir.end_offset()))?;
    Ok(data)
}

/// Decompress a standalone in-memory block.
pub fn decompress_block(block: &[u8], flags: CompressionFlags) -> Result<Vec<u8>> {
    read_compressed(&mut std::io::Cursor::new(block), flags)
}

/// Compress a whole file into a single compressed block.
///
/// Returns the size of the written file.
pub fn compress_file(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    flags: CompressionFlags,
    chunk_size: usize,
) -> Result<u64> {
    let data = read_file(src.as_ref())?;
    let mut w = BufWriter::new(File::create(dst.as_ref())?);
    let written = write_compressed(&mut w, &data, flags, chunk_size, false)?;
    w.flush()?;
    debug!(src = %src.as_ref().display(), uncompressed = data.len(), compressed = written, "compressed file");
    Ok(written)
}

/// Inverse of [`compress_file`]. Returns the uncompressed size.
pub fn decompress_file(src: impl AsRef<Path>, dst: impl AsRef<Path>, flags: CompressionFlags) -> Result<u64> {
    let file = File::open(src.as_ref()).map_err(|e| not_found(e, src.as_ref()))?;
    let data = read_compressed(&mut BufReader::new(file), flags)?;
    std::fs::write(dst.as_ref(), &data)?;
    Ok(data.len() as u64)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| not_found(e, path))
}

fn not_found(e: std::io::Error, path: &Path) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::FileNotFound(path.to_path_buf())
    } else {
        Error::Io(e)
    }
}

/// Parsed directory of one compressed block.
#[derive(Debug, Clone)]
pub struct ChunkDirectory {
    flags: CompressionFlags,
    chunk_size: usize,
    byte_swapped: bool,
    compressed_size: usize,
    uncompressed_size: usize,
    chunks: Vec<CompressedChunkInfo>,
    /// Uncompressed start of each chunk.
    starts: Vec<usize>,
    /// Absolute compressed offset of each chunk.
    offsets: Vec<u64>,
    data_offset: u64,
}

impl ChunkDirectory {
    /// Parse the tag, summary and directory at the current position.
    ///
    /// The tag decides the byte order of the block. A value that is
    /// neither the tag nor its byte-swapped form is corruption.
    pub fn read<R: Read + Seek>(r: &mut R, flags: CompressionFlags) -> Result<Self> {
        let tag = r.read_u32_as(false)?;
        let swap = if tag == PACKAGE_FILE_TAG {
            false
        } else if tag == PACKAGE_FILE_TAG_SWAPPED {
            true
        } else {
            return Err(Error::CorruptChunk(format!("bad chunk tag {:#010x}", tag)));
        };

        let mut chunk_size = r.read_u32_as(swap)?;
        if chunk_size == PACKAGE_FILE_TAG {
            chunk_size = LOADING_COMPRESSION_CHUNK_SIZE as u32;
        }
        if chunk_size == 0 {
            return Err(Error::CorruptChunk("zero chunk size".into()));
        }
        let chunk_size = chunk_size as usize;

        let compressed_size = Self::size_field(r.read_i32_as(swap)?)?;
        let uncompressed_size = Self::size_field(r.read_i32_as(swap)?)?;
        let count = uncompressed_size.div_ceil(chunk_size);

        // Each directory entry is two i32 fields.
        let here = r.stream_position()?;
        let end = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(here))?;
        let available = end.saturating_sub(here) / 8;
        if count as u64 > available {
            return Err(Error::CorruptChunk(format!(
                "directory of {} chunks does not fit in {} remaining bytes",
                count,
                end.saturating_sub(here)
            )));
        }

        let mut chunks = Vec::with_capacity(count);
        for _ in 0..count {
            let compressed = r.read_i32_as(swap)?;
            let uncompressed = r.read_i32_as(swap)?;
            Self::size_field(compressed)?;
            if Self::size_field(uncompressed)? > chunk_size {
                return Err(Error::CorruptChunk(format!(
                    "chunk of {} bytes exceeds chunk size {}",
                    uncompressed, chunk_size
                )));
            }
            chunks.push(CompressedChunkInfo { compressed_size: compressed, uncompressed_size: uncompressed });
        }

        let data_offset = r.stream_position()?;
        let mut starts = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        let (mut u, mut c) = (0usize, data_offset);
        for info in &chunks {
            starts.push(u);
            offsets.push(c);
            u += info.uncompressed_size as usize;
            c += info.compressed_size as u64;
        }
        if u != uncompressed_size || (c - data_offset) as usize != compressed_size {
            return Err(Error::CorruptChunk(format!(
                "directory totals {}/{} disagree with summary {}/{}",
                c - data_offset,
                u,
                compressed_size,
                uncompressed_size
            )));
        }

        Ok(Self {
            flags,
            chunk_size,
            byte_swapped: swap,
            compressed_size,
            uncompressed_size,
            chunks,
            starts,
            offsets,
            data_offset,
        })
    }

    fn size_field(value: i32) -> Result<usize> {
        usize::try_from(value).map_err(|_| Error::CorruptChunk(format!("negative size {}", value)))
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn is_byte_swapped(&self) -> bool {
        self.byte_swapped
    }

    #[inline]
    pub fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    #[inline]
    pub fn compressed_size(&self) -> usize {
        self.compressed_size
    }

    #[inline]
    pub fn chunks(&self) -> &[CompressedChunkInfo] {
        &self.chunks
    }

    /// Absolute position just past the block.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.data_offset + self.compressed_size as u64
    }

    /// Index of the chunk holding uncompressed `offset` (linear scan).
    pub fn locate(&self, offset: usize) -> Option<usize> {
        self.chunks.iter().enumerate().position(|(i, info)| {
            offset >= self.starts[i] && offset < self.starts[i] + info.uncompressed_size as usize
        })
    }

    /// Uncompressed byte range covered by chunk `index`.
    pub fn chunk_range(&self, index: usize) -> Range<usize> {
        let start = self.starts[index];
        start..start + self.chunks[index].uncompressed_size as usize
    }

    /// Decompress a single chunk.
    pub fn read_chunk<R: Read + Seek>(&self, r: &mut R, index: usize) -> Result<Vec<u8>> {
        let info = self
            .chunks
            .get(index)
            .ok_or_else(|| Error::CorruptChunk(format!("chunk {} out of range", index)))?;
        r.seek(SeekFrom::Start(self.offsets[index]))?;
        let mut compressed = vec![0u8; info.compressed_size as usize];
        r.read_exact(&mut compressed)?;
        uncompress_memory(self.flags, &compressed, info.uncompressed_size as usize)
    }

    /// Decompress only the chunks overlapping `range` and slice them.
    pub fn read_range<R: Read + Seek>(&self, r: &mut R, range: Range<usize>) -> Result<Vec<u8>> {
        if range.start > range.end || range.end > self.uncompressed_size {
            return Err(Error::UnexpectedEof(range.end as u64));
        }
        let mut out = Vec::with_capacity(range.len());
        if range.is_empty() {
            return Ok(out);
        }
        let Some(first) = self.locate(range.start) else {
            return Err(Error::UnexpectedEof(range.start as u64));
        };
        for index in first..self.chunks.len() {
            let chunk = self.chunk_range(index);
            if chunk.start >= range.end {
                break;
            }
            let data = self.read_chunk(r, index)?;
            let lo = range.start.max(chunk.start) - chunk.start;
            let hi = range.end.min(chunk.end) - chunk.start;
            out.extend_from_slice(&data[lo..hi]);
        }
        Ok(out)
    }

    /// Decompress every chunk.
    pub fn read_all<R: Read + Seek>(&self, r: &mut R) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.uncompressed_size];
        for index in 0..self.chunks.len() {
            let data = self.read_chunk(r, index)?;
            out[self.chunk_range(index)].copy_from_slice(&data);
        }
        Ok(out)
    }
}
