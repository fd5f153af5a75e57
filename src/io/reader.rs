//! Package reader.
//!
//! Serves logical (uncompressed) offsets. For compressed packages the
//! summary is read raw and everything after it is served from the
//! package chunk directory, decompressing one chunk at a time. With an
//! [`AsyncIoSystem`] attached, [`PackageReader::precache`] issues
//! background reads and reports readiness without blocking.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::async_io::{AsyncIoSystem, IoCounter, IoPriority, IoRequestId};
use super::DVD_MIN_READ_SIZE;
use crate::core::chunk::decompress_block;
use crate::core::{ChunkCache, ChunkKey, CompressionFlags};
use crate::format::CompressedChunk;
use crate::util::{Error, Result};

/// How a [`PackageReader`] accesses its file.
#[derive(Clone)]
pub struct ReaderOptions {
    /// Map the file instead of issuing seek/read calls.
    pub use_mmap: bool,
    /// Background reader used by [`PackageReader::precache`].
    pub io: Option<Arc<AsyncIoSystem>>,
}

impl ReaderOptions {
    pub fn new() -> Self {
        Self { use_mmap: true, io: None }
    }

    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn io(mut self, io: Option<Arc<AsyncIoSystem>>) -> Self {
        self.io = io;
        self
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::new()
    }
}

enum Source {
    /// Memory-mapped file (preferred for large files)
    Mmap(Mmap),
    /// Direct file access (fallback, and for empty files)
    File(File),
}

struct CompressionMap {
    flags: CompressionFlags,
    chunks: Vec<CompressedChunk>,
}

impl CompressionMap {
    /// First logical offset served from chunks.
    fn start(&self) -> u64 {
        self.chunks.first().map_or(u64::MAX, |c| c.uncompressed_offset as u64)
    }

    fn end(&self) -> u64 {
        self.chunks.last().and_then(|c| c.uncompressed_end()).unwrap_or(0)
    }

    fn find(&self, offset: u64) -> Option<usize> {
        self.chunks.iter().position(|c| c.contains(offset))
    }
}

/// One outstanding or completed background read.
struct Precache {
    /// Logical start for raw reads, chunk index for compressed reads.
    start: u64,
    len: usize,
    chunk: Option<usize>,
    id: IoRequestId,
    data: Arc<Mutex<Vec<u8>>>,
    counter: IoCounter,
}

impl Precache {
    #[inline]
    fn is_done(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == 0
    }

    #[inline]
    fn covers(&self, offset: u64, size: usize) -> bool {
        self.chunk.is_none() && offset >= self.start && offset + size as u64 <= self.start + self.len as u64
    }
}

/// Seekable reader over one package file.
pub struct PackageReader {
    path: PathBuf,
    source: Source,
    file_size: u64,
    pos: u64,
    byte_swap: bool,
    compression: Option<CompressionMap>,
    cache: ChunkCache,
    io: Option<Arc<AsyncIoSystem>>,
    current: Option<Precache>,
    next: Option<Precache>,
    pending_chunks: Vec<Precache>,
}

impl PackageReader {
    /// Open a file for reading.
    pub fn open(path: impl AsRef<Path>, options: &ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let file_size = file.metadata()?.len();

        let source = if options.use_mmap && file_size > 0 {
            // Safety: the mapping is read-only and packages are not modified while open.
            Source::Mmap(unsafe { Mmap::map(&file) }?)
        } else {
            Source::File(file)
        };

        debug!(path = %path.display(), size = file_size, mmap = matches!(source, Source::Mmap(_)), "opened package reader");
        Ok(Self {
            path: path.to_path_buf(),
            source,
            file_size,
            pos: 0,
            byte_swap: false,
            compression: None,
            cache: ChunkCache::default(),
            io: options.io.clone(),
            current: None,
            next: None,
            pending_chunks: Vec::new(),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical file size.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Logical size: the end of the last chunk for compressed packages.
    pub fn total_size(&self) -> u64 {
        match &self.compression {
            Some(map) => map.end(),
            None => self.file_size,
        }
    }

    #[inline]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn set_byte_swap(&mut self, byte_swap: bool) {
        self.byte_swap = byte_swap;
    }

    #[inline]
    pub fn is_byte_swapped(&self) -> bool {
        self.byte_swap
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Switch to chunk-aware reads for everything at or after the first chunk.
    ///
    /// Chunks must tile the logical address space without gaps.
    pub fn set_compression_map(&mut self, flags: CompressionFlags, chunks: Vec<CompressedChunk>) -> Result<()> {
        for chunk in &chunks {
            if chunk.uncompressed_offset < 0 || chunk.uncompressed_size < 0 {
                return Err(Error::corrupt(format!(
                    "compressed chunk has negative range {}+{}",
                    chunk.uncompressed_offset, chunk.uncompressed_size
                )));
            }
        }
        for pair in chunks.windows(2) {
            if pair[0].uncompressed_end() != Some(pair[1].uncompressed_offset as u64) {
                return Err(Error::corrupt(format!(
                    "compressed chunks not contiguous at {}",
                    pair[1].uncompressed_offset
                )));
            }
        }
        for chunk in &chunks {
            let end = chunk.compressed_offset as u64 + chunk.compressed_size as u64;
            if chunk.compressed_offset < 0 || chunk.compressed_size < 0 || end > self.file_size {
                return Err(Error::corrupt(format!(
                    "compressed chunk at {} outside file",
                    chunk.compressed_offset
                )));
            }
        }
        debug!(chunks = chunks.len(), "reader switched to chunk-aware mode");
        self.compression = Some(CompressionMap { flags, chunks });
        self.cache.clear();
        Ok(())
    }

    /// Read `len` bytes at `offset`.
    pub fn read_region(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.pos = offset;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Ask for `[offset, offset + size)` to be resident.
    ///
    /// Returns `true` when a read of that range will not touch the disk
    /// synchronously. Without an async reader this is always `true`.
    pub fn precache(&mut self, offset: u64, size: usize) -> bool {
        let Some(io) = self.io.clone() else { return true };
        self.absorb_completed();

        let chunk_range = self.compression.as_ref().and_then(|map| {
            if offset < map.start() {
                return None;
            }
            let first = map.find(offset)?;
            let last = map.find(offset + size.max(1) as u64 - 1).unwrap_or(first);
            Some((first, last, map.chunks.len()))
        });

        match chunk_range {
            Some((first, last, count)) => {
                let mut ready = true;
                for index in first..=last {
                    if !self.chunk_resident(index) {
                        ready = false;
                        self.request_chunk(&io, index);
                    }
                }
                if last + 1 < count && !self.chunk_resident(last + 1) {
                    self.request_chunk(&io, last + 1);
                }
                ready
            }
            None => self.precache_raw(&io, offset, size),
        }
    }

    /// Block until every background read issued by this reader has landed.
    pub fn flush_precache(&mut self) {
        if let Some(io) = &self.io {
            io.block_till_all_requests_finished();
        }
        self.absorb_completed();
    }

    fn precache_raw(&mut self, io: &AsyncIoSystem, offset: u64, size: usize) -> bool {
        if let Some(current) = &self.current {
            if current.covers(offset, size) {
                return current.is_done();
            }
        }
        if self.next.as_ref().is_some_and(|n| n.covers(offset, size)) {
            self.current = self.next.take();
            return self.current.as_ref().is_some_and(Precache::is_done);
        }
        if offset >= self.file_size {
            return true;
        }

        let len = size.max(DVD_MIN_READ_SIZE).min((self.file_size - offset) as usize);
        if len < size {
            return true;
        }
        self.current = Some(self.issue_raw(io, offset, len));

        let next_start = offset + len as u64;
        if next_start < self.file_size {
            let next_len = DVD_MIN_READ_SIZE.min((self.file_size - next_start) as usize);
            self.next = Some(self.issue_raw(io, next_start, next_len));
        }
        self.current.as_ref().is_some_and(Precache::is_done)
    }

    fn issue_raw(&self, io: &AsyncIoSystem, offset: u64, len: usize) -> Precache {
        let data = Arc::new(Mutex::new(Vec::new()));
        let counter: IoCounter = Arc::new(AtomicUsize::new(0));
        let id = io.load_data(&self.path, offset, len, Arc::clone(&data), Arc::clone(&counter), IoPriority::Normal);
        trace!(offset, len, "precache raw");
        Precache { start: offset, len, chunk: None, id, data, counter }
    }

    fn chunk_key(&self, index: usize) -> Option<ChunkKey> {
        let chunk = self.compression.as_ref()?.chunks.get(index)?;
        Some(ChunkKey::new(chunk.compressed_offset as u64, chunk.uncompressed_size as usize))
    }

    fn chunk_resident(&self, index: usize) -> bool {
        self.chunk_key(index).is_some_and(|key| self.cache.get(&key).is_some())
    }

    fn request_chunk(&mut self, io: &AsyncIoSystem, index: usize) {
        if self.pending_chunks.iter().any(|p| p.chunk == Some(index)) {
            return;
        }
        let Some(map) = &self.compression else { return };
        let chunk = map.chunks[index];
        let data = Arc::new(Mutex::new(Vec::new()));
        let counter: IoCounter = Arc::new(AtomicUsize::new(0));
        let id = io.load_compressed_data(
            &self.path,
            chunk.compressed_offset as u64,
            chunk.compressed_size as usize,
            map.flags,
            Arc::clone(&data),
            Arc::clone(&counter),
            IoPriority::Normal,
        );
        trace!(index, "precache chunk");
        self.pending_chunks.push(Precache {
            start: chunk.uncompressed_offset as u64,
            len: chunk.uncompressed_size as usize,
            chunk: Some(index),
            id,
            data,
            counter,
        });
    }

    /// Move finished chunk reads into the cache.
    fn absorb_completed(&mut self) {
        let mut finished = Vec::new();
        self.pending_chunks.retain(|p| {
            if p.is_done() {
                finished.push((p.chunk, p.len, std::mem::take(&mut *p.data.lock())));
                false
            } else {
                true
            }
        });
        for (chunk, len, data) in finished {
            if let Some(key) = chunk.and_then(|c| self.chunk_key(c)) {
                if data.len() == len {
                    self.cache.insert(key, data);
                }
            }
        }
    }

    /// Request ids still in flight for this reader.
    pub fn outstanding_requests(&self) -> Vec<IoRequestId> {
        self.current
            .iter()
            .chain(self.next.iter())
            .chain(self.pending_chunks.iter())
            .filter(|p| !p.is_done())
            .map(|p| p.id)
            .collect()
    }

    fn read_physical(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.file_size {
            return Err(Error::UnexpectedEof(pos));
        }
        let len = buf.len().min((self.file_size - pos) as usize);

        for precache in [&self.current, &self.next].into_iter().flatten() {
            if precache.is_done() && precache.covers(pos, len) {
                let data = precache.data.lock();
                let lo = (pos - precache.start) as usize;
                if data.len() >= lo + len {
                    buf[..len].copy_from_slice(&data[lo..lo + len]);
                    return Ok(len);
                }
            }
        }

        match &mut self.source {
            Source::Mmap(map) => {
                let start = pos as usize;
                buf[..len].copy_from_slice(&map[start..start + len]);
            }
            Source::File(file) => {
                file.seek(SeekFrom::Start(pos))?;
                file.read_exact(&mut buf[..len])?;
            }
        }
        Ok(len)
    }

    fn chunk_data(&mut self, index: usize) -> Result<Arc<Vec<u8>>> {
        self.absorb_completed();
        let key = self.chunk_key(index).ok_or_else(|| Error::corrupt(format!("chunk {} missing", index)))?;
        if let Some(data) = self.cache.get(&key) {
            return Ok(data);
        }
        let (flags, chunk) = match &self.compression {
            Some(map) => (map.flags, map.chunks[index]),
            None => return Err(Error::corrupt("reader is not in chunk-aware mode")),
        };
        let mut compressed = vec![0u8; chunk.compressed_size as usize];
        let mut filled = 0;
        while filled < compressed.len() {
            filled += self.read_physical(chunk.compressed_offset as u64 + filled as u64, &mut compressed[filled..])?;
        }
        let data = decompress_block(&compressed, flags)?;
        if data.len() != chunk.uncompressed_size as usize {
            return Err(Error::CorruptChunk(format!(
                "chunk {} decompressed to {} bytes, expected {}",
                index,
                data.len(),
                chunk.uncompressed_size
            )));
        }
        Ok(self.cache.insert(key, data))
    }

    fn read_logical(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.pos;
        let chunk_index = match &self.compression {
            Some(map) if pos >= map.start() => Some(map.find(pos).ok_or(Error::UnexpectedEof(pos))?),
            _ => None,
        };
        match chunk_index {
            Some(index) => {
                let data = self.chunk_data(index)?;
                let start = self.compression.as_ref().map_or(0, |m| m.chunks[index].uncompressed_offset as u64);
                let lo = (pos - start) as usize;
                let len = buf.len().min(data.len() - lo);
                buf[..len].copy_from_slice(&data[lo..lo + len]);
                Ok(len)
            }
            None => {
                let limit = self.compression.as_ref().map_or(u64::MAX, CompressionMap::start);
                let len = buf.len().min((limit - pos) as usize);
                self.read_physical(pos, &mut buf[..len])
            }
        }
    }
}

impl Read for PackageReader {
    /// Reading past the end is an error rather than `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.read_logical(buf).map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for PackageReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.total_size().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        self.pos = target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        Ok(self.pos)
    }
}
