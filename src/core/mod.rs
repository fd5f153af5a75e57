//! Core layer - codecs and scheduling primitives.
//!
//! This module provides:
//! - [`CompressionFlags`] - Compression primitive keyed by algorithm
//! - [`chunk`] - Compressed-chunk codec with a random-access directory
//! - [`TimeBudget`] - Soft deadline polled by cooperative phases
//! - [`EndianRead`] / [`EndianWrite`] - Byte-order aware primitive I/O
//! - [`ChunkCache`] - Size-bounded cache of decompressed chunks

mod compression;
mod budget;
mod endian;
mod cache;
pub mod chunk;

pub use compression::{compress_memory, uncompress_memory, CompressionFlags};
pub use budget::{TimeBudget, DEFAULT_TIME_GRANULARITY};
pub use endian::{EndianRead, EndianWrite};
pub use cache::{ChunkCache, ChunkKey};
pub use chunk::{compress_file, decompress_file, ChunkDirectory, CompressedChunkInfo};
