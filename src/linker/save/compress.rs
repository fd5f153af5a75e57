//! Package-level compression of a saved file.

use std::ops::Range;

use rayon::prelude::*;
use tracing::debug;

use crate::core::{chunk::compress_block, CompressionFlags};
use crate::format::{CompressedChunk, PackageFlags, PackageSummary, MAX_MERGED_COMPRESSION_CHUNK_SIZE};
use crate::util::{Error, Result};

/// Compress a plain package image.
///
/// The summary stays uncompressed. The rest of the header becomes one
/// chunk and export bodies are merged into chunks of at most
/// [`MAX_MERGED_COMPRESSION_CHUNK_SIZE`] (a larger body gets its own
/// chunk). Chunks are compressed in parallel. Returns the new file image
/// and its summary.
pub fn compress_package(
    plain: &[u8],
    summary: &PackageSummary,
    body_ranges: &[Range<usize>],
    flags: CompressionFlags,
    chunk_size: usize,
    swap: bool,
) -> Result<(Vec<u8>, PackageSummary)> {
    if flags.is_none() {
        return Err(Error::other("package compression requested without a codec"));
    }
    let ranges = chunk_ranges(summary, body_ranges, plain.len());
    let blocks = ranges
        .par_iter()
        .map(|r| compress_block(&plain[r.clone()], flags, chunk_size))
        .collect::<Result<Vec<_>>>()?;

    let mut out_summary = summary.clone();
    out_summary.package_flags.insert(PackageFlags::STORE_COMPRESSED);
    out_summary.compression_flags = flags;
    out_summary.compressed_chunks = ranges
        .iter()
        .map(|r| CompressedChunk {
            uncompressed_offset: r.start as i32,
            uncompressed_size: r.len() as i32,
            compressed_offset: 0,
            compressed_size: 0,
        })
        .collect();

    let mut offset = out_summary.serialized_size();
    for (chunk, block) in out_summary.compressed_chunks.iter_mut().zip(&blocks) {
        chunk.compressed_offset = offset as i32;
        chunk.compressed_size = block.len() as i32;
        offset += block.len();
    }

    let mut out = Vec::with_capacity(offset);
    out_summary.write(&mut out, swap)?;
    for block in &blocks {
        out.extend_from_slice(block);
    }
    debug!(chunks = blocks.len(), plain = plain.len(), compressed = out.len(), "compressed package");
    Ok((out, out_summary))
}

/// Uncompressed ranges covering everything after the summary.
fn chunk_ranges(summary: &PackageSummary, body_ranges: &[Range<usize>], total: usize) -> Vec<Range<usize>> {
    let header_start = summary.name_offset.max(0) as usize;
    let header_end = (summary.total_header_size.max(0) as usize).clamp(header_start, total);
    let mut ranges = Vec::new();
    if header_end > header_start {
        ranges.push(header_start..header_end);
    }

    let mut bodies: Vec<Range<usize>> = body_ranges.iter().filter(|r| !r.is_empty()).cloned().collect();
    bodies.sort_by_key(|r| r.start);
    let mut current: Option<Range<usize>> = None;
    let mut cursor = header_end;
    for body in bodies {
        match current.as_mut() {
            Some(merged) if merged.end == body.start && body.end - merged.start <= MAX_MERGED_COMPRESSION_CHUNK_SIZE => {
                merged.end = body.end;
            }
            _ => {
                ranges.extend(current.take());
                let start = body.start.max(cursor);
                current = Some(start..body.end);
            }
        }
        cursor = body.end;
    }
    ranges.extend(current);

    if cursor < total {
        ranges.push(cursor..total);
    }
    ranges
}
