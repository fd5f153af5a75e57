//! Compression primitive keyed by an algorithm flag set.
//!
//! Packages only carry zlib today; the flag word leaves room for other
//! algorithms and for speed/size bias hints.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::util::{Error, Result};

/// Compression algorithm and bias flags, stored verbatim in package summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CompressionFlags(pub u32);

impl CompressionFlags {
    pub const NONE: CompressionFlags = CompressionFlags(0x00);
    pub const ZLIB: CompressionFlags = CompressionFlags(0x01);
    /// Prefer fast compression over small output.
    pub const BIAS_SPEED: CompressionFlags = CompressionFlags(0x10);
    /// Prefer small output over speed.
    pub const BIAS_MEMORY: CompressionFlags = CompressionFlags(0x20);

    const ALGORITHM_MASK: u32 = 0x0F;

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 & Self::ALGORITHM_MASK == 0
    }

    #[inline]
    pub fn contains(self, other: CompressionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Algorithm bits only.
    #[inline]
    pub fn algorithm(self) -> CompressionFlags {
        CompressionFlags(self.0 & Self::ALGORITHM_MASK)
    }

    fn level(self) -> Compression {
        if self.contains(Self::BIAS_SPEED) {
            Compression::fast()
        } else if self.contains(Self::BIAS_MEMORY) {
            Compression::best()
        } else {
            Compression::default()
        }
    }
}

impl std::ops::BitOr for CompressionFlags {
    type Output = CompressionFlags;
    fn bitor(self, rhs: Self) -> Self {
        CompressionFlags(self.0 | rhs.0)
    }
}

/// Compress `data` with the algorithm named by `flags`.
///
/// `NONE` copies the input.
pub fn compress_memory(flags: CompressionFlags, data: &[u8]) -> Result<Vec<u8>> {
    match flags.algorithm() {
        CompressionFlags::NONE => Ok(data.to_vec()),
        CompressionFlags::ZLIB => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), flags.level());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        other => Err(Error::other(format!("unknown compression algorithm {:#x}", other.0))),
    }
}

/// Decompress `data`, which must expand to exactly `uncompressed_size` bytes.
pub fn uncompress_memory(
    flags: CompressionFlags,
    data: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    let out = match flags.algorithm() {
        CompressionFlags::NONE => data.to_vec(),
        CompressionFlags::ZLIB => {
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::with_capacity(uncompressed_size);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::CorruptChunk(format!("zlib: {}", e)))?;
            out
        }
        other => return Err(Error::other(format!("unknown compression algorithm {:#x}", other.0))),
    };
    if out.len() != uncompressed_size {
        return Err(Error::CorruptChunk(format!(
            "expected {} uncompressed bytes, got {}",
            uncompressed_size,
            out.len()
        )));
    }
    Ok(out)
}
