//! Package summary (file header).

use std::io::{Read, Write};

use super::*;
use crate::core::CompressionFlags;
use crate::util::Guid;

/// Counts recorded by one historical save of the package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationInfo {
    pub export_count: i32,
    pub name_count: i32,
    pub net_object_count: i32,
}

/// One package-level compressed chunk.
///
/// Chunks tile the uncompressed address space after the summary; each
/// one is stored as a compressed block at `compressed_offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressedChunk {
    pub uncompressed_offset: i32,
    pub uncompressed_size: i32,
    pub compressed_offset: i32,
    pub compressed_size: i32,
}

impl CompressedChunk {
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        match (u64::try_from(self.uncompressed_offset), self.uncompressed_end()) {
            (Ok(start), Some(end)) => offset >= start && offset < end,
            _ => false,
        }
    }

    /// End of the uncompressed range, or `None` for a negative field.
    #[inline]
    pub fn uncompressed_end(&self) -> Option<u64> {
        let start = u64::try_from(self.uncompressed_offset).ok()?;
        start.checked_add(u64::try_from(self.uncompressed_size).ok()?)
    }
}

/// Fixed-layout header at the start of every package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSummary {
    pub tag: u32,
    /// Engine file version in the low 16 bits, licensee version in the high 16.
    pub file_version: u32,
    pub total_header_size: i32,
    pub folder_name: String,
    pub package_flags: PackageFlags,
    pub name_count: i32,
    pub name_offset: i32,
    pub export_count: i32,
    pub export_offset: i32,
    pub import_count: i32,
    pub import_offset: i32,
    pub depends_offset: i32,
    pub guid: Guid,
    pub generations: Vec<GenerationInfo>,
    pub engine_version: i32,
    pub cooked_content_version: i32,
    pub compression_flags: CompressionFlags,
    pub compressed_chunks: Vec<CompressedChunk>,
}

impl Default for PackageSummary {
    fn default() -> Self {
        Self {
            tag: PACKAGE_FILE_TAG,
            file_version: make_file_version(PACKAGE_FILE_VERSION, PACKAGE_LICENSEE_VERSION),
            total_header_size: 0,
            folder_name: "None".to_string(),
            package_flags: PackageFlags::NONE,
            name_count: 0,
            name_offset: 0,
            export_count: 0,
            export_offset: 0,
            import_count: 0,
            import_offset: 0,
            depends_offset: 0,
            guid: Guid::ZERO,
            generations: Vec::new(),
            engine_version: ENGINE_VERSION,
            cooked_content_version: COOKED_CONTENT_VERSION,
            compression_flags: CompressionFlags::NONE,
            compressed_chunks: Vec::new(),
        }
    }
}

impl PackageSummary {
    /// Engine file version.
    #[inline]
    pub fn file_version(&self) -> u16 {
        split_file_version(self.file_version).0
    }

    #[inline]
    pub fn licensee_version(&self) -> u16 {
        split_file_version(self.file_version).1
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.package_flags.contains(PackageFlags::STORE_COMPRESSED) && !self.compressed_chunks.is_empty()
    }

    /// Read a summary, returning it with the byte-swap mode its tag implies.
    ///
    /// Versions outside `[VER_MIN_SUPPORTED, PACKAGE_FILE_VERSION]` and
    /// licensee versions newer than ours are refused.
    pub fn read<R: Read + ?Sized>(r: &mut R) -> Result<(Self, bool)> {
        let raw_tag = r.read_u32_as(false)?;
        let swap = match raw_tag {
            PACKAGE_FILE_TAG => false,
            PACKAGE_FILE_TAG_SWAPPED => true,
            other => return Err(Error::BadTag(other)),
        };

        let file_version = r.read_u32_as(swap)?;
        let (version, licensee) = split_file_version(file_version);
        if version < VER_MIN_SUPPORTED || version > PACKAGE_FILE_VERSION || licensee > PACKAGE_LICENSEE_VERSION {
            return Err(Error::UnsupportedVersion {
                version: file_version,
                min: VER_MIN_SUPPORTED as u32,
                max: make_file_version(PACKAGE_FILE_VERSION, PACKAGE_LICENSEE_VERSION),
            });
        }

        let mut s = PackageSummary { tag: PACKAGE_FILE_TAG, file_version, ..Default::default() };
        if version >= VER_TOTAL_HEADER_SIZE {
            s.total_header_size = r.read_i32_as(swap)?;
        }
        s.folder_name = if version >= VER_FOLDER_NAME {
            read_string(r, swap)?
        } else {
            "None".to_string()
        };
        s.package_flags = PackageFlags(r.read_u32_as(swap)?);
        s.name_count = r.read_i32_as(swap)?;
        s.name_offset = r.read_i32_as(swap)?;
        s.export_count = r.read_i32_as(swap)?;
        s.export_offset = r.read_i32_as(swap)?;
        s.import_count = r.read_i32_as(swap)?;
        s.import_offset = r.read_i32_as(swap)?;
        if version >= VER_DEPENDS_MAP {
            s.depends_offset = r.read_i32_as(swap)?;
        }
        let mut guid = [0u32; 4];
        for word in guid.iter_mut() {
            *word = r.read_u32_as(swap)?;
        }
        s.guid = Guid(guid);

        let generation_count = Self::count(r.read_i32_as(swap)?, "generation")?;
        for _ in 0..generation_count {
            let export_count = r.read_i32_as(swap)?;
            let name_count = r.read_i32_as(swap)?;
            let net_object_count = if version >= VER_NET_OBJECT_COUNT {
                r.read_i32_as(swap)?
            } else {
                0
            };
            s.generations.push(GenerationInfo { export_count, name_count, net_object_count });
        }

        s.engine_version = if version >= VER_ENGINE_VERSION { r.read_i32_as(swap)? } else { 0 };
        s.cooked_content_version = if version >= VER_COOKED_CONTENT_VERSION {
            r.read_i32_as(swap)?
        } else {
            0
        };

        if version >= VER_PACKAGE_COMPRESSION {
            s.compression_flags = CompressionFlags(r.read_u32_as(swap)?);
            let chunk_count = Self::count(r.read_i32_as(swap)?, "compressed chunk")?;
            for _ in 0..chunk_count {
                s.compressed_chunks.push(CompressedChunk {
                    uncompressed_offset: r.read_i32_as(swap)?,
                    uncompressed_size: r.read_i32_as(swap)?,
                    compressed_offset: r.read_i32_as(swap)?,
                    compressed_size: r.read_i32_as(swap)?,
                });
            }
        }

        for (what, count) in [("name", s.name_count), ("export", s.export_count), ("import", s.import_count)] {
            Self::count(count, what)?;
        }

        Ok((s, swap))
    }

    fn count(value: i32, what: &str) -> Result<usize> {
        usize::try_from(value).map_err(|_| Error::corrupt(format!("negative {} count {}", what, value)))
    }

    /// Write the summary using the field set of its own `file_version`.
    pub fn write<W: Write + ?Sized>(&self, w: &mut W, swap: bool) -> Result<()> {
        let version = self.file_version();
        w.write_u32_as(PACKAGE_FILE_TAG, swap)?;
        w.write_u32_as(self.file_version, swap)?;
        if version >= VER_TOTAL_HEADER_SIZE {
            w.write_i32_as(self.total_header_size, swap)?;
        }
        if version >= VER_FOLDER_NAME {
            write_string(w, &self.folder_name, swap)?;
        }
        w.write_u32_as(self.package_flags.bits(), swap)?;
        w.write_i32_as(self.name_count, swap)?;
        w.write_i32_as(self.name_offset, swap)?;
        w.write_i32_as(self.export_count, swap)?;
        w.write_i32_as(self.export_offset, swap)?;
        w.write_i32_as(self.import_count, swap)?;
        w.write_i32_as(self.import_offset, swap)?;
        if version >= VER_DEPENDS_MAP {
            w.write_i32_as(self.depends_offset, swap)?;
        }
        for word in self.guid.0 {
            w.write_u32_as(word, swap)?;
        }
        w.write_i32_as(self.generations.len() as i32, swap)?;
        for generation in &self.generations {
            w.write_i32_as(generation.export_count, swap)?;
            w.write_i32_as(generation.name_count, swap)?;
            if version >= VER_NET_OBJECT_COUNT {
                w.write_i32_as(generation.net_object_count, swap)?;
            }
        }
        if version >= VER_ENGINE_VERSION {
            w.write_i32_as(self.engine_version, swap)?;
        }
        if version >= VER_COOKED_CONTENT_VERSION {
            w.write_i32_as(self.cooked_content_version, swap)?;
        }
        if version >= VER_PACKAGE_COMPRESSION {
            w.write_u32_as(self.compression_flags.0, swap)?;
            w.write_i32_as(self.compressed_chunks.len() as i32, swap)?;
            for chunk in &self.compressed_chunks {
                w.write_i32_as(chunk.uncompressed_offset, swap)?;
                w.write_i32_as(chunk.uncompressed_size, swap)?;
                w.write_i32_as(chunk.compressed_offset, swap)?;
                w.write_i32_as(chunk.compressed_size, swap)?;
            }
        }
        Ok(())
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        let mut buf = Vec::with_capacity(256);
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut buf, false);
        buf.len()
    }

    /// Index of the compressed chunk holding uncompressed `offset` (linear scan).
    pub fn find_compressed_chunk(&self, offset: u64) -> Option<usize> {
        self.compressed_chunks.iter().position(|c| c.contains(offset))
    }
}
