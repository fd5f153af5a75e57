//! Package file format: constants, summary and table records.
//!
//! All multi-byte fields are little-endian unless the summary tag reads
//! back byte-swapped, in which case the rest of the file is big-endian.
//!
//! File layout:
//!
//! ```text
//! [summary] [name table] [import table] [export table] [depends table] [export bodies]
//! ```

mod index;
mod summary;
mod resource;
mod body;

pub use index::{PackageIndex, Resource};
pub use summary::{CompressedChunk, GenerationInfo, PackageSummary};
pub use resource::{ObjectExport, ObjectImport, ResolveState};
pub use body::ExportBody;

use std::io::{Read, Write};

use crate::core::{EndianRead, EndianWrite};
use crate::util::{bit_flags, Error, Name, NameTable, Result};

/// Package tag in native byte order.
pub const PACKAGE_FILE_TAG: u32 = 0x9E2A83C1;

/// Package tag as read from a file written with the other byte order.
pub const PACKAGE_FILE_TAG_SWAPPED: u32 = 0xC1832A9E;

/// Oldest file version this build can read.
pub const VER_MIN_SUPPORTED: u16 = 100;
/// Summary records the size of all tables.
pub const VER_TOTAL_HEADER_SIZE: u16 = 110;
/// Summary records the editor folder name.
pub const VER_FOLDER_NAME: u16 = 115;
/// Depends table written after the export table.
pub const VER_DEPENDS_MAP: u16 = 120;
/// Generation records carry a net object count.
pub const VER_NET_OBJECT_COUNT: u16 = 125;
/// Summary records the engine version that saved it.
pub const VER_ENGINE_VERSION: u16 = 130;
/// Summary records the cooked content version.
pub const VER_COOKED_CONTENT_VERSION: u16 = 135;
/// Summary carries compression flags and a chunk directory.
pub const VER_PACKAGE_COMPRESSION: u16 = 140;
/// Legacy redirector classes folded into `Core.ObjectRedirector`.
pub const VER_MERGED_REDIRECTOR_CLASSES: u16 = 145;

/// File version written by this build.
pub const PACKAGE_FILE_VERSION: u16 = 150;

/// Licensee version written by this build.
pub const PACKAGE_LICENSEE_VERSION: u16 = 0;

/// Engine version stamped into saved summaries.
pub const ENGINE_VERSION: i32 = 1;

/// Cooked content version stamped into saved summaries.
pub const COOKED_CONTENT_VERSION: i32 = 1;

/// Chunk size used when a chunk header carries the legacy marker.
pub const LOADING_COMPRESSION_CHUNK_SIZE: usize = 128 * 1024;

/// Default chunk size for saving.
pub const SAVING_COMPRESSION_CHUNK_SIZE: usize = LOADING_COMPRESSION_CHUNK_SIZE;

/// Upper bound for export bodies merged into one package chunk.
pub const MAX_MERGED_COMPRESSION_CHUNK_SIZE: usize = 1024 * 1024;

/// Number of buckets in a linker's export hash. Must be a power of two.
pub const EXPORT_HASH_COUNT: usize = 256;

/// Longest string accepted from a file.
pub const MAX_SERIALIZED_STRING: usize = 1024 * 1024;

/// Package containing the intrinsic classes.
pub const CORE_PACKAGE: &str = "Core";
/// Class of class objects.
pub const CLASS_CLASS: &str = "Class";
/// Class of package objects.
pub const PACKAGE_CLASS: &str = "Package";
/// Class of redirector objects.
pub const REDIRECTOR_CLASS: &str = "ObjectRedirector";

bit_flags! {
    /// Package-wide flags stored in the summary.
    pub struct PackageFlags {
        /// Package may be downloaded by clients.
        const ALLOW_DOWNLOAD = 0x0000_0001;
        /// Saved for a cooked target.
        const COOKED = 0x0000_0008;
        /// Imports are guaranteed resident; skip verification on load.
        const REQUIRE_IMPORTS_ALREADY_LOADED = 0x0000_0010;
        /// Package holds a map.
        const CONTAINS_MAP = 0x0002_0000;
        /// Contents are stored in compressed chunks.
        const STORE_COMPRESSED = 0x0200_0000;
        /// Package was saved by an engine newer than this build.
        const SAVED_WITH_NEWER_VERSION = 0x0400_0000;
    }
}

bit_flags! {
    /// Per-export flags stored in the export table.
    pub struct ExportFlags {
        /// Export must be created even if nothing references it.
        const FORCED_EXPORT = 0x0000_0001;
        /// Export is a script class definition.
        const SCRIPT_CLASS = 0x0000_0002;
    }
}

/// Split a file version word into (engine, licensee) versions.
#[inline]
pub const fn split_file_version(file_version: u32) -> (u16, u16) {
    ((file_version & 0xFFFF) as u16, (file_version >> 16) as u16)
}

/// Build a file version word.
#[inline]
pub const fn make_file_version(engine: u16, licensee: u16) -> u32 {
    engine as u32 | ((licensee as u32) << 16)
}

pub(crate) fn read_string<R: Read + ?Sized>(r: &mut R, swap: bool) -> Result<String> {
    let len = r.read_i32_as(swap)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|&l| l <= MAX_SERIALIZED_STRING)
        .ok_or_else(|| Error::corrupt(format!("bad string length {}", len)))?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

pub(crate) fn write_string<W: Write + ?Sized>(w: &mut W, value: &str, swap: bool) -> Result<()> {
    w.write_i32_as(value.len() as i32, swap)?;
    w.write_all(value.as_bytes())?;
    Ok(())
}

pub(crate) fn read_name<R: Read + ?Sized>(r: &mut R, swap: bool, names: &NameTable) -> Result<Name> {
    let index = r.read_i32_as(swap)?;
    let number = r.read_u32_as(swap)?;
    names.resolve(index, number)
}

pub(crate) fn write_name<W: Write + ?Sized>(
    w: &mut W,
    name: &Name,
    swap: bool,
    names: &NameTable,
) -> Result<()> {
    let index = names
        .index_of(name.base())
        .ok_or_else(|| Error::other(format!("name '{}' missing from name table", name.base())))?;
    w.write_i32_as(index, swap)?;
    w.write_u32_as(name.number(), swap)?;
    Ok(())
}
