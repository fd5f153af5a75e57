//! Error types for package loading and saving.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for linker operations.
///
/// Structural gaps that only degrade a single object (missing outer,
/// missing archetype) are never reported through this type; they are
/// logged with `tracing::warn!` and the load continues.
#[derive(Error, Debug)]
pub enum Error {
    /// File does not exist or cannot be accessed
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// No file on the search path provides the named package
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Package tag is neither the native nor the byte-swapped tag
    #[error("Invalid package tag: {0:#010x}")]
    BadTag(u32),

    /// File version outside the range this build understands
    #[error("Unsupported package version {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },

    /// Name reference outside the name table
    #[error("Bad name index {index} (name count {count})")]
    BadNameIndex { index: i32, count: usize },

    /// Signed resource index outside the import/export tables
    #[error("Bad resource index {index} (imports {imports}, exports {exports})")]
    BadResourceIndex { index: i32, imports: usize, exports: usize },

    /// Export body consumed a different byte count than recorded
    #[error("Serial size mismatch for {export}: expected {expected} bytes, consumed {actual}")]
    SerialSizeMismatch { export: String, expected: i64, actual: i64 },

    /// Export names itself as its own archetype
    #[error("Archetype cycle on export {0}")]
    ArchetypeCycle(String),

    /// Compressed chunk stream is damaged
    #[error("Corrupt compressed data: {0}")]
    CorruptChunk(String),

    /// Other structural damage
    #[error("Corrupt package: {0}")]
    Corruption(String),

    /// Import could not be found and no redirector exists
    #[error("Failed import: {import} (in {package})")]
    FailedImport { import: String, package: String },

    /// File is truncated or corrupted
    #[error("Unexpected end of file at position {0}")]
    UnexpectedEof(u64),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// UTF-8 conversion error
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad tag or unsupported version. Nothing was exposed.
    Format,
    /// The file contradicts itself.
    Corruption,
    /// An import could not be satisfied.
    Resolution,
    /// Operating system or stream failure.
    Io,
    /// Anything else.
    Other,
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a corruption error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadTag(_) | Error::UnsupportedVersion { .. } => ErrorKind::Format,
            Error::BadNameIndex { .. }
            | Error::BadResourceIndex { .. }
            | Error::SerialSizeMismatch { .. }
            | Error::ArchetypeCycle(_)
            | Error::CorruptChunk(_)
            | Error::Corruption(_)
            | Error::UnexpectedEof(_)
            | Error::Utf8(_) => ErrorKind::Corruption,
            Error::FailedImport { .. } | Error::PackageNotFound(_) => ErrorKind::Resolution,
            Error::FileNotFound(_) | Error::Io(_) => ErrorKind::Io,
            Error::Other(_) => ErrorKind::Other,
        }
    }
}

impl From<std::io::Error> for Error {
    /// Unwraps linker errors that travelled through `std::io::Read` impls.
    fn from(e: std::io::Error) -> Self {
        match e.get_ref().map(|inner| inner.is::<Error>()) {
            Some(true) => match e.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(inner)) => *inner,
                _ => Error::other("nested error lost"),
            },
            _ => Error::Io(e),
        }
    }
}

/// Result type alias for linker operations.
pub type Result<T> = std::result::Result<T, Error>;
