//! Byte streams under the linker.
//!
//! - [`OStream`] - Seekable writer with a byte-swap switch
//! - [`PackageReader`] - Package reader with swap mode, chunk-aware reads and precaching
//! - [`AsyncIoSystem`] - Background worker serving raw and compressed range reads

mod stream;
mod reader;
mod async_io;

pub use stream::OStream;
pub use reader::{PackageReader, ReaderOptions};
pub use async_io::{AsyncIoSystem, IoCounter, IoPriority, IoRequestId};

/// Smallest uncompressed read issued by a precache request.
pub const DVD_MIN_READ_SIZE: usize = 32 * 1024;
