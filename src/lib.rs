//! # pkglink
//!
//! Package linker with time-sliced asynchronous loading.
//!
//! A package is a self-describing container of serialized objects: a
//! summary, a name table, import and export tables, a per-export depends
//! map and the export bodies. Objects reference each other through signed
//! [`PackageIndex`](format::PackageIndex) values that the linker resolves
//! lazily into an [`ObjectSpace`], opening other packages on demand.
//!
//! ## Modules
//!
//! - [`util`] - Basic types (names, GUIDs, errors)
//! - [`core`] - Compression, chunk codec, byte order and the time budget
//! - [`format`] - Package summary and table records
//! - [`io`] - Package reader, writer and background I/O
//! - [`object`] - Host object space and load/save hooks
//! - [`linker`] - Table loading, object resolution and saving
//! - [`streaming`] - Resumable package loads driven by a frame budget
//! - [`config`] - Linker and save settings
//!
//! ## Example
//!
//! ```ignore
//! use pkglink::prelude::*;
//!
//! let config = LinkerConfig::from_env().with_search_path("content");
//! let mut session = LoadSession::new(config);
//! let package = session.load_package("Props")?;
//!
//! let mut queue = AsyncPackageQueue::new();
//! queue.load_package_async("Level01", None);
//! while !queue.process_async_loading(&mut session, Some(Duration::from_millis(5))).is_done() {
//!     // render a frame
//! }
//! ```

pub mod util;
pub mod core;
pub mod format;
pub mod io;
pub mod object;
pub mod linker;
pub mod streaming;
pub mod config;

// Re-export commonly used types
pub use util::{Error, ErrorKind, Result, Name, Guid};
pub use config::{ImportPolicy, LinkerConfig, SaveOptions};
pub use linker::{save_package, LinkerId, LinkerLoad, LoadSession, LoadStatus, SaveReport};
pub use object::{ObjectFlags, ObjectId, ObjectSpace};
pub use streaming::AsyncPackageQueue;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Error, ErrorKind, Result, Name, NameTable, Guid};
    pub use crate::config::{ImportPolicy, LinkerConfig, SaveOptions};
    pub use crate::core::{CompressionFlags, TimeBudget};
    pub use crate::format::{PackageFlags, PackageIndex, PackageSummary};
    pub use crate::linker::{save_package, LinkerId, LinkerLoad, LoadSession, LoadStatus, SaveReport};
    pub use crate::object::{Object, ObjectFlags, ObjectId, ObjectSpace, PostLoad, PreSave};
    pub use crate::streaming::{AsyncPackage, AsyncPackageQueue, CompletionCallback};
    pub use std::time::Duration;
}
