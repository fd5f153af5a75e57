//! Linker configuration.
//!
//! Everything has a sensible default; [`LinkerConfig::from_env`] layers
//! `PKGLINK_*` environment variables on top.

use std::path::PathBuf;

use tracing::warn;

use crate::core::{CompressionFlags, DEFAULT_TIME_GRANULARITY};
use crate::format::{PackageFlags, SAVING_COMPRESSION_CHUNK_SIZE};
use crate::object::ObjectFlags;

/// Environment variable holding extra package search directories.
pub const ENV_SEARCH_PATH: &str = "PKGLINK_SEARCH_PATH";
/// Environment variable selecting the import policy (`strict` / `lenient`).
pub const ENV_IMPORTS: &str = "PKGLINK_IMPORTS";
/// Environment variable enabling the background I/O thread (`1` / `0`).
pub const ENV_ASYNC_IO: &str = "PKGLINK_ASYNC_IO";

/// Default package file extension.
pub const DEFAULT_PACKAGE_EXTENSION: &str = "pkg";

/// What happens when an import cannot be found and no redirector exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportPolicy {
    /// The load fails with [`Error::FailedImport`](crate::Error::FailedImport).
    #[default]
    Strict,
    /// The reference is left null and a warning is logged.
    Lenient,
}

impl ImportPolicy {
    /// Parse `strict` / `lenient` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(ImportPolicy::Strict),
            "lenient" | "warn" => Some(ImportPolicy::Lenient),
            _ => None,
        }
    }
}

/// Settings for a [`LoadSession`](crate::linker::LoadSession).
#[derive(Debug, Clone)]
pub struct LinkerConfig {
    pub import_policy: ImportPolicy,
    /// Bind exports to matching objects already in memory.
    pub reconcile_live_objects: bool,
    /// Look imports up in the object space before opening their package.
    pub probe_live_objects: bool,
    /// Verify every import when a linker finishes loading its tables.
    pub verify_imports: bool,
    /// Directories searched for `<name>.<extension>`.
    pub search_paths: Vec<PathBuf>,
    pub package_extension: String,
    /// Records processed between clock polls.
    pub time_check_granularity: u32,
    /// Header bytes requested before the summary is parsed.
    pub header_precache_size: usize,
    /// Start a background I/O thread for precaching.
    pub use_async_io: bool,
    pub use_mmap: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            import_policy: ImportPolicy::Strict,
            reconcile_live_objects: true,
            probe_live_objects: false,
            verify_imports: true,
            search_paths: Vec::new(),
            package_extension: DEFAULT_PACKAGE_EXTENSION.to_string(),
            time_check_granularity: DEFAULT_TIME_GRANULARITY,
            header_precache_size: 64 * 1024,
            use_async_io: false,
            use_mmap: true,
        }
    }
}

impl LinkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `PKGLINK_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(paths) = var(ENV_SEARCH_PATH) {
            self.search_paths
                .extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
        }
        if let Some(policy) = var(ENV_IMPORTS) {
            match ImportPolicy::parse(&policy) {
                Some(policy) => self.import_policy = policy,
                None => warn!(value = %policy, "ignoring unknown {}", ENV_IMPORTS),
            }
        }
        if let Some(flag) = var(ENV_ASYNC_IO) {
            self.use_async_io = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_import_policy(mut self, policy: ImportPolicy) -> Self {
        self.import_policy = policy;
        self
    }

    pub fn with_async_io(mut self, enabled: bool) -> Self {
        self.use_async_io = enabled;
        self
    }

    pub fn with_granularity(mut self, granularity: u32) -> Self {
        self.time_check_granularity = granularity.max(1);
        self
    }
}

/// Settings for [`save_package`](crate::linker::save_package).
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Package compression. `NONE` writes a plain file.
    pub compression: CompressionFlags,
    /// Codec chunk size used inside each compressed block.
    pub chunk_size: usize,
    /// Write the file in the opposite byte order.
    pub force_byte_swapping: bool,
    /// Previously saved file whose table order is kept stable.
    pub conform: Option<PathBuf>,
    /// Objects inside the package with any of these flags become roots.
    /// `NONE` makes every object in the package a root.
    pub top_level_flags: ObjectFlags,
    pub package_flags: PackageFlags,
    pub folder_name: String,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            compression: CompressionFlags::NONE,
            chunk_size: SAVING_COMPRESSION_CHUNK_SIZE,
            force_byte_swapping: false,
            conform: None,
            top_level_flags: ObjectFlags::NONE,
            package_flags: PackageFlags::NONE,
            folder_name: String::new(),
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compressed(mut self, flags: CompressionFlags) -> Self {
        self.compression = flags;
        self
    }

    pub fn byte_swapped(mut self, swap: bool) -> Self {
        self.force_byte_swapping = swap;
        self
    }

    pub fn conform_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.conform = Some(path.into());
        self
    }

    pub fn with_top_level_flags(mut self, flags: ObjectFlags) -> Self {
        self.top_level_flags = flags;
        self
    }
}
