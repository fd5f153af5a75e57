//! Package linker.
//!
//! - [`LinkerLoad`] - Per-package tables and the resumable table-loading phases
//! - [`LoadSession`] - Session context: loader registry, lazy object
//!   materialization, import verification and preloading
//! - [`save`] - Tagging, sorting and writing packages
//!
//! Loading runs in strict phase order:
//!
//! ```text
//! CreateReader -> ParseSummary -> ReadNameTable -> ReadImportTable ->
//! FixupImportTable -> ReadExportTable -> ReadDependsTable ->
//! BuildExportHash -> ReconcileWithLiveObjects -> Finalize
//! ```
//!
//! Every phase may return [`LoadStatus::Pending`] when the time budget
//! runs out; the next call resumes from the stored cursor.

mod load;
mod fixup;
mod session;
pub mod save;

pub use load::{LinkerLoad, LoadPhase};
pub use fixup::{fixup_imports, ImportFixup, IMPORT_FIXUPS};
pub use session::{LoadSession, SessionStats};
pub use save::{compress_package, save_package, SaveReport};

/// Handle to a linker registered in a [`LoadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkerId(pub(crate) u32);

impl LinkerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Result of one cooperative tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// All work for this step is finished.
    Done,
    /// The time budget ran out; call again to resume.
    Pending,
}

impl LoadStatus {
    #[inline]
    pub fn is_done(self) -> bool {
        self == LoadStatus::Done
    }
}
