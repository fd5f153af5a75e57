//! Host object space.
//!
//! The linker treats an object as an opaque record with a class, an
//! optional archetype, an outer and a property blob. [`ObjectSpace`] is
//! the arena that owns those records; the linker only ever holds
//! [`ObjectId`] handles into it.

mod space;
mod hooks;

pub use space::ObjectSpace;
pub use hooks::{PostLoad, PreSave};

use crate::linker::LinkerId;
use crate::util::{bit_flags, Name};

/// Handle to an object in an [`ObjectSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

bit_flags! {
    /// Per-object flags. The low half is persisted in export records.
    pub struct ObjectFlags {
        /// Visible to other packages.
        const PUBLIC = 0x0000_0001;
        /// Kept alive even when unreferenced.
        const STANDALONE = 0x0000_0002;
        /// Object is a prototype for other objects.
        const ARCHETYPE = 0x0000_0004;
        /// Never saved.
        const TRANSIENT = 0x0000_0008;
        /// Defined by the host, not by a package.
        const NATIVE = 0x0001_0000;
        /// Body not yet deserialized.
        const NEED_LOAD = 0x0002_0000;
        /// Body deserialized, post-load hook pending.
        const NEED_POST_LOAD = 0x0004_0000;
        /// Created by an in-flight async package.
        const ASYNC_LOADING = 0x0008_0000;
        /// Post-load hook is running.
        const POST_LOADING = 0x0010_0000;
    }
}

impl ObjectFlags {
    /// Flags persisted to and restored from export records.
    pub const LOAD_MASK: ObjectFlags = ObjectFlags(0x0000_FFFF);

    #[inline]
    pub fn persistent(self) -> ObjectFlags {
        self & Self::LOAD_MASK
    }
}

/// Binding of an object to the export that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkerBinding {
    pub linker: LinkerId,
    pub export_index: usize,
}

/// One object record.
#[derive(Debug, Clone)]
pub struct Object {
    pub(crate) name: Name,
    pub(crate) class: ObjectId,
    pub(crate) outer: Option<ObjectId>,
    pub(crate) archetype: Option<ObjectId>,
    pub(crate) super_struct: Option<ObjectId>,
    pub(crate) linker: Option<LinkerBinding>,
    pub flags: ObjectFlags,
    /// Opaque property image.
    pub properties: Vec<u8>,
    /// Objects referenced from the property image, in order.
    pub references: Vec<ObjectId>,
}

impl Object {
    #[inline]
    pub fn name(&self) -> &Name {
        &self.name
    }

    #[inline]
    pub fn class(&self) -> ObjectId {
        self.class
    }

    #[inline]
    pub fn outer(&self) -> Option<ObjectId> {
        self.outer
    }

    #[inline]
    pub fn archetype(&self) -> Option<ObjectId> {
        self.archetype
    }

    /// Parent in the class hierarchy (class objects only).
    #[inline]
    pub fn super_struct(&self) -> Option<ObjectId> {
        self.super_struct
    }

    #[inline]
    pub fn linker(&self) -> Option<LinkerBinding> {
        self.linker
    }

    #[inline]
    pub fn has_any_flags(&self, flags: ObjectFlags) -> bool {
        self.flags.intersects(flags)
    }
}
