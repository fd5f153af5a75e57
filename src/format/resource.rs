//! Import and export table records.

use std::io::{Read, Write};

use super::*;
use crate::linker::LinkerId;
use crate::object::{ObjectFlags, ObjectId};

/// Materialization state of a table record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveState {
    /// Nothing has been attempted yet.
    #[default]
    Unresolved,
    /// Creation is in progress; the handle is already allocated.
    Resolving(ObjectId),
    /// Finished. `None` means the record degraded to null.
    Resolved(Option<ObjectId>),
}

impl ResolveState {
    /// The handle, in progress or finished.
    #[inline]
    pub fn object(self) -> Option<ObjectId> {
        match self {
            ResolveState::Unresolved | ResolveState::Resolved(None) => None,
            ResolveState::Resolving(id) | ResolveState::Resolved(Some(id)) => Some(id),
        }
    }

    #[inline]
    pub fn is_settled(self) -> bool {
        !matches!(self, ResolveState::Unresolved)
    }
}

/// An object stored in this package.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectExport {
    /// Class of the object. `ROOT` means the export is itself a class.
    pub class_index: PackageIndex,
    /// Parent in the class hierarchy, for class exports.
    pub super_index: PackageIndex,
    pub outer_index: PackageIndex,
    pub object_name: Name,
    /// Prototype for default values. `ROOT` means the class defaults.
    pub archetype_index: PackageIndex,
    pub object_flags: ObjectFlags,
    pub serial_size: i32,
    pub serial_offset: i32,
    pub export_flags: ExportFlags,

    /// Object handle, populated on demand.
    pub state: ResolveState,
    /// Next export in the same hash bucket.
    pub hash_next: Option<usize>,
}

impl ObjectExport {
    pub fn new(name: Name, class_index: PackageIndex, outer_index: PackageIndex) -> Self {
        Self {
            class_index,
            super_index: PackageIndex::ROOT,
            outer_index,
            object_name: name,
            archetype_index: PackageIndex::ROOT,
            object_flags: ObjectFlags::NONE,
            serial_size: 0,
            serial_offset: 0,
            export_flags: ExportFlags::NONE,
            state: ResolveState::Unresolved,
            hash_next: None,
        }
    }

    #[inline]
    pub fn is_class(&self) -> bool {
        self.class_index.is_root()
    }

    #[inline]
    pub fn object(&self) -> Option<ObjectId> {
        self.state.object()
    }

    /// Read one record, rejecting indices outside the table bounds.
    pub fn read<R: Read + ?Sized>(
        r: &mut R,
        swap: bool,
        names: &NameTable,
        imports: usize,
        exports: usize,
    ) -> Result<Self> {
        let class_index = PackageIndex::from_raw(r.read_i32_as(swap)?).check(imports, exports)?;
        let super_index = PackageIndex::from_raw(r.read_i32_as(swap)?).check(imports, exports)?;
        let outer_index = PackageIndex::from_raw(r.read_i32_as(swap)?).check(imports, exports)?;
        let object_name = read_name(r, swap, names)?;
        let archetype_index = PackageIndex::from_raw(r.read_i32_as(swap)?).check(imports, exports)?;
        let object_flags = ObjectFlags(r.read_u32_as(swap)?);
        let serial_size = r.read_i32_as(swap)?;
        let serial_offset = r.read_i32_as(swap)?;
        let export_flags = ExportFlags(r.read_u32_as(swap)?);
        if serial_size < 0 || serial_offset < 0 {
            return Err(Error::corrupt(format!(
                "export {} has negative serial range {}+{}",
                object_name, serial_offset, serial_size
            )));
        }
        Ok(Self {
            class_index,
            super_index,
            outer_index,
            object_name,
            archetype_index,
            object_flags,
            serial_size,
            serial_offset,
            export_flags,
            state: ResolveState::Unresolved,
            hash_next: None,
        })
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W, swap: bool, names: &NameTable) -> Result<()> {
        w.write_i32_as(self.class_index.raw(), swap)?;
        w.write_i32_as(self.super_index.raw(), swap)?;
        w.write_i32_as(self.outer_index.raw(), swap)?;
        write_name(w, &self.object_name, swap, names)?;
        w.write_i32_as(self.archetype_index.raw(), swap)?;
        w.write_u32_as(self.object_flags.bits(), swap)?;
        w.write_i32_as(self.serial_size, swap)?;
        w.write_i32_as(self.serial_offset, swap)?;
        w.write_u32_as(self.export_flags.bits(), swap)?;
        Ok(())
    }
}

/// A reference to an object living in another package.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectImport {
    pub class_package: Name,
    pub class_name: Name,
    /// Always `ROOT` or an import.
    pub outer_index: PackageIndex,
    pub object_name: Name,

    /// Linker that owns the target export, once verified.
    pub source_linker: Option<LinkerId>,
    /// Export index of the target inside `source_linker`.
    pub source_index: Option<usize>,
    /// Set once verification has run, successful or not.
    pub verified: bool,
    /// Object handle, populated on demand.
    pub state: ResolveState,
}

impl ObjectImport {
    pub fn new(class_package: Name, class_name: Name, outer_index: PackageIndex, object_name: Name) -> Self {
        Self {
            class_package,
            class_name,
            outer_index,
            object_name,
            source_linker: None,
            source_index: None,
            verified: false,
            state: ResolveState::Unresolved,
        }
    }

    /// Whether this import names a top-level package.
    #[inline]
    pub fn is_package(&self) -> bool {
        self.outer_index.is_root()
    }

    #[inline]
    pub fn object(&self) -> Option<ObjectId> {
        self.state.object()
    }

    /// Read one record. The outer must be the root or an import.
    pub fn read<R: Read + ?Sized>(r: &mut R, swap: bool, names: &NameTable, imports: usize) -> Result<Self> {
        let class_package = read_name(r, swap, names)?;
        let class_name = read_name(r, swap, names)?;
        let outer_index = PackageIndex::from_raw(r.read_i32_as(swap)?);
        if outer_index.is_export() {
            return Err(Error::corrupt(format!("import outer {} is an export", outer_index)));
        }
        let outer_index = outer_index.check(imports, 0)?;
        let object_name = read_name(r, swap, names)?;
        Ok(Self::new(class_package, class_name, outer_index, object_name))
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W, swap: bool, names: &NameTable) -> Result<()> {
        write_name(w, &self.class_package, swap, names)?;
        write_name(w, &self.class_name, swap, names)?;
        w.write_i32_as(self.outer_index.raw(), swap)?;
        write_name(w, &self.object_name, swap, names)?;
        Ok(())
    }
}
