//! Per-package linker tables and the resumable table-loading phases.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::core::{EndianRead, TimeBudget, DEFAULT_TIME_GRANULARITY};
use crate::format::{
    read_string, ObjectExport, ObjectImport, PackageIndex, PackageSummary, Resource, CLASS_CLASS, CORE_PACKAGE,
    EXPORT_HASH_COUNT, VER_DEPENDS_MAP,
};
use crate::io::{PackageReader, ReaderOptions};
use crate::object::ObjectId;
use crate::util::{Error, Name, NameTable, Result};

use super::{fixup_imports, LinkerId, LoadStatus};

/// Default number of header bytes requested before parsing the summary.
pub const DEFAULT_HEADER_PRECACHE: usize = 64 * 1024;

/// Loading phase of a [`LinkerLoad`]. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPhase {
    CreateReader,
    ParseSummary,
    ReadNameTable,
    ReadImportTable,
    FixupImportTable,
    ReadExportTable,
    ReadDependsTable,
    BuildExportHash,
    ReconcileWithLiveObjects,
    Finalize,
    Done,
}

impl LoadPhase {
    pub fn next(self) -> LoadPhase {
        use LoadPhase::*;
        match self {
            CreateReader => ParseSummary,
            ParseSummary => ReadNameTable,
            ReadNameTable => ReadImportTable,
            ReadImportTable => FixupImportTable,
            FixupImportTable => ReadExportTable,
            ReadExportTable => ReadDependsTable,
            ReadDependsTable => BuildExportHash,
            BuildExportHash => ReconcileWithLiveObjects,
            ReconcileWithLiveObjects => Finalize,
            Finalize | Done => Done,
        }
    }

    /// All tables are in memory.
    #[inline]
    pub fn tables_ready(self) -> bool {
        self >= LoadPhase::ReconcileWithLiveObjects
    }
}

/// Resume point inside the current phase.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Cursor {
    /// Byte offset of the next record.
    pub pos: u64,
    /// Next record index for phases that walk a table without I/O.
    pub index: usize,
}

/// Linker bound to one package file.
///
/// Holds the name, import and export tables plus everything needed to
/// resume loading them. Object materialization lives in
/// [`LoadSession`](super::LoadSession), which owns the linkers.
pub struct LinkerLoad {
    pub(crate) id: Option<LinkerId>,
    package_name: String,
    path: PathBuf,
    pub(crate) root: Option<ObjectId>,
    /// The package object was created by this linker.
    pub(crate) owns_root: bool,
    reader_options: ReaderOptions,
    reader: Option<PackageReader>,
    summary: PackageSummary,
    names: NameTable,
    pub(crate) imports: Vec<ObjectImport>,
    pub(crate) exports: Vec<ObjectExport>,
    depends: Vec<Vec<PackageIndex>>,
    export_hash: Vec<Option<usize>>,
    pub(crate) phase: LoadPhase,
    pub(crate) cursor: Cursor,
    header_precache_size: usize,
    granularity: u32,
    records_read: usize,
    /// Objects constructed from this linker's exports, for teardown.
    pub(crate) created: Vec<ObjectId>,
    pub(crate) finalizing: bool,
}

impl LinkerLoad {
    /// Create a linker for `path`. Nothing is read until the first tick.
    pub fn new(package_name: impl Into<String>, path: impl Into<PathBuf>, reader_options: ReaderOptions) -> Self {
        Self {
            id: None,
            package_name: package_name.into(),
            path: path.into(),
            root: None,
            owns_root: false,
            reader_options,
            reader: None,
            summary: PackageSummary::default(),
            names: NameTable::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            depends: Vec::new(),
            export_hash: vec![None; EXPORT_HASH_COUNT],
            phase: LoadPhase::CreateReader,
            cursor: Cursor::default(),
            header_precache_size: DEFAULT_HEADER_PRECACHE,
            granularity: DEFAULT_TIME_GRANULARITY,
            records_read: 0,
            created: Vec::new(),
            finalizing: false,
        }
    }

    pub fn with_header_precache(mut self, size: usize) -> Self {
        self.header_precache_size = size;
        self
    }

    pub fn with_granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity.max(1);
        self
    }

    /// Open `path` and read all tables without an object space.
    ///
    /// The package name is the file stem.
    pub fn load_tables(path: impl AsRef<Path>, reader_options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut linker = Self::new(name, path, reader_options);
        let mut budget = TimeBudget::unlimited();
        while !linker.tick_tables(&mut budget)?.is_done() {}
        Ok(linker)
    }

    #[inline]
    pub fn id(&self) -> Option<LinkerId> {
        self.id
    }

    #[inline]
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory package object this linker loads into.
    #[inline]
    pub fn root(&self) -> Option<ObjectId> {
        self.root
    }

    #[inline]
    pub fn summary(&self) -> &PackageSummary {
        &self.summary
    }

    pub(crate) fn summary_mut(&mut self) -> &mut PackageSummary {
        &mut self.summary
    }

    #[inline]
    pub fn names(&self) -> &NameTable {
        &self.names
    }

    #[inline]
    pub fn imports(&self) -> &[ObjectImport] {
        &self.imports
    }

    #[inline]
    pub fn exports(&self) -> &[ObjectExport] {
        &self.exports
    }

    /// Per-export dependency lists. Empty for files without a depends table.
    #[inline]
    pub fn depends(&self) -> &[Vec<PackageIndex>] {
        &self.depends
    }

    #[inline]
    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Table records read so far.
    #[inline]
    pub fn records_read(&self) -> usize {
        self.records_read
    }

    #[inline]
    pub fn is_byte_swapped(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| r.is_byte_swapped())
    }

    /// Whether the file handle is still attached.
    #[inline]
    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn reader_mut(&mut self) -> Result<&mut PackageReader> {
        let package = &self.package_name;
        self.reader
            .as_mut()
            .ok_or_else(|| Error::other(format!("linker for {} has no open reader", package)))
    }

    /// Release the file handle. Tables stay available.
    pub fn detach(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.flush_precache();
        }
    }

    /// Run table phases until the tables are complete or the budget runs out.
    ///
    /// Every call makes progress: at least one phase step or one record is
    /// processed before the budget is consulted.
    pub fn tick_tables(&mut self, budget: &mut TimeBudget) -> Result<LoadStatus> {
        loop {
            let status = match self.phase {
                LoadPhase::CreateReader => self.create_reader()?,
                LoadPhase::ParseSummary => self.parse_summary()?,
                LoadPhase::ReadNameTable => self.read_name_table(budget)?,
                LoadPhase::ReadImportTable => self.read_import_table(budget)?,
                LoadPhase::FixupImportTable => self.fixup_import_table(),
                LoadPhase::ReadExportTable => self.read_export_table(budget)?,
                LoadPhase::ReadDependsTable => self.read_depends_table(budget)?,
                LoadPhase::BuildExportHash => self.build_export_hash(budget),
                _ => return Ok(LoadStatus::Done),
            };
            if status == LoadStatus::Pending {
                return Ok(LoadStatus::Pending);
            }
            self.enter_phase(self.phase.next());
            if self.phase.tables_ready() {
                return Ok(LoadStatus::Done);
            }
            if budget.is_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
    }

    pub(crate) fn enter_phase(&mut self, phase: LoadPhase) {
        trace!(package = %self.package_name, ?phase, "linker phase");
        self.phase = phase;
        self.cursor = Cursor::default();
        self.cursor.pos = match phase {
            LoadPhase::ReadNameTable => self.summary.name_offset as u64,
            LoadPhase::ReadImportTable => self.summary.import_offset as u64,
            LoadPhase::ReadExportTable => self.summary.export_offset as u64,
            LoadPhase::ReadDependsTable => self.summary.depends_offset as u64,
            _ => 0,
        };
    }

    fn create_reader(&mut self) -> Result<LoadStatus> {
        if self.reader.is_none() {
            let reader = PackageReader::open(&self.path, &self.reader_options)?;
            self.reader = Some(reader);
        }
        let size = self.header_precache_size;
        let ready = self.reader_mut()?.precache(0, size);
        Ok(if ready { LoadStatus::Done } else { LoadStatus::Pending })
    }

    fn parse_summary(&mut self) -> Result<LoadStatus> {
        let reader = self.reader_mut()?;
        reader.seek(SeekFrom::Start(0))?;
        let (summary, swap) = PackageSummary::read(reader)?;
        reader.set_byte_swap(swap);
        if summary.is_compressed() {
            reader.set_compression_map(summary.compression_flags, summary.compressed_chunks.clone())?;
        }
        debug!(
            package = %self.package_name,
            version = summary.file_version(),
            names = summary.name_count,
            imports = summary.import_count,
            exports = summary.export_count,
            swap,
            compressed = summary.is_compressed(),
            "parsed package summary"
        );
        self.summary = summary;
        Ok(LoadStatus::Done)
    }

    /// Ask for the rest of the header to be resident before reading a table.
    fn header_ready(&mut self) -> Result<bool> {
        let start = self.cursor.pos;
        let end = self.summary.total_header_size.max(0) as u64;
        if end <= start {
            return Ok(true);
        }
        Ok(self.reader_mut()?.precache(start, (end - start) as usize))
    }

    fn seek_cursor(&mut self) -> Result<bool> {
        let pos = self.cursor.pos;
        let reader = self.reader_mut()?;
        reader.seek(SeekFrom::Start(pos))?;
        Ok(reader.is_byte_swapped())
    }

    fn read_name_table(&mut self, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let count = self.summary.name_count.max(0) as usize;
        if self.names.len() < count && !self.header_ready()? {
            return Ok(LoadStatus::Pending);
        }
        let swap = self.seek_cursor()?;
        while self.names.len() < count {
            let reader = self.reader_mut()?;
            let entry = read_string(reader, swap)?;
            self.names.push(entry);
            self.records_read += 1;
            if self.names.len() < count && budget.record_exceeded() {
                self.cursor.pos = self.reader_mut()?.tell();
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn read_import_table(&mut self, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let count = self.summary.import_count.max(0) as usize;
        if self.imports.len() < count && !self.header_ready()? {
            return Ok(LoadStatus::Pending);
        }
        let swap = self.seek_cursor()?;
        while self.imports.len() < count {
            let reader = self.reader.as_mut().ok_or_else(|| Error::other("reader detached"))?;
            let import = ObjectImport::read(reader, swap, &self.names, count)?;
            self.imports.push(import);
            self.records_read += 1;
            if self.imports.len() < count && budget.record_exceeded() {
                self.cursor.pos = self.reader_mut()?.tell();
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn fixup_import_table(&mut self) -> LoadStatus {
        fixup_imports(&mut self.imports, self.summary.file_version());
        LoadStatus::Done
    }

    fn read_export_table(&mut self, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let count = self.summary.export_count.max(0) as usize;
        let imports = self.imports.len();
        if self.exports.len() < count && !self.header_ready()? {
            return Ok(LoadStatus::Pending);
        }
        let swap = self.seek_cursor()?;
        while self.exports.len() < count {
            let reader = self.reader.as_mut().ok_or_else(|| Error::other("reader detached"))?;
            let export = ObjectExport::read(reader, swap, &self.names, imports, count)?;
            self.exports.push(export);
            self.records_read += 1;
            if self.exports.len() < count && budget.record_exceeded() {
                self.cursor.pos = self.reader_mut()?.tell();
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn read_depends_table(&mut self, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let count = self.exports.len();
        if self.summary.file_version() < VER_DEPENDS_MAP || self.summary.depends_offset <= 0 {
            self.depends.resize(count, Vec::new());
            return Ok(LoadStatus::Done);
        }
        if self.depends.len() < count && !self.header_ready()? {
            return Ok(LoadStatus::Pending);
        }
        let imports = self.imports.len();
        let swap = self.seek_cursor()?;
        while self.depends.len() < count {
            let reader = self.reader_mut()?;
            let len = reader.read_i32_as(swap)?;
            let len = usize::try_from(len)
                .ok()
                .filter(|&l| l <= imports + count)
                .ok_or_else(|| Error::corrupt(format!("bad depends count {}", len)))?;
            let mut list = Vec::with_capacity(len);
            for _ in 0..len {
                list.push(PackageIndex::from_raw(reader.read_i32_as(swap)?).check(imports, count)?);
            }
            self.depends.push(list);
            self.records_read += 1;
            if self.depends.len() < count && budget.record_exceeded() {
                self.cursor.pos = self.reader_mut()?.tell();
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn build_export_hash(&mut self, budget: &mut TimeBudget) -> LoadStatus {
        while self.cursor.index < self.exports.len() {
            let i = self.cursor.index;
            let bucket = export_hash(
                &self.exports[i].object_name,
                &self.export_class_name(i),
                &self.export_class_package(i),
            );
            self.exports[i].hash_next = self.export_hash[bucket];
            self.export_hash[bucket] = Some(i);
            self.cursor.index += 1;
            if self.cursor.index < self.exports.len() && budget.record_exceeded() {
                return LoadStatus::Pending;
            }
        }
        LoadStatus::Done
    }

    /// Class name of export `index`.
    pub fn export_class_name(&self, index: usize) -> Name {
        match self.exports[index].class_index.resource() {
            Resource::Root => Name::new(CLASS_CLASS),
            Resource::Export(i) => self.exports[i].object_name.clone(),
            Resource::Import(i) => self.imports[i].object_name.clone(),
        }
    }

    /// Name of the package defining the class of export `index`.
    pub fn export_class_package(&self, index: usize) -> Name {
        match self.exports[index].class_index.resource() {
            Resource::Root => Name::new(CORE_PACKAGE),
            Resource::Export(_) => Name::new(self.package_name.as_str()),
            Resource::Import(i) => self.import_outermost_name(i),
        }
    }

    fn import_outermost_name(&self, mut index: usize) -> Name {
        while let Some(outer) = self.imports[index].outer_index.import_index() {
            index = outer;
        }
        self.imports[index].object_name.clone()
    }

    /// Find an export by name and class.
    ///
    /// `outer` is the export index of the required outer, `None` for
    /// exports directly inside the package.
    pub fn find_export(&self, name: &Name, class_name: &Name, class_package: &Name, outer: Option<usize>) -> Option<usize> {
        let want_outer = outer.map_or(PackageIndex::ROOT, PackageIndex::from_export);
        let mut cursor = self.export_hash[export_hash(name, class_name, class_package)];
        while let Some(i) = cursor {
            let export = &self.exports[i];
            if export.object_name == *name
                && export.outer_index == want_outer
                && self.export_class_name(i) == *class_name
                && self.export_class_package(i) == *class_package
            {
                return Some(i);
            }
            cursor = export.hash_next;
        }
        None
    }

    /// Find an export by dotted path relative to the package, e.g. `Group.Mesh`.
    pub fn find_export_by_path(&self, path: &str) -> Option<usize> {
        let mut outer = PackageIndex::ROOT;
        let mut found = None;
        for segment in path.split('.') {
            let index = self
                .exports
                .iter()
                .position(|e| e.outer_index == outer && e.object_name.to_string() == segment)?;
            outer = PackageIndex::from_export(index);
            found = Some(index);
        }
        found
    }

    /// `Package.Outer.Name` path of export `index`.
    pub fn export_path_name(&self, index: usize) -> String {
        let mut segments = vec![self.exports[index].object_name.to_string()];
        let mut outer = self.exports[index].outer_index;
        while let Some(i) = outer.export_index() {
            segments.push(self.exports[i].object_name.to_string());
            outer = self.exports[i].outer_index;
        }
        segments.push(self.package_name.clone());
        segments.reverse();
        segments.join(".")
    }

    /// `Class Package.Outer.Name` of export `index`.
    pub fn export_full_name(&self, index: usize) -> String {
        format!("{} {}", self.export_class_name(index), self.export_path_name(index))
    }

    /// `Package.Outer.Name` path of import `index`.
    pub fn import_path_name(&self, index: usize) -> String {
        let mut segments = vec![self.imports[index].object_name.to_string()];
        let mut outer = self.imports[index].outer_index;
        while let Some(i) = outer.import_index() {
            segments.push(self.imports[i].object_name.to_string());
            outer = self.imports[i].outer_index;
        }
        segments.reverse();
        segments.join(".")
    }

    /// `Class Package.Outer.Name` of import `index`.
    pub fn import_full_name(&self, index: usize) -> String {
        format!("{} {}", self.imports[index].class_name, self.import_path_name(index))
    }

    /// Path name of any signed index, for diagnostics.
    pub fn index_path_name(&self, index: PackageIndex) -> String {
        match index.resource() {
            Resource::Root => self.package_name.clone(),
            Resource::Export(i) if i < self.exports.len() => self.export_path_name(i),
            Resource::Import(i) if i < self.imports.len() => self.import_path_name(i),
            _ => format!("<bad index {}>", index),
        }
    }
}

impl std::fmt::Debug for LinkerLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkerLoad")
            .field("package", &self.package_name)
            .field("path", &self.path)
            .field("phase", &self.phase)
            .field("names", &self.names.len())
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

fn export_hash(name: &Name, class_name: &Name, class_package: &Name) -> usize {
    let hash = fxhash::hash32(name)
        .wrapping_add(fxhash::hash32(class_name).wrapping_mul(7))
        .wrapping_add(fxhash::hash32(class_package).wrapping_mul(31));
    hash as usize & (EXPORT_HASH_COUNT - 1)
}
