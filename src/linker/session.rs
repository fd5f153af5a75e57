//! Load session: loader registry, lazy object materialization, import
//! verification and preloading.
//!
//! All per-load mutable state lives here instead of in globals. Linkers
//! are stored in an arena indexed by [`LinkerId`]; every operation looks
//! its linker up again after any call that may re-enter the session, so
//! cyclic package graphs never hold overlapping borrows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace, warn};

use crate::config::{ImportPolicy, LinkerConfig};
use crate::core::TimeBudget;
use crate::format::{
    ExportBody, PackageFlags, PackageIndex, ResolveState, Resource, CORE_PACKAGE, ENGINE_VERSION, REDIRECTOR_CLASS,
};
use crate::io::{AsyncIoSystem, ReaderOptions};
use crate::object::{LinkerBinding, ObjectFlags, ObjectId, ObjectSpace};
use crate::streaming::AsyncPackage;
use crate::util::{Error, Name, Result};

use super::{LinkerId, LinkerLoad, LoadPhase, LoadStatus};

/// Counters for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub linkers_created: usize,
    pub bodies_read: usize,
    pub imports_verified: usize,
    pub redirectors_followed: usize,
}

/// Context object for loading packages into an [`ObjectSpace`].
pub struct LoadSession {
    objects: ObjectSpace,
    config: LinkerConfig,
    linkers: Vec<Option<LinkerLoad>>,
    by_package: FxHashMap<String, LinkerId>,
    package_paths: FxHashMap<String, PathBuf>,
    /// Objects created since the outermost load began.
    pub(crate) loaded: Vec<ObjectId>,
    load_depth: u32,
    /// New exports get `ASYNC_LOADING` while set.
    pub(crate) async_loading: bool,
    io: Option<Arc<AsyncIoSystem>>,
    stats: SessionStats,
}

impl LoadSession {
    pub fn new(config: LinkerConfig) -> Self {
        Self::with_objects(ObjectSpace::new(), config)
    }

    /// Load into an existing object space.
    pub fn with_objects(objects: ObjectSpace, config: LinkerConfig) -> Self {
        let io = config.use_async_io.then(|| Arc::new(AsyncIoSystem::new()));
        Self {
            objects,
            config,
            linkers: Vec::new(),
            by_package: FxHashMap::default(),
            package_paths: FxHashMap::default(),
            loaded: Vec::new(),
            load_depth: 0,
            async_loading: false,
            io,
            stats: SessionStats::default(),
        }
    }

    #[inline]
    pub fn objects(&self) -> &ObjectSpace {
        &self.objects
    }

    #[inline]
    pub fn objects_mut(&mut self) -> &mut ObjectSpace {
        &mut self.objects
    }

    /// Give the object space back, dropping all linkers.
    pub fn into_objects(mut self) -> ObjectSpace {
        self.reset_loaders();
        std::mem::take(&mut self.objects)
    }

    #[inline]
    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut LinkerConfig {
        &mut self.config
    }

    #[inline]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    #[inline]
    pub fn io(&self) -> Option<&Arc<AsyncIoSystem>> {
        self.io.as_ref()
    }

    /// Objects created by the load in progress.
    #[inline]
    pub fn loaded_objects(&self) -> &[ObjectId] {
        &self.loaded
    }

    pub fn linker(&self, id: LinkerId) -> Option<&LinkerLoad> {
        self.linkers.get(id.index()).and_then(Option::as_ref)
    }

    fn linker_ref(&self, id: LinkerId) -> Result<&LinkerLoad> {
        self.linker(id)
            .ok_or_else(|| Error::other(format!("linker {} is no longer registered", id.0)))
    }

    fn linker_mut(&mut self, id: LinkerId) -> Result<&mut LinkerLoad> {
        self.linkers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::other(format!("linker {} is no longer registered", id.0)))
    }

    /// Registered linker for a package name.
    pub fn find_linker(&self, package: &str) -> Option<LinkerId> {
        self.by_package.get(package).copied()
    }

    pub fn linkers(&self) -> impl Iterator<Item = (LinkerId, &LinkerLoad)> {
        self.linkers
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|l| (LinkerId(i as u32), l)))
    }

    /// Map a package name to an explicit file, bypassing the search path.
    pub fn register_package_path(&mut self, package: impl Into<String>, path: impl Into<PathBuf>) {
        self.package_paths.insert(package.into(), path.into());
    }

    /// Locate the file backing `package`.
    pub fn resolve_package_path(&self, package: &str) -> Result<PathBuf> {
        if let Some(path) = self.package_paths.get(package) {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(Error::FileNotFound(path.clone()))
            };
        }
        let file_name = format!("{}.{}", package, self.config.package_extension);
        self.config
            .search_paths
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| Error::PackageNotFound(package.to_string()))
    }

    fn reader_options(&self) -> ReaderOptions {
        ReaderOptions::new().use_mmap(self.config.use_mmap).io(self.io.clone())
    }

    /// Find or register a linker for `package`. Nothing is read yet.
    pub fn create_linker(&mut self, package: &str) -> Result<LinkerId> {
        if let Some(id) = self.find_linker(package) {
            return Ok(id);
        }
        let path = self.resolve_package_path(package)?;
        Ok(self.create_linker_at(package, path))
    }

    fn create_linker_at(&mut self, package: &str, path: PathBuf) -> LinkerId {
        let existed = self.objects.find_package(package).is_some();
        let root = self.objects.create_package(package);
        let id = LinkerId(self.linkers.len() as u32);
        let mut linker = LinkerLoad::new(package, path, self.reader_options())
            .with_header_precache(self.config.header_precache_size)
            .with_granularity(self.config.time_check_granularity);
        linker.id = Some(id);
        linker.root = Some(root);
        linker.owns_root = !existed;
        debug!(package, path = %linker.path().display(), linker = id.0, "created linker");
        self.linkers.push(Some(linker));
        self.by_package.insert(package.to_string(), id);
        self.stats.linkers_created += 1;
        id
    }

    /// Advance a linker through all of its phases within `budget`.
    ///
    /// On failure the linker and every object it created are torn down.
    pub fn tick_linker(&mut self, id: LinkerId, budget: &mut TimeBudget) -> Result<LoadStatus> {
        match self.tick_linker_inner(id, budget) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(linker = id.0, error = %e, "linker failed");
                self.teardown_linker(id);
                Err(e)
            }
        }
    }

    fn tick_linker_inner(&mut self, id: LinkerId, budget: &mut TimeBudget) -> Result<LoadStatus> {
        loop {
            let phase = self.linker_ref(id)?.phase;
            match phase {
                LoadPhase::Done => return Ok(LoadStatus::Done),
                p if !p.tables_ready() => {
                    if self.linker_mut(id)?.tick_tables(budget)? == LoadStatus::Pending {
                        return Ok(LoadStatus::Pending);
                    }
                }
                LoadPhase::ReconcileWithLiveObjects => {
                    if self.config.reconcile_live_objects
                        && self.reconcile_with_live_objects(id, budget)? == LoadStatus::Pending
                    {
                        return Ok(LoadStatus::Pending);
                    }
                    self.check_engine_version(id)?;
                    self.linker_mut(id)?.enter_phase(LoadPhase::Finalize);
                }
                _ => {
                    if self.finalize_linker(id, budget)? == LoadStatus::Pending {
                        return Ok(LoadStatus::Pending);
                    }
                    self.linker_mut(id)?.enter_phase(LoadPhase::Done);
                    let linker = self.linker_ref(id)?;
                    info!(
                        package = linker.package_name(),
                        imports = linker.imports().len(),
                        exports = linker.exports().len(),
                        "linker ready"
                    );
                    return Ok(LoadStatus::Done);
                }
            }
            if budget.is_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
    }

    /// Drive a linker to completion, blocking on outstanding I/O.
    fn complete_linker(&mut self, id: LinkerId) -> Result<()> {
        let mut budget = TimeBudget::unlimited();
        while self.tick_linker(id, &mut budget)? == LoadStatus::Pending {
            self.wait_for_io();
        }
        Ok(())
    }

    pub(crate) fn wait_for_io(&self) {
        match &self.io {
            Some(io) => io.block_till_all_requests_finished(),
            None => std::thread::yield_now(),
        }
    }

    fn check_engine_version(&mut self, id: LinkerId) -> Result<()> {
        let linker = self.linker_mut(id)?;
        let engine_version = linker.summary().engine_version;
        if engine_version > ENGINE_VERSION {
            warn!(
                package = linker.package_name(),
                saved = engine_version,
                current = ENGINE_VERSION,
                "package was saved with a newer engine version"
            );
            linker
                .summary_mut()
                .package_flags
                .insert(PackageFlags::SAVED_WITH_NEWER_VERSION);
        }
        Ok(())
    }

    fn reconcile_with_live_objects(&mut self, id: LinkerId, budget: &mut TimeBudget) -> Result<LoadStatus> {
        loop {
            let linker = self.linker_ref(id)?;
            let index = linker.cursor.index;
            let count = linker.exports.len();
            if index >= count {
                return Ok(LoadStatus::Done);
            }
            if let Some(existing) = self.find_live_export(linker, index) {
                let binding = LinkerBinding { linker: id, export_index: index };
                self.objects.set_linker(existing, Some(binding));
                let linker = self.linker_mut(id)?;
                linker.exports[index].state = ResolveState::Resolved(Some(existing));
                trace!(package = linker.package_name(), export = index, "bound export to live object");
            }
            let linker = self.linker_mut(id)?;
            linker.cursor.index += 1;
            if linker.cursor.index < count && budget.record_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
    }

    fn find_live_export(&self, linker: &LinkerLoad, index: usize) -> Option<ObjectId> {
        let export = &linker.exports[index];
        if export.state.is_settled() {
            return None;
        }
        let outer = match export.outer_index.resource() {
            Resource::Root => linker.root?,
            Resource::Export(o) => linker.exports[o].object()?,
            Resource::Import(_) => return None,
        };
        let class = match export.class_index.resource() {
            Resource::Root => self.objects.class_class(),
            Resource::Export(c) => linker.exports[c].object()?,
            Resource::Import(c) => find_import_in_memory(&self.objects, linker, c)?,
        };
        let existing = self.objects.find_object(Some(outer), &export.object_name, Some(class))?;
        let bound_elsewhere = self
            .objects
            .get(existing)
            .and_then(|o| o.linker())
            .is_some_and(|b| Some(b.linker) != linker.id);
        (!bound_elsewhere).then_some(existing)
    }

    fn finalize_linker(&mut self, id: LinkerId, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let verify = self.config.verify_imports;
        let linker = self.linker_mut(id)?;
        let skip = linker
            .summary()
            .package_flags
            .contains(PackageFlags::REQUIRE_IMPORTS_ALREADY_LOADED);
        if skip || !verify {
            return Ok(LoadStatus::Done);
        }
        linker.finalizing = true;
        loop {
            let linker = self.linker_ref(id)?;
            let index = linker.cursor.index;
            let count = linker.imports.len();
            if index >= count {
                break;
            }
            self.verify_import(id, index)?;
            let linker = self.linker_mut(id)?;
            linker.cursor.index += 1;
            if linker.cursor.index < count && budget.record_exceeded() {
                linker.finalizing = false;
                return Ok(LoadStatus::Pending);
            }
        }
        self.linker_mut(id)?.finalizing = false;
        Ok(LoadStatus::Done)
    }

    /// Linker for `package` with at least its tables loaded.
    ///
    /// `Ok(None)` means the package exists only in memory.
    fn find_or_load_package_linker(&mut self, package: &str) -> Result<Option<LinkerId>> {
        if let Some(id) = self.find_linker(package) {
            if !self.linker_ref(id)?.phase.tables_ready() {
                let mut budget = TimeBudget::unlimited();
                loop {
                    match self.linker_mut(id)?.tick_tables(&mut budget) {
                        Ok(LoadStatus::Done) => break,
                        Ok(LoadStatus::Pending) => self.wait_for_io(),
                        Err(e) => {
                            self.teardown_linker(id);
                            return Err(e);
                        }
                    }
                }
            }
            return Ok(Some(id));
        }
        match self.resolve_package_path(package) {
            Ok(path) => {
                let id = self.create_linker_at(package, path);
                self.complete_linker(id)?;
                Ok(Some(id))
            }
            Err(Error::PackageNotFound(_)) if self.objects.find_package(package).is_some() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fully loaded linker for `package`.
    pub fn get_package_linker(&mut self, package: &str) -> Result<LinkerId> {
        let id = self
            .find_or_load_package_linker(package)?
            .ok_or_else(|| Error::PackageNotFound(package.to_string()))?;
        let linker = self.linker_ref(id)?;
        if linker.phase != LoadPhase::Done && !linker.finalizing {
            self.complete_linker(id)?;
        }
        Ok(id)
    }

    /// Map a signed index from linker `id` to an object, creating it on demand.
    pub fn index_to_object(&mut self, id: LinkerId, index: PackageIndex) -> Result<Option<ObjectId>> {
        let linker = self.linker_ref(id)?;
        match index.check(linker.imports.len(), linker.exports.len())?.resource() {
            Resource::Root => Ok(linker.root),
            Resource::Export(i) => self.create_export(id, i),
            Resource::Import(i) => self.create_import(id, i),
        }
    }

    /// Materialize export `index` of linker `id`.
    ///
    /// Idempotent: a second call returns the same handle without I/O. A
    /// missing outer degrades the export to `None` with a warning.
    pub fn create_export(&mut self, id: LinkerId, index: usize) -> Result<Option<ObjectId>> {
        let name = {
            let linker = self.linker_ref(id)?;
            let export = linker.exports.get(index).ok_or(Error::BadResourceIndex {
                index: PackageIndex::from_export(index).raw(),
                imports: linker.imports.len(),
                exports: linker.exports.len(),
            })?;
            match export.state {
                ResolveState::Resolving(object) => return Ok(Some(object)),
                ResolveState::Resolved(object) => return Ok(object),
                ResolveState::Unresolved => {}
            }
            if export.archetype_index == PackageIndex::from_export(index) {
                return Err(Error::ArchetypeCycle(linker.export_path_name(index)));
            }
            export.object_name.clone()
        };

        let object = self.objects.reserve(name);
        self.linker_mut(id)?.exports[index].state = ResolveState::Resolving(object);

        match self.construct_export(id, index, object) {
            Ok(true) => {
                let linker = self.linker_mut(id)?;
                linker.exports[index].state = ResolveState::Resolved(Some(object));
                linker.created.push(object);
                self.loaded.push(object);
                Ok(Some(object))
            }
            Ok(false) => {
                self.objects.destroy(object);
                self.linker_mut(id)?.exports[index].state = ResolveState::Resolved(None);
                Ok(None)
            }
            Err(e) => {
                self.objects.destroy(object);
                if let Ok(linker) = self.linker_mut(id) {
                    linker.exports[index].state = ResolveState::Unresolved;
                }
                Err(e)
            }
        }
    }

    fn construct_export(&mut self, id: LinkerId, index: usize, object: ObjectId) -> Result<bool> {
        let linker = self.linker_ref(id)?;
        let export = linker.exports[index].clone();
        let path = linker.export_path_name(index);

        let outer = match self.index_to_object(id, export.outer_index)? {
            Some(outer) => outer,
            None => {
                warn!(export = %path, "outer could not be loaded, export left null");
                return Ok(false);
            }
        };

        let class = if export.class_index.is_root() {
            self.objects.class_class()
        } else {
            match self.index_to_object(id, export.class_index)? {
                Some(class) => class,
                None => {
                    warn!(export = %path, "class could not be loaded, export left null");
                    return Ok(false);
                }
            }
        };
        self.preload(class)?;

        let super_struct = if export.is_class() && !export.super_index.is_root() {
            let super_struct = self.index_to_object(id, export.super_index)?;
            if let Some(s) = super_struct {
                self.preload(s)?;
            }
            super_struct
        } else {
            None
        };

        let archetype = if export.archetype_index.is_root() {
            None
        } else {
            let archetype = self.index_to_object(id, export.archetype_index)?;
            match archetype {
                Some(a) => self.preload(a)?,
                None => warn!(export = %path, "archetype missing, using class defaults"),
            }
            archetype
        };

        let properties = match archetype.and_then(|a| self.objects.get(a)) {
            Some(a) => a.properties.clone(),
            None => self.objects.class_defaults(class),
        };
        let mut flags = export.object_flags.persistent() | ObjectFlags::NEED_LOAD;
        if self.async_loading {
            flags.insert(ObjectFlags::ASYNC_LOADING);
        }
        let binding = LinkerBinding { linker: id, export_index: index };
        self.objects
            .construct(object, class, Some(outer), archetype, flags, properties, Some(binding));
        self.objects.set_super_struct(object, super_struct);
        trace!(export = %path, object = object.index(), "created export");
        Ok(true)
    }

    /// Materialize import `index` of linker `id`.
    pub fn create_import(&mut self, id: LinkerId, index: usize) -> Result<Option<ObjectId>> {
        let linker = self.linker_ref(id)?;
        let import = linker.imports.get(index).ok_or(Error::BadResourceIndex {
            index: PackageIndex::from_import(index).raw(),
            imports: linker.imports.len(),
            exports: linker.exports.len(),
        })?;
        if import.state.is_settled() {
            return Ok(import.object());
        }

        let in_memory_only = linker
            .summary()
            .package_flags
            .contains(PackageFlags::REQUIRE_IMPORTS_ALREADY_LOADED);
        if self.config.probe_live_objects || in_memory_only {
            if let Some(object) = find_import_in_memory(&self.objects, linker, index) {
                self.linker_mut(id)?.imports[index].state = ResolveState::Resolved(Some(object));
                return Ok(Some(object));
            }
            if in_memory_only {
                let linker = self.linker_mut(id)?;
                linker.imports[index].verified = true;
                return self.import_failed(id, index).map(|()| None);
            }
        }

        self.verify_import(id, index)?;

        let import = &self.linker_ref(id)?.imports[index];
        if import.state.is_settled() {
            return Ok(import.object());
        }
        let object = match (import.source_linker, import.source_index) {
            (Some(source), Some(export)) => self.create_export(source, export)?,
            _ => None,
        };
        self.linker_mut(id)?.imports[index].state = ResolveState::Resolved(object);
        Ok(object)
    }

    /// Locate the source of import `index`, loading foreign packages as needed.
    ///
    /// Falls back to a redirector with the same name, then to objects
    /// already in memory. What happens when everything fails depends on
    /// [`ImportPolicy`].
    pub fn verify_import(&mut self, id: LinkerId, index: usize) -> Result<()> {
        {
            let linker = self.linker_mut(id)?;
            let count = linker.imports.len();
            let exports = linker.exports.len();
            let import = linker.imports.get_mut(index).ok_or(Error::BadResourceIndex {
                index: PackageIndex::from_import(index).raw(),
                imports: count,
                exports,
            })?;
            if import.verified {
                return Ok(());
            }
            import.verified = true;
        }
        self.stats.imports_verified += 1;
        if self.verify_import_inner(id, index)? {
            return Ok(());
        }
        self.import_failed(id, index)
    }

    fn import_failed(&mut self, id: LinkerId, index: usize) -> Result<()> {
        let linker = self.linker_ref(id)?;
        let import = linker.import_full_name(index);
        let package = linker.package_name().to_string();
        match self.config.import_policy {
            ImportPolicy::Strict => Err(Error::FailedImport { import, package }),
            ImportPolicy::Lenient => {
                warn!(%import, %package, "failed import, reference left null");
                self.linker_mut(id)?.imports[index].state = ResolveState::Resolved(None);
                Ok(())
            }
        }
    }

    fn verify_import_inner(&mut self, id: LinkerId, index: usize) -> Result<bool> {
        let import = self.linker_ref(id)?.imports[index].clone();

        if import.is_package() {
            let package = import.object_name.to_string();
            return match self.find_or_load_package_linker(&package) {
                Ok(Some(source)) => {
                    let root = self.linker_ref(source)?.root;
                    let import = &mut self.linker_mut(id)?.imports[index];
                    import.source_linker = Some(source);
                    import.state = ResolveState::Resolved(root);
                    Ok(true)
                }
                Ok(None) => {
                    let package = self.objects.find_package(&package);
                    self.linker_mut(id)?.imports[index].state = ResolveState::Resolved(package);
                    Ok(package.is_some())
                }
                Err(Error::PackageNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let Some(outer) = import.outer_index.import_index() else {
            return Ok(false);
        };
        self.verify_import(id, outer)?;
        let (outer_linker, outer_export) = {
            let outer = &self.linker_ref(id)?.imports[outer];
            (outer.source_linker, outer.source_index)
        };

        if let Some(source) = outer_linker {
            let (found, redirector) = {
                let linker = self.linker_ref(source)?;
                let found = linker.find_export(&import.object_name, &import.class_name, &import.class_package, outer_export);
                let redirector = found.is_none().then(|| {
                    linker.find_export(
                        &import.object_name,
                        &Name::new(REDIRECTOR_CLASS),
                        &Name::new(CORE_PACKAGE),
                        outer_export,
                    )
                });
                (found, redirector.flatten())
            };

            if let Some(export) = found {
                let import = &mut self.linker_mut(id)?.imports[index];
                import.source_linker = Some(source);
                import.source_index = Some(export);
                return Ok(true);
            }

            if let Some(redirector) = redirector {
                if let Some(destination) = self.follow_redirector(source, redirector, &import.class_name)? {
                    let binding = self.objects.get(destination).and_then(|o| o.linker());
                    let import = &mut self.linker_mut(id)?.imports[index];
                    import.state = ResolveState::Resolved(Some(destination));
                    if let Some(binding) = binding {
                        import.source_linker = Some(binding.linker);
                        import.source_index = Some(binding.export_index);
                    }
                    return Ok(true);
                }
            }
        }

        let found = find_import_in_memory(&self.objects, self.linker_ref(id)?, index);
        match found {
            Some(object) => {
                self.linker_mut(id)?.imports[index].state = ResolveState::Resolved(Some(object));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn follow_redirector(&mut self, source: LinkerId, export: usize, class_name: &Name) -> Result<Option<ObjectId>> {
        let Some(redirector) = self.create_export(source, export)? else {
            return Ok(None);
        };
        self.preload(redirector)?;
        let from = self.objects.path_name(redirector);
        let Some(destination) = self.objects.redirector_destination(redirector) else {
            warn!(redirector = %from, "redirector has no destination");
            return Ok(None);
        };
        let destination_class = self
            .objects
            .get(destination)
            .and_then(|o| self.objects.get(o.class()))
            .map(|c| c.name().clone());
        if destination_class.as_ref() != Some(class_name) {
            warn!(
                redirector = %from,
                expected = %class_name,
                "redirector destination has a different class"
            );
            return Ok(None);
        }
        self.stats.redirectors_followed += 1;
        info!(from = %from, to = %self.objects.path_name(destination), "followed redirector");
        Ok(Some(destination))
    }

    /// Read and decode the body of `object` if it still needs loading.
    ///
    /// The class (and for classes, the super class) is preloaded first.
    pub fn preload(&mut self, object: ObjectId) -> Result<()> {
        let Some(current) = self.objects.get(object) else { return Ok(()) };
        if !current.flags.contains(ObjectFlags::NEED_LOAD) {
            return Ok(());
        }
        let Some(binding) = current.linker() else { return Ok(()) };
        let class = current.class();
        let super_struct = current.super_struct();

        if class != object {
            self.preload(class)?;
        }
        if let Some(s) = super_struct.filter(|_| self.objects.is_class(object)) {
            self.preload(s)?;
        }
        match self.objects.get_mut(object) {
            Some(o) if o.flags.contains(ObjectFlags::NEED_LOAD) => o.flags.remove(ObjectFlags::NEED_LOAD),
            _ => return Ok(()),
        }

        let linker = self.linker_mut(binding.linker)?;
        let export = &linker.exports[binding.export_index];
        let (offset, size) = (export.serial_offset as u64, export.serial_size as usize);
        let (imports, exports) = (linker.imports.len(), linker.exports.len());
        let path = linker.export_path_name(binding.export_index);
        let reader = linker.reader_mut()?;
        let swap = reader.is_byte_swapped();
        let total = reader.total_size();
        if !offset.checked_add(size as u64).is_some_and(|end| end <= total) {
            return Err(Error::SerialSizeMismatch {
                export: path,
                expected: size as i64,
                actual: total.saturating_sub(offset) as i64,
            });
        }
        reader.precache(offset, size);
        let bytes = reader.read_region(offset, size)?;
        self.stats.bodies_read += 1;

        let (body, consumed) = ExportBody::decode(&bytes, swap, imports, exports).map_err(|e| match e {
            Error::UnexpectedEof(actual) => Error::SerialSizeMismatch {
                export: path.clone(),
                expected: size as i64,
                actual: actual as i64,
            },
            other => other,
        })?;
        if consumed != size {
            return Err(Error::SerialSizeMismatch { export: path, expected: size as i64, actual: consumed as i64 });
        }

        let mut references = Vec::with_capacity(body.references.len());
        for reference in body.references {
            match self.index_to_object(binding.linker, reference)? {
                Some(target) => references.push(target),
                None => warn!(export = %path, reference = %reference, "dropping unresolved reference"),
            }
        }

        if let Some(o) = self.objects.get_mut(object) {
            o.properties = body.properties;
            o.references = references;
            o.flags.insert(ObjectFlags::NEED_POST_LOAD);
        }
        trace!(export = %path, size, "preloaded");
        Ok(())
    }

    /// Run the post-load hook of `object` once, archetype first.
    pub fn conditional_post_load(&mut self, object: ObjectId) -> Result<()> {
        let Some(current) = self.objects.get_mut(object) else { return Ok(()) };
        if !current.flags.contains(ObjectFlags::NEED_POST_LOAD) {
            return Ok(());
        }
        current.flags.remove(ObjectFlags::NEED_POST_LOAD);
        current.flags.insert(ObjectFlags::POST_LOADING);
        let archetype = current.archetype();

        if let Some(archetype) = archetype {
            self.preload(archetype)?;
            self.conditional_post_load(archetype)?;
        }
        if let Some(hook) = self.objects.post_load_hook(object) {
            hook.post_load(self, object)?;
        }
        if let Some(o) = self.objects.get_mut(object) {
            o.flags.remove(ObjectFlags::POST_LOADING);
        }
        Ok(())
    }

    pub(crate) fn begin_load(&mut self) {
        self.load_depth += 1;
    }

    /// Leave a load scope. The loaded list is cleared by the outermost one.
    pub(crate) fn end_load(&mut self) {
        self.load_depth = self.load_depth.saturating_sub(1);
        if self.load_depth == 0 {
            self.loaded.clear();
        }
    }

    /// Preload then post-load everything in the loaded list, including
    /// objects that appear while doing so.
    fn flush_loaded(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.loaded.len() {
            let object = self.loaded[index];
            self.preload(object)?;
            index += 1;
        }
        let mut index = 0;
        while index < self.loaded.len() {
            let object = self.loaded[index];
            self.preload(object)?;
            self.conditional_post_load(object)?;
            index += 1;
        }
        Ok(())
    }

    /// Load a whole package synchronously and return its package object.
    pub fn load_package(&mut self, package: &str) -> Result<ObjectId> {
        let mut request = AsyncPackage::new(package);
        let mut budget = TimeBudget::unlimited();
        loop {
            match request.tick(self, &mut budget) {
                Ok(LoadStatus::Done) => return request.complete(self),
                Ok(LoadStatus::Pending) => self.wait_for_io(),
                Err(e) => {
                    request.fail(self, &e);
                    return Err(e);
                }
            }
        }
    }

    /// Load the package stored at `path`, named after the file stem.
    pub fn load_package_from_path(&mut self, path: impl AsRef<Path>) -> Result<ObjectId> {
        let path = path.as_ref();
        let package = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| Error::other(format!("no package name in {}", path.display())))?;
        self.register_package_path(package.clone(), path);
        self.load_package(&package)
    }

    /// Load one object by package and dotted path inside it, e.g. `Group.Mesh`.
    ///
    /// Returns `Ok(None)` when the package has no such export. A
    /// redirector export resolves to its destination.
    pub fn load_object(&mut self, package: &str, path: &str) -> Result<Option<ObjectId>> {
        let id = self.get_package_linker(package)?;
        let Some(index) = self.linker_ref(id)?.find_export_by_path(path) else {
            return Ok(None);
        };
        self.begin_load();
        let result = self.create_export(id, index).and_then(|object| {
            self.flush_loaded()?;
            Ok(object)
        });
        self.end_load();
        let object = result?;
        match object.and_then(|o| self.objects.redirector_destination(o)) {
            Some(destination) => {
                self.stats.redirectors_followed += 1;
                debug!(package, path, "followed redirector");
                Ok(Some(destination))
            }
            None => Ok(object),
        }
    }

    /// Export of linker `id` matching name, class and outer.
    pub fn find_export_index(
        &self,
        id: LinkerId,
        class_name: &str,
        class_package: &str,
        name: &Name,
        outer: Option<usize>,
    ) -> Option<usize> {
        self.linker(id)?
            .find_export(name, &Name::new(class_name), &Name::new(class_package), outer)
    }

    /// Transitive closure of the depends table for one export.
    ///
    /// Imports are verified so the closure crosses package boundaries.
    pub fn gather_export_dependencies(
        &mut self,
        id: LinkerId,
        export: usize,
        out: &mut FxHashSet<(LinkerId, usize)>,
    ) -> Result<()> {
        let depends = self
            .linker_ref(id)?
            .depends()
            .get(export)
            .cloned()
            .unwrap_or_default();
        for dependency in depends {
            let target = match dependency.resource() {
                Resource::Root => None,
                Resource::Export(i) => Some((id, i)),
                Resource::Import(i) => {
                    self.verify_import(id, i)?;
                    let import = &self.linker_ref(id)?.imports[i];
                    import.source_linker.zip(import.source_index)
                }
            };
            if let Some(target) = target {
                if out.insert(target) {
                    self.gather_export_dependencies(target.0, target.1, out)?;
                }
            }
        }
        Ok(())
    }

    /// Remove a linker and destroy every object it created.
    ///
    /// Objects that were merely bound to it lose the binding. Imports in
    /// other linkers that pointed at it are reset.
    pub fn teardown_linker(&mut self, id: LinkerId) {
        let Some(linker) = self.linkers.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        debug!(package = linker.package_name(), created = linker.created.len(), "tearing down linker");
        for &object in linker.created.iter().rev() {
            self.objects.destroy(object);
        }
        self.unbind_exports(id, &linker);
        if let Some(root) = linker.root.filter(|_| linker.owns_root) {
            let in_use = self.objects.iter().any(|(_, o)| o.outer() == Some(root));
            if !in_use {
                self.objects.destroy(root);
            }
        }
        self.unregister(id, &linker);
        let objects = &self.objects;
        self.loaded.retain(|&o| objects.contains(o));
        for other in self.linkers.iter_mut().flatten() {
            for import in other.imports.iter_mut() {
                let dangling = import.object().is_some_and(|o| !objects.contains(o));
                if import.source_linker == Some(id) || dangling {
                    import.source_linker = None;
                    import.source_index = None;
                    import.verified = false;
                    import.state = ResolveState::Unresolved;
                }
            }
            for export in other.exports.iter_mut() {
                if export.object().is_some_and(|o| !objects.contains(o)) {
                    export.state = ResolveState::Unresolved;
                }
            }
        }
    }

    fn unbind_exports(&mut self, id: LinkerId, linker: &LinkerLoad) {
        for export in &linker.exports {
            let Some(object) = export.object() else { continue };
            let bound = self
                .objects
                .get(object)
                .and_then(|o| o.linker())
                .is_some_and(|b| b.linker == id);
            if bound {
                self.objects.set_linker(object, None);
            }
        }
    }

    fn unregister(&mut self, id: LinkerId, linker: &LinkerLoad) {
        if self.by_package.get(linker.package_name()) == Some(&id) {
            self.by_package.remove(linker.package_name());
        }
    }

    /// Detach the linker of `package` without destroying its objects.
    ///
    /// Objects still waiting for their body lose it; a warning is logged.
    pub fn reset_loader(&mut self, package: &str) -> bool {
        let Some(id) = self.find_linker(package) else { return false };
        self.detach_linker(id);
        true
    }

    /// Detach every linker without destroying objects.
    pub fn reset_loaders(&mut self) -> usize {
        let ids: Vec<LinkerId> = self.linkers().map(|(id, _)| id).collect();
        for &id in &ids {
            self.detach_linker(id);
        }
        ids.len()
    }

    fn detach_linker(&mut self, id: LinkerId) {
        let Some(mut linker) = self.linkers.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        linker.detach();
        for export in &linker.exports {
            let Some(object) = export.object() else { continue };
            if let Some(o) = self.objects.get_mut(object) {
                if o.flags.contains(ObjectFlags::NEED_LOAD) {
                    warn!(object = %o.name(), "detaching linker before object was loaded");
                    o.flags.remove(ObjectFlags::NEED_LOAD);
                }
            }
        }
        self.unbind_exports(id, &linker);
        self.unregister(id, &linker);
        for other in self.linkers.iter_mut().flatten() {
            for import in other.imports.iter_mut().filter(|i| i.source_linker == Some(id)) {
                import.source_linker = None;
                import.source_index = None;
                if !import.state.is_settled() {
                    import.verified = false;
                }
            }
        }
        debug!(package = linker.package_name(), "detached linker");
    }
}

impl std::fmt::Debug for LoadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSession")
            .field("objects", &self.objects.len())
            .field("linkers", &self.by_package.len())
            .field("loaded", &self.loaded.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Resolve an import purely against objects already in memory.
fn find_import_in_memory(objects: &ObjectSpace, linker: &LinkerLoad, index: usize) -> Option<ObjectId> {
    let import = linker.imports.get(index)?;
    if let Some(object) = import.object() {
        return Some(object);
    }
    match import.outer_index.import_index() {
        None => objects.find_object(None, &import.object_name, Some(objects.package_class())),
        Some(outer) => {
            let outer = find_import_in_memory(objects, linker, outer)?;
            let class = objects.find_class(import.class_package.base(), import.class_name.base())?;
            objects.find_object(Some(outer), &import.object_name, Some(class))
        }
    }
}
