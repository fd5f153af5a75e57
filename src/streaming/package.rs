//! Resumable load of a single package.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::TimeBudget;
use crate::linker::{LinkerId, LoadSession, LoadStatus};
use crate::object::{ObjectFlags, ObjectId};
use crate::util::{Error, Result};

/// Called once when a requested package finishes or fails.
pub type CompletionCallback = Box<dyn FnOnce(&str, std::result::Result<ObjectId, &Error>)>;

/// Step of an [`AsyncPackage`]. Steps run in order; post-load loops back
/// to preload when it created new objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AsyncPhase {
    Linker,
    CreateImports,
    CreateExports,
    Preload,
    PostLoad,
    Finish,
    Done,
}

impl AsyncPhase {
    fn next(self) -> AsyncPhase {
        use AsyncPhase::*;
        match self {
            Linker => CreateImports,
            CreateImports => CreateExports,
            CreateExports => Preload,
            Preload => PostLoad,
            PostLoad => Finish,
            Finish | Done => Done,
        }
    }
}

/// One package being loaded.
pub struct AsyncPackage {
    name: String,
    linker: Option<LinkerId>,
    phase: AsyncPhase,
    import_index: usize,
    export_index: usize,
    preload_index: usize,
    post_load_index: usize,
    load_percentage: f32,
    started: Option<Instant>,
    ticks: u32,
    callbacks: Vec<CompletionCallback>,
}

impl AsyncPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            linker: None,
            phase: AsyncPhase::Linker,
            import_index: 0,
            export_index: 0,
            preload_index: 0,
            post_load_index: 0,
            load_percentage: 0.0,
            started: None,
            ticks: 0,
            callbacks: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn phase(&self) -> AsyncPhase {
        self.phase
    }

    #[inline]
    pub fn linker(&self) -> Option<LinkerId> {
        self.linker
    }

    /// Share of exports created so far, 0 to 100.
    #[inline]
    pub fn load_percentage(&self) -> f32 {
        self.load_percentage
    }

    /// Ticks spent on this package.
    #[inline]
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn add_callback(&mut self, callback: CompletionCallback) {
        self.callbacks.push(callback);
    }

    /// Advance the load within `budget`.
    pub fn tick(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        if self.started.is_none() {
            session.begin_load();
            self.started = Some(Instant::now());
            debug!(package = %self.name, "started loading package");
        }
        self.ticks += 1;
        let was_async = std::mem::replace(&mut session.async_loading, true);
        let result = self.tick_phases(session, budget);
        session.async_loading = was_async;
        result
    }

    fn tick_phases(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        loop {
            let status = match self.phase {
                AsyncPhase::Linker => self.tick_linker(session, budget)?,
                AsyncPhase::CreateImports => self.create_imports(session, budget)?,
                AsyncPhase::CreateExports => self.create_exports(session, budget)?,
                AsyncPhase::Preload => self.preload_objects(session, budget)?,
                AsyncPhase::PostLoad => self.post_load_objects(session, budget)?,
                AsyncPhase::Finish => self.finish_objects(session),
                AsyncPhase::Done => return Ok(LoadStatus::Done),
            };
            if status == LoadStatus::Pending {
                return Ok(LoadStatus::Pending);
            }
            self.phase = match self.phase {
                AsyncPhase::PostLoad if self.preload_index < session.loaded.len() => AsyncPhase::Preload,
                phase => phase.next(),
            };
            if self.phase == AsyncPhase::Done {
                return Ok(LoadStatus::Done);
            }
            if budget.is_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
    }

    fn tick_linker(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let id = match self.linker {
            Some(id) => id,
            None => match session.create_linker(&self.name) {
                Ok(id) => {
                    self.linker = Some(id);
                    id
                }
                Err(Error::PackageNotFound(_)) if session.objects().find_package(&self.name).is_some() => {
                    debug!(package = %self.name, "package exists only in memory");
                    return Ok(LoadStatus::Done);
                }
                Err(e) => return Err(e),
            },
        };
        session.tick_linker(id, budget)
    }

    fn create_imports(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let Some(id) = self.linker else { return Ok(LoadStatus::Done) };
        let count = session.linker(id).map_or(0, |l| l.imports().len());
        while self.import_index < count {
            session.create_import(id, self.import_index)?;
            self.import_index += 1;
            if self.import_index < count && budget.record_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn create_exports(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        let Some(id) = self.linker else {
            self.load_percentage = 100.0;
            return Ok(LoadStatus::Done);
        };
        let count = session.linker(id).map_or(0, |l| l.exports().len());
        while self.export_index < count {
            if let Some(object) = session.create_export(id, self.export_index)? {
                session.preload(object)?;
            }
            self.export_index += 1;
            self.load_percentage = 100.0 * self.export_index as f32 / count as f32;
            if self.export_index < count && budget.record_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
        self.load_percentage = 100.0;
        Ok(LoadStatus::Done)
    }

    fn preload_objects(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        while self.preload_index < session.loaded.len() {
            let object = session.loaded[self.preload_index];
            session.preload(object)?;
            self.preload_index += 1;
            if self.preload_index < session.loaded.len() && budget.record_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn post_load_objects(&mut self, session: &mut LoadSession, budget: &mut TimeBudget) -> Result<LoadStatus> {
        while self.post_load_index < session.loaded.len() {
            let object = session.loaded[self.post_load_index];
            session.preload(object)?;
            session.conditional_post_load(object)?;
            self.post_load_index += 1;
            if self.post_load_index < session.loaded.len() && budget.record_exceeded() {
                return Ok(LoadStatus::Pending);
            }
        }
        Ok(LoadStatus::Done)
    }

    fn finish_objects(&mut self, session: &mut LoadSession) -> LoadStatus {
        for i in 0..session.loaded.len() {
            let object = session.loaded[i];
            if let Some(o) = session.objects_mut().get_mut(object) {
                o.flags.remove(ObjectFlags::ASYNC_LOADING);
            }
        }
        if self.started.is_some() {
            session.end_load();
        }
        if let Some(started) = self.started.take() {
            info!(
                package = %self.name,
                ticks = self.ticks,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                "finished loading package"
            );
        }
        LoadStatus::Done
    }

    /// Package object of a finished load. Runs the completion callbacks.
    pub fn complete(&mut self, session: &mut LoadSession) -> Result<ObjectId> {
        let root = self
            .linker
            .and_then(|id| session.linker(id))
            .and_then(|l| l.root())
            .or_else(|| session.objects().find_package(&self.name))
            .ok_or_else(|| Error::PackageNotFound(self.name.clone()));
        for callback in self.callbacks.drain(..) {
            callback(&self.name, root.as_ref().copied());
        }
        root
    }

    /// Abandon the load: tear down the linker and report `error`.
    pub fn fail(&mut self, session: &mut LoadSession, error: &Error) {
        warn!(package = %self.name, %error, "package load failed");
        if let Some(id) = self.linker.take() {
            session.teardown_linker(id);
        }
        if self.started.take().is_some() {
            session.end_load();
        }
        self.phase = AsyncPhase::Done;
        for callback in self.callbacks.drain(..) {
            callback(&self.name, Err(error));
        }
    }
}

impl std::fmt::Debug for AsyncPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPackage")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("load_percentage", &self.load_percentage)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
