//! Queue of asynchronous package requests.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::core::TimeBudget;
use crate::linker::{LoadSession, LoadStatus};

use super::{AsyncPackage, CompletionCallback};

/// FIFO of package loads, advanced by [`process_async_loading`].
///
/// Only the front package is ticked; it must finish before the next one
/// starts. Requests for a package already queued merge their callbacks.
///
/// [`process_async_loading`]: AsyncPackageQueue::process_async_loading
#[derive(Debug, Default)]
pub struct AsyncPackageQueue {
    packages: VecDeque<AsyncPackage>,
}

impl AsyncPackageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `package`. Duplicate requests share one load.
    pub fn load_package_async(&mut self, package: &str, callback: Option<CompletionCallback>) {
        if let Some(existing) = self.packages.iter_mut().find(|p| p.name() == package) {
            if let Some(callback) = callback {
                existing.add_callback(callback);
            }
            debug!(package, "merged duplicate async request");
            return;
        }
        let mut request = AsyncPackage::new(package);
        if let Some(callback) = callback {
            request.add_callback(callback);
        }
        debug!(package, queued = self.packages.len() + 1, "queued async load");
        self.packages.push_back(request);
    }

    /// Progress of a queued package, or `-1.0` if it is not queued.
    pub fn async_load_percentage(&self, package: &str) -> f32 {
        self.packages
            .iter()
            .find(|p| p.name() == package)
            .map_or(-1.0, AsyncPackage::load_percentage)
    }

    #[inline]
    pub fn is_loading(&self) -> bool {
        !self.packages.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Work on queued packages until `time_limit` runs out.
    ///
    /// `None` means no limit. Returns `Done` once the queue is empty.
    /// Failures are reported through the package callbacks.
    pub fn process_async_loading(&mut self, session: &mut LoadSession, time_limit: Option<Duration>) -> LoadStatus {
        let granularity = session.config().time_check_granularity;
        let mut budget = TimeBudget::with_limit(time_limit).with_granularity(granularity);
        while let Some(request) = self.packages.front_mut() {
            match request.tick(session, &mut budget) {
                Ok(LoadStatus::Done) => {
                    if let Some(mut request) = self.packages.pop_front() {
                        // Errors here already reached the callbacks.
                        let _ = request.complete(session);
                    }
                }
                Ok(LoadStatus::Pending) => break,
                Err(e) => {
                    if let Some(mut request) = self.packages.pop_front() {
                        request.fail(session, &e);
                    }
                }
            }
            if budget.is_exceeded() {
                break;
            }
        }
        if self.packages.is_empty() {
            LoadStatus::Done
        } else {
            LoadStatus::Pending
        }
    }

    /// Finish every queued package, blocking as needed.
    pub fn flush_async_loading(&mut self, session: &mut LoadSession) {
        while self.process_async_loading(session, None) == LoadStatus::Pending {
            session.wait_for_io();
        }
    }
}
