//! Background reader serving byte-range requests.
//!
//! One worker thread drains a priority queue of read requests. Each
//! request names a file range and a destination buffer; compressed
//! requests are decoded with the chunk codec before delivery. Completion
//! decrements the request's counter, which callers poll.
//!
//! The request queue and the filename -> mapping cache share one mutex.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fxhash::FxHashMap;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::core::chunk::decompress_block;
use crate::core::CompressionFlags;
use crate::util::{Error, Result};

/// Counter decremented when a request completes or is cancelled.
pub type IoCounter = Arc<AtomicUsize>;

/// Identifier returned for every queued request.
pub type IoRequestId = u64;

/// Request priority. Higher priorities are served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IoPriority {
    Low,
    #[default]
    Normal,
    High,
}

struct IoRequest {
    id: IoRequestId,
    path: PathBuf,
    offset: u64,
    size: usize,
    /// Set for compressed-block requests.
    compression: Option<CompressionFlags>,
    dest: Arc<Mutex<Vec<u8>>>,
    counter: IoCounter,
    priority: IoPriority,
}

struct IoState {
    queue: Vec<IoRequest>,
    handles: FxHashMap<PathBuf, Arc<Mmap>>,
    min_priority: IoPriority,
    suspend_count: u32,
    next_id: IoRequestId,
}

struct Shared {
    state: Mutex<IoState>,
    wake: Condvar,
    running: AtomicBool,
    /// Queued plus in-flight requests.
    outstanding: AtomicUsize,
}

/// Handle to the background reader. Dropping it stops the worker.
pub struct AsyncIoSystem {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncIoSystem {
    /// Spawn the worker thread.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(IoState {
                queue: Vec::new(),
                handles: FxHashMap::default(),
                min_priority: IoPriority::Low,
                suspend_count: 0,
                next_id: 1,
            }),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            outstanding: AtomicUsize::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("pkglink-async-io".into())
            .spawn(move || worker_loop(worker_shared))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn async io worker; requests will never complete");
        }

        Self { shared, handle: Mutex::new(handle) }
    }

    /// Queue a raw read of `size` bytes at `offset` into `dest`.
    pub fn load_data(
        &self,
        path: impl AsRef<Path>,
        offset: u64,
        size: usize,
        dest: Arc<Mutex<Vec<u8>>>,
        counter: IoCounter,
        priority: IoPriority,
    ) -> IoRequestId {
        self.queue(path.as_ref(), offset, size, None, dest, counter, priority)
    }

    /// Queue a read of a compressed block; `dest` receives the decoded bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn load_compressed_data(
        &self,
        path: impl AsRef<Path>,
        offset: u64,
        size: usize,
        flags: CompressionFlags,
        dest: Arc<Mutex<Vec<u8>>>,
        counter: IoCounter,
        priority: IoPriority,
    ) -> IoRequestId {
        self.queue(path.as_ref(), offset, size, Some(flags), dest, counter, priority)
    }

    #[allow(clippy::too_many_arguments)]
    fn queue(
        &self,
        path: &Path,
        offset: u64,
        size: usize,
        compression: Option<CompressionFlags>,
        dest: Arc<Mutex<Vec<u8>>>,
        counter: IoCounter,
        priority: IoPriority,
    ) -> IoRequestId {
        counter.fetch_add(1, Ordering::SeqCst);
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push(IoRequest {
            id,
            path: path.to_path_buf(),
            offset,
            size,
            compression,
            dest,
            counter,
            priority,
        });
        drop(state);
        self.shared.wake.notify_one();
        id
    }

    /// Remove a batch of requests, but only if none of them has started.
    ///
    /// Returns `false` and leaves the queue untouched otherwise.
    pub fn cancel_requests(&self, ids: &[IoRequestId]) -> bool {
        let mut state = self.shared.state.lock();
        let all_pending = ids.iter().all(|id| state.queue.iter().any(|r| r.id == *id));
        if !all_pending {
            return false;
        }
        let mut cancelled = Vec::with_capacity(ids.len());
        state.queue.retain(|r| {
            if ids.contains(&r.id) {
                cancelled.push(Arc::clone(&r.counter));
                false
            } else {
                true
            }
        });
        drop(state);
        for counter in cancelled {
            counter.fetch_sub(1, Ordering::SeqCst);
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    /// Busy-wait until every queued and in-flight request has completed.
    ///
    /// Blocks forever while the worker is suspended with requests queued.
    pub fn block_till_all_requests_finished(&self) {
        while self.shared.outstanding.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_micros(100));
        }
    }

    /// Requests queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Drop every cached file mapping.
    pub fn flush_handles(&self) {
        self.shared.state.lock().handles.clear();
    }

    /// Ignore requests below `priority` until lowered again.
    pub fn set_min_priority(&self, priority: IoPriority) {
        self.shared.state.lock().min_priority = priority;
        self.shared.wake.notify_all();
    }

    /// Stop dispatching new requests. Calls nest.
    pub fn suspend(&self) {
        self.shared.state.lock().suspend_count += 1;
    }

    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        state.suspend_count = state.suspend_count.saturating_sub(1);
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Stop the worker and wait for it to finish.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for AsyncIoSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncIoSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Index of the oldest request with the highest eligible priority.
fn next_request_index(state: &IoState) -> Option<usize> {
    let mut best: Option<(usize, IoPriority)> = None;
    for (i, request) in state.queue.iter().enumerate() {
        if request.priority < state.min_priority {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, priority)) => request.priority > priority,
        };
        if better {
            best = Some((i, request.priority));
        }
    }
    best.map(|(i, _)| i)
}

/// Main worker loop - runs in background thread.
fn worker_loop(shared: Arc<Shared>) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if state.suspend_count == 0 {
                    if let Some(index) = next_request_index(&state) {
                        break state.queue.remove(index);
                    }
                }
                shared.wake.wait(&mut state);
            }
        };

        let result = fulfill(&shared, &request);
        {
            let mut dest = request.dest.lock();
            match result {
                Ok(bytes) => *dest = bytes,
                Err(e) => {
                    warn!(path = %request.path.display(), offset = request.offset, error = %e, "async read failed");
                    dest.clear();
                }
            }
        }
        request.counter.fetch_sub(1, Ordering::SeqCst);
        shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

fn fulfill(shared: &Shared, request: &IoRequest) -> Result<Vec<u8>> {
    if request.size == 0 {
        return Ok(Vec::new());
    }
    let map = mapping(shared, &request.path)?;
    let start = request.offset as usize;
    let end = start
        .checked_add(request.size)
        .filter(|&end| end <= map.len())
        .ok_or(Error::UnexpectedEof(request.offset + request.size as u64))?;
    let bytes = &map[start..end];
    match request.compression {
        Some(flags) => decompress_block(bytes, flags),
        None => Ok(bytes.to_vec()),
    }
}

fn mapping(shared: &Shared, path: &Path) -> Result<Arc<Mmap>> {
    let mut state = shared.state.lock();
    if let Some(map) = state.handles.get(path) {
        return Ok(Arc::clone(map));
    }
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })?;
    // Safety: the mapping is read-only and files are not modified while loading.
    let map = Arc::new(unsafe { Mmap::map(&file) }?);
    debug!(path = %path.display(), size = map.len(), "cached async io handle");
    state.handles.insert(path.to_path_buf(), Arc::clone(&map));
    Ok(map)
}
