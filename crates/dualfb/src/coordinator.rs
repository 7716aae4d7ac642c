//! Turns a dirty region into transfer jobs and reports the flush complete exactly once.
//!
//! Each flush is split into one job per surface it touches. The jobs are handed to a
//! [`TransferEngine`] and may finish on any thread, in any order. A [`FlushJoin`] counts them
//! down; whichever job arrives last runs the completion callback. A flush that touches no
//! surface completes on the caller's thread before [`FlushCoordinator::request_flush`] returns.
//!
//! Flushes whose regions overlap are applied in request order: a flush that overlaps one still
//! open is held back and dispatched by the last of its predecessors to finish, so an older frame
//! can never land on top of a newer one.

use core::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dualfb_blit::TransferJob;
use dualfb_shared::{Arrival, FlushJoin};

use crate::canvas::{CanvasBuffer, VirtualCanvas};
use crate::config::GeometryPolicy;
use crate::engine::{SubmitError, Transfer, TransferEngine, WorkItem};
use crate::error::{DualFbError, Result};
use crate::geometry::{DirtyRegion, Rect};
use crate::splitter::{split, SubRegion, SurfaceSpan};
use crate::stats::FlushStats;
use crate::surface::{SurfaceId, SurfaceRegistry};

const RETRY_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlushId(pub u64);

impl fmt::Display for FlushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type FlushCompletion = Box<dyn FnOnce() + Send + 'static>;

/// Flushes accepted and not yet completed.
#[derive(Debug, Default)]
struct OpenFlushes {
    count: Mutex<usize>,
    drained: Condvar,
}

impl OpenFlushes {
    fn begin(&self) {
        *self.count.lock().expect("flush counter poisoned") += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().expect("flush counter poisoned");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn count(&self) -> usize {
        *self.count.lock().expect("flush counter poisoned")
    }

    fn wait(&self) {
        let count = self.count.lock().expect("flush counter poisoned");
        let _count = self
            .drained
            .wait_while(count, |open| *open > 0)
            .expect("flush counter poisoned");
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let count = self.count.lock().expect("flush counter poisoned");
        let (_count, result) = self
            .drained
            .wait_timeout_while(count, timeout, |open| *open > 0)
            .expect("flush counter poisoned");
        !result.timed_out()
    }
}

/// An open flush and the later flushes waiting for it.
struct OrderEntry {
    id: FlushId,
    region: Rect,
    dependents: Vec<Arc<FlushOperation>>,
}

/// Everything a flush needs after `request_flush` has returned.
struct Dispatcher {
    engine: Arc<dyn TransferEngine>,
    stats: Arc<FlushStats>,
    open: OpenFlushes,
    order: Mutex<Vec<OrderEntry>>,
    submit_retries: AtomicU32,
}

impl Dispatcher {
    /// Records `operation` as open. Returns `true` if no open flush overlaps it, in which case
    /// the caller dispatches it; otherwise it is dispatched by [`Dispatcher::release`].
    fn register(&self, operation: &Arc<FlushOperation>) -> bool {
        let mut order = self.order.lock().expect("flush order poisoned");
        let mut blockers = 0;
        for entry in order.iter_mut() {
            if entry.region.intersect(&operation.region).is_some() {
                entry.dependents.push(operation.clone());
                blockers += 1;
            }
        }
        operation.blockers.store(blockers, Ordering::Relaxed);
        order.push(OrderEntry {
            id: operation.id,
            region: operation.region,
            dependents: Vec::new(),
        });
        blockers == 0
    }

    /// Forgets `id` and returns the flushes it was the last thing holding back.
    fn release(&self, id: FlushId) -> Vec<Arc<FlushOperation>> {
        let mut order = self.order.lock().expect("flush order poisoned");
        let Some(position) = order.iter().position(|entry| entry.id == id) else {
            return Vec::new();
        };
        order
            .remove(position)
            .dependents
            .into_iter()
            .filter(|dependent| dependent.blockers.fetch_sub(1, Ordering::Relaxed) == 1)
            .collect()
    }

    /// Hands `item` to the engine. A full queue is retried with backoff; once retries run out,
    /// or if the engine is closed, the job runs on this thread.
    fn submit(&self, id: FlushId, mut item: WorkItem) {
        let retries = self.submit_retries.load(Ordering::Relaxed);
        let mut attempt = 0u32;
        loop {
            match self.engine.submit(item) {
                Ok(()) => {
                    self.stats.inc_jobs_submitted();
                    return;
                }
                Err(SubmitError::QueueFull(rejected)) if attempt < retries => {
                    attempt += 1;
                    self.stats.inc_submit_retries();
                    tracing::trace!(flush_id = %id, attempt, "transfer queue full, retrying");
                    thread::sleep(RETRY_BACKOFF * (1 << attempt.min(6)));
                    item = rejected;
                }
                Err(err) => {
                    tracing::warn!(flush_id = %id, "{err}; running transfer on the caller thread");
                    self.stats.inc_jobs_inline();
                    err.into_item().run();
                    return;
                }
            }
        }
    }
}

/// State shared by the jobs of one flush.
struct FlushOperation {
    id: FlushId,
    region: Rect,
    join: FlushJoin,
    transfers: Mutex<Vec<Transfer>>,
    /// Overlapping flushes that must finish first. Only changed under the dispatcher's order lock.
    blockers: AtomicUsize,
    completion: Mutex<Option<FlushCompletion>>,
    source: Arc<CanvasBuffer>,
    failed: AtomicBool,
    started: Instant,
    dispatcher: Arc<Dispatcher>,
}

impl FlushOperation {
    fn dispatch(self: &Arc<Self>) {
        let transfers = std::mem::take(&mut *self.transfers.lock().expect("flush jobs poisoned"));
        for transfer in transfers {
            let operation = self.clone();
            let surface = transfer.dest().id().clone();
            let item =
                WorkItem::new(transfer, move |result| operation.job_finished(&surface, result));
            self.dispatcher.submit(self.id, item);
        }
    }

    fn job_finished(&self, surface: &SurfaceId, result: Result<usize>) {
        let stats = &self.dispatcher.stats;
        match result {
            Ok(bytes) => {
                stats.add_bytes_copied(bytes as u64);
                tracing::trace!(flush_id = %self.id, %surface, bytes, "transfer done");
            }
            Err(err) => {
                self.failed.store(true, Ordering::Relaxed);
                stats.inc_jobs_failed();
                tracing::error!(flush_id = %self.id, %surface, "transfer failed: {err}");
            }
        }
        self.source.end_read();

        match self.join.arrive() {
            Arrival::Pending(remaining) => {
                tracing::trace!(flush_id = %self.id, remaining, "waiting for transfers");
            }
            Arrival::Last => self.finish(),
            Arrival::Overrun => {
                tracing::error!(flush_id = %self.id, "transfer completion delivered twice");
            }
        }
    }

    fn finish(&self) {
        let failed = self.failed.load(Ordering::Relaxed);
        let stats = &self.dispatcher.stats;
        if failed {
            stats.inc_flushes_failed();
        }
        stats.inc_flushes_completed();
        tracing::debug!(
            flush_id = %self.id,
            failed,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "flush complete"
        );

        let completion = self
            .completion
            .lock()
            .expect("flush completion poisoned")
            .take();
        if let Some(completion) = completion {
            if catch_unwind(AssertUnwindSafe(completion)).is_err() {
                stats.inc_callbacks_panicked();
                tracing::error!(flush_id = %self.id, "flush completion callback panicked");
            }
        }

        for ready in self.dispatcher.release(self.id) {
            tracing::trace!(flush_id = %ready.id, after = %self.id, "dispatching held flush");
            ready.dispatch();
        }
        self.dispatcher.open.end();
    }
}

/// Splits dirty regions of the canvas's draw buffer across the surfaces and drives the copies.
pub struct FlushCoordinator {
    canvas: Arc<VirtualCanvas>,
    surfaces: Arc<SurfaceRegistry>,
    spans: Vec<SurfaceSpan>,
    dispatcher: Arc<Dispatcher>,
    next_id: AtomicU64,
    geometry_policy: GeometryPolicy,
}

impl FlushCoordinator {
    pub fn new(
        canvas: Arc<VirtualCanvas>,
        surfaces: Arc<SurfaceRegistry>,
        engine: Arc<dyn TransferEngine>,
        stats: Arc<FlushStats>,
    ) -> Self {
        let spans = surfaces.spans();
        Self {
            canvas,
            surfaces,
            spans,
            dispatcher: Arc::new(Dispatcher {
                engine,
                stats,
                open: OpenFlushes::default(),
                order: Mutex::new(Vec::new()),
                submit_retries: AtomicU32::new(3),
            }),
            next_id: AtomicU64::new(1),
            geometry_policy: GeometryPolicy::default(),
        }
    }

    pub fn with_submit_retries(self, retries: u32) -> Self {
        self.dispatcher
            .submit_retries
            .store(retries, Ordering::Relaxed);
        self
    }

    pub fn with_geometry_policy(mut self, policy: GeometryPolicy) -> Self {
        self.geometry_policy = policy;
        self
    }

    pub fn canvas(&self) -> &Arc<VirtualCanvas> {
        &self.canvas
    }

    pub fn surfaces(&self) -> &Arc<SurfaceRegistry> {
        &self.surfaces
    }

    pub fn stats(&self) -> &Arc<FlushStats> {
        &self.dispatcher.stats
    }

    pub fn engine(&self) -> &Arc<dyn TransferEngine> {
        &self.dispatcher.engine
    }

    /// Copies `dirty` from the current draw buffer to every surface it overlaps.
    ///
    /// `completion` runs exactly once, after the last copy has finished: on a transfer thread,
    /// or on this thread before returning when the region touches no surface. It runs even if a
    /// copy failed; failures are logged and counted in [`FlushStats`]. An `Err` return means the
    /// flush was rejected and `completion` will never run.
    ///
    /// Never blocks on earlier flushes. If one that overlaps `dirty` is still open, this flush's
    /// copies are queued once it finishes.
    pub fn request_flush<F>(&self, dirty: DirtyRegion, completion: F) -> Result<FlushId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = FlushId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stats = &self.dispatcher.stats;
        stats.inc_flushes_requested();

        let region = self.normalize(id, dirty)?;
        let parts = match region {
            Some(region) => split(region, &self.spans),
            None => Vec::new(),
        };
        let Some(region) = region.filter(|_| !parts.is_empty()) else {
            tracing::trace!(flush_id = %id, %dirty, "flush touches no surface");
            stats.inc_flushes_immediate();
            completion();
            stats.inc_flushes_completed();
            return Ok(id);
        };

        let source = self.canvas.draw_buffer().clone();
        let transfers: Vec<Transfer> = parts
            .iter()
            .map(|part| self.build_transfer(id, &source, part))
            .collect();

        tracing::debug!(flush_id = %id, %dirty, jobs = transfers.len(), buffer = source.index(), "flush requested");
        let jobs = transfers.len();
        let operation = Arc::new(FlushOperation {
            id,
            region,
            join: FlushJoin::new(jobs),
            transfers: Mutex::new(transfers),
            blockers: AtomicUsize::new(0),
            completion: Mutex::new(Some(Box::new(completion))),
            source: source.clone(),
            failed: AtomicBool::new(false),
            started: Instant::now(),
            dispatcher: self.dispatcher.clone(),
        });
        self.dispatcher.open.begin();
        source.begin_reads(jobs);

        if self.dispatcher.register(&operation) {
            operation.dispatch();
        } else {
            stats.inc_flushes_deferred();
            tracing::debug!(flush_id = %id, "held behind an overlapping flush");
        }
        Ok(id)
    }

    /// Blocks until every accepted flush has run its completion.
    pub fn drain(&self) {
        self.dispatcher.open.wait();
    }

    /// Like [`FlushCoordinator::drain`], giving up after `timeout`. Returns whether it drained.
    pub fn drain_timeout(&self, timeout: Duration) -> bool {
        self.dispatcher.open.wait_timeout(timeout)
    }

    pub fn open_flushes(&self) -> usize {
        self.dispatcher.open.count()
    }

    fn normalize(&self, id: FlushId, dirty: DirtyRegion) -> Result<Option<Rect>> {
        if dirty.is_empty() {
            return Ok(None);
        }
        let bounds = self.canvas.bounds();
        if bounds.contains(&dirty) {
            return Ok(Some(dirty));
        }

        match self.geometry_policy {
            GeometryPolicy::Strict => {
                tracing::error!(flush_id = %id, %dirty, "dirty region outside canvas {bounds}");
                Err(DualFbError::GeometryViolation {
                    region: dirty,
                    width: self.canvas.width(),
                    height: self.canvas.height(),
                })
            }
            GeometryPolicy::Clamp => {
                let clamped = dirty.intersect(&bounds);
                self.dispatcher.stats.inc_regions_clamped();
                tracing::warn!(flush_id = %id, %dirty, clamped = ?clamped, "dirty region clamped to canvas");
                Ok(clamped)
            }
        }
    }

    fn build_transfer(&self, id: FlushId, source: &Arc<CanvasBuffer>, part: &SubRegion) -> Transfer {
        let surface = &self.surfaces.surfaces()[part.surface_index];
        let bpp = self.canvas.bytes_per_pixel();
        let job = TransferJob {
            flush_id: id.0,
            src_offset: self.canvas.byte_offset(part.global.x1, part.global.y1),
            src_stride: self.canvas.stride(),
            dst_offset: part.local.y1 as usize * surface.stride()
                + part.local.x1 as usize * bpp as usize,
            dst_stride: surface.stride(),
            width_px: part.global.width(),
            height_px: part.global.height(),
            bytes_per_pixel: bpp,
        };
        Transfer::new(job, source.clone(), surface.clone())
    }
}

impl fmt::Debug for FlushCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushCoordinator")
            .field("spans", &self.spans)
            .field("open_flushes", &self.open_flushes())
            .field(
                "submit_retries",
                &self.dispatcher.submit_retries.load(Ordering::Relaxed),
            )
            .field("geometry_policy", &self.geometry_policy)
            .finish_non_exhaustive()
    }
}
