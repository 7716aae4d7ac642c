use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the flush path.
///
/// Updated from the producer thread and from transfer workers; all updates are relaxed.
#[derive(Debug, Default)]
pub struct FlushStats {
    flushes_requested: AtomicU64,
    flushes_completed: AtomicU64,
    flushes_immediate: AtomicU64,
    flushes_failed: AtomicU64,
    flushes_deferred: AtomicU64,
    callbacks_panicked: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_inline: AtomicU64,
    jobs_failed: AtomicU64,
    submit_retries: AtomicU64,
    regions_clamped: AtomicU64,
    bytes_copied: AtomicU64,
}

impl FlushStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_flushes_requested(&self) {
        self.flushes_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes_completed(&self) {
        self.flushes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Flushes that touched no surface and completed on the caller's thread.
    pub fn inc_flushes_immediate(&self) {
        self.flushes_immediate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes_failed(&self) {
        self.flushes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Flushes held back behind an overlapping flush that was still open.
    pub fn inc_flushes_deferred(&self) {
        self.flushes_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_callbacks_panicked(&self) {
        self.callbacks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Jobs the engine refused that ran synchronously instead.
    pub fn inc_jobs_inline(&self) {
        self.jobs_inline.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submit_retries(&self) {
        self.submit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_regions_clamped(&self) {
        self.regions_clamped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_copied(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlushStatsSnapshot {
        FlushStatsSnapshot {
            flushes_requested: self.flushes_requested.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
            flushes_immediate: self.flushes_immediate.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            flushes_deferred: self.flushes_deferred.load(Ordering::Relaxed),
            callbacks_panicked: self.callbacks_panicked.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_inline: self.jobs_inline.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            submit_retries: self.submit_retries.load(Ordering::Relaxed),
            regions_clamped: self.regions_clamped.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStatsSnapshot {
    pub flushes_requested: u64,
    pub flushes_completed: u64,
    pub flushes_immediate: u64,
    pub flushes_failed: u64,
    pub flushes_deferred: u64,
    pub callbacks_panicked: u64,
    pub jobs_submitted: u64,
    pub jobs_inline: u64,
    pub jobs_failed: u64,
    pub submit_retries: u64,
    pub regions_clamped: u64,
    pub bytes_copied: u64,
}

impl FlushStatsSnapshot {
    pub fn to_json(self) -> String {
        format!(
            "{{\"flushes_requested\":{},\"flushes_completed\":{},\"flushes_immediate\":{},\"flushes_failed\":{},\"flushes_deferred\":{},\"callbacks_panicked\":{},\"jobs_submitted\":{},\"jobs_inline\":{},\"jobs_failed\":{},\"submit_retries\":{},\"regions_clamped\":{},\"bytes_copied\":{}}}",
            self.flushes_requested,
            self.flushes_completed,
            self.flushes_immediate,
            self.flushes_failed,
            self.flushes_deferred,
            self.callbacks_panicked,
            self.jobs_submitted,
            self.jobs_inline,
            self.jobs_failed,
            self.submit_retries,
            self.regions_clamped,
            self.bytes_copied,
        )
    }
}
