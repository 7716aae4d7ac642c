use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

use crate::engine::{SubmitError, TransferEngine, WorkItem};
use crate::error::{DualFbError, Result};

/// A bounded queue drained by a fixed pool of transfer worker threads.
///
/// Submission never blocks: a full queue is reported as [`SubmitError::QueueFull`].
#[derive(Debug)]
pub struct WorkQueue {
    sender: async_channel::Sender<WorkItem>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkQueue {
    pub fn new(workers: usize, depth: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = async_channel::bounded::<WorkItem>(depth.max(1));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("dualfb-xfer-{index}"))
                .spawn(move || worker_loop(index, receiver));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    sender.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(DualFbError::WorkerSpawn(err));
                }
            }
        }

        tracing::info!(workers, depth, "transfer work queue started");
        Ok(Self {
            sender,
            workers: Mutex::new(handles),
            worker_count: workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Items accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Runs items until the queue is closed and empty. A panicking item is logged and skipped so the
/// items queued behind it still run.
fn worker_loop(index: usize, receiver: async_channel::Receiver<WorkItem>) {
    while let Ok(item) = receiver.recv_blocking() {
        let flush_id = item.transfer().job().flush_id;
        tracing::trace!(worker = index, flush_id, "transfer started");
        if catch_unwind(AssertUnwindSafe(|| item.run())).is_err() {
            tracing::error!(worker = index, flush_id, "transfer item panicked");
        }
    }
    tracing::debug!(worker = index, "transfer worker exiting");
}

impl TransferEngine for WorkQueue {
    fn submit(&self, item: WorkItem) -> std::result::Result<(), SubmitError> {
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(item)) => Err(SubmitError::QueueFull(item)),
            Err(async_channel::TrySendError::Closed(item)) => Err(SubmitError::Closed(item)),
        }
    }

    /// Closes the queue; workers finish everything already queued before exiting.
    fn shutdown(&self) {
        self.sender.close();
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("transfer worker panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
