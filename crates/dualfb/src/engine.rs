//! The seam between the flush coordinator and whatever actually moves the bytes.
//!
//! A [`TransferEngine`] accepts [`WorkItem`]s and runs each exactly once, on any thread and in any
//! order, delivering the result through the item's completion. The worker pool in
//! [`crate::WorkQueue`] is one engine; a hardware 2D-DMA driver would be another, taking the
//! [`Transfer`] apart with [`WorkItem::into_parts`] and firing the completion from its interrupt
//! path.

use core::fmt;
use std::sync::Arc;

use dualfb_blit::TransferJob;
use thiserror::Error;

use crate::canvas::CanvasBuffer;
use crate::error::Result;
use crate::surface::PhysicalSurface;

/// A [`TransferJob`] bound to the buffers it reads and writes.
pub struct Transfer {
    job: TransferJob,
    source: Arc<CanvasBuffer>,
    dest: Arc<PhysicalSurface>,
}

impl Transfer {
    pub fn new(job: TransferJob, source: Arc<CanvasBuffer>, dest: Arc<PhysicalSurface>) -> Self {
        Self { job, source, dest }
    }

    pub fn job(&self) -> &TransferJob {
        &self.job
    }

    pub fn source(&self) -> &Arc<CanvasBuffer> {
        &self.source
    }

    pub fn dest(&self) -> &Arc<PhysicalSurface> {
        &self.dest
    }

    /// Copies the rectangle synchronously. Returns the number of bytes written.
    pub fn execute(&self) -> Result<usize> {
        let src = self.source.read();
        let written = self
            .dest
            .with_bytes_mut(|dst| dualfb_blit::execute(&self.job, &src, dst))??;
        Ok(written)
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("job", &self.job)
            .field("source", &self.source.index())
            .field("dest", self.dest.id())
            .finish()
    }
}

pub type TransferCompletion = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// A transfer plus the notification to deliver once it has finished.
pub struct WorkItem {
    transfer: Transfer,
    completion: TransferCompletion,
}

impl WorkItem {
    pub fn new(
        transfer: Transfer,
        completion: impl FnOnce(Result<usize>) + Send + 'static,
    ) -> Self {
        Self {
            transfer,
            completion: Box::new(completion),
        }
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    /// Executes the transfer on the current thread and delivers its completion.
    pub fn run(self) {
        let result = self.transfer.execute();
        (self.completion)(result);
    }

    pub fn into_parts(self) -> (Transfer, TransferCompletion) {
        (self.transfer, self.completion)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

/// A rejected submission. The item is handed back unrun so it can be retried or run inline.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transfer queue is full")]
    QueueFull(WorkItem),

    #[error("transfer engine is shut down")]
    Closed(WorkItem),
}

impl SubmitError {
    pub fn into_item(self) -> WorkItem {
        match self {
            SubmitError::QueueFull(item) | SubmitError::Closed(item) => item,
        }
    }
}

pub trait TransferEngine: Send + Sync {
    /// Accepts `item` for asynchronous execution. An accepted item is run exactly once.
    fn submit(&self, item: WorkItem) -> std::result::Result<(), SubmitError>;

    /// Stops accepting work and waits for accepted items to finish.
    fn shutdown(&self) {}
}

/// Runs every item on the submitting thread before `submit` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineEngine;

impl TransferEngine for InlineEngine {
    fn submit(&self, item: WorkItem) -> std::result::Result<(), SubmitError> {
        item.run();
        Ok(())
    }
}
