use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::canvas::VirtualCanvas;
use crate::config::CompositorConfig;
use crate::coordinator::{FlushCoordinator, FlushId};
use crate::engine::TransferEngine;
use crate::error::{DualFbError, Result};
use crate::format::PixelFormat;
use crate::geometry::DirtyRegion;
use crate::queue::WorkQueue;
use crate::stats::{FlushStats, FlushStatsSnapshot};
use crate::surface::{SurfaceId, SurfaceProvider, SurfaceRegistry};

/// One compositor instance: its surfaces, canvas, transfer engine and flush bookkeeping.
///
/// Dropping it shuts it down the same way [`Compositor::shutdown`] does.
pub struct Compositor {
    config: CompositorConfig,
    coordinator: FlushCoordinator,
    shut_down: AtomicBool,
}

impl Compositor {
    /// Acquires `ids` left to right, allocates a canvas covering them and starts a
    /// [`WorkQueue`] sized by `config`.
    pub fn open(
        config: CompositorConfig,
        provider: &mut dyn SurfaceProvider,
        ids: &[SurfaceId],
        format: PixelFormat,
    ) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(WorkQueue::new(config.workers, config.queue_depth)?);
        Self::with_engine(config, provider, ids, format, engine)
    }

    pub fn with_engine(
        config: CompositorConfig,
        provider: &mut dyn SurfaceProvider,
        ids: &[SurfaceId],
        format: PixelFormat,
        engine: Arc<dyn TransferEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let surfaces = SurfaceRegistry::open_all(provider, ids, format)?;
        let (width, height) = surfaces.virtual_size()?;
        let canvas = VirtualCanvas::allocate(width, height, format, config.buffering)?;

        let coordinator = FlushCoordinator::new(
            Arc::new(canvas),
            Arc::new(surfaces),
            engine,
            Arc::new(FlushStats::new()),
        )
        .with_submit_retries(config.submit_retries)
        .with_geometry_policy(config.geometry_policy);

        tracing::info!(
            surfaces = ids.len(),
            width,
            height,
            ?format,
            buffering = ?config.buffering,
            "compositor ready"
        );
        Ok(Self {
            config,
            coordinator,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn canvas(&self) -> &Arc<VirtualCanvas> {
        self.coordinator.canvas()
    }

    pub fn surfaces(&self) -> &Arc<SurfaceRegistry> {
        self.coordinator.surfaces()
    }

    pub fn coordinator(&self) -> &FlushCoordinator {
        &self.coordinator
    }

    pub fn stats(&self) -> FlushStatsSnapshot {
        self.coordinator.stats().snapshot()
    }

    /// See [`FlushCoordinator::request_flush`].
    pub fn request_flush<F>(&self, dirty: DirtyRegion, completion: F) -> Result<FlushId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(DualFbError::ShutDown);
        }
        self.coordinator.request_flush(dirty, completion)
    }

    /// Makes the other canvas buffer the draw buffer. Returns its index.
    pub fn swap_buffers(&self) -> usize {
        self.canvas().swap()
    }

    pub fn drain(&self) {
        self.coordinator.drain();
    }

    pub fn drain_timeout(&self, timeout: Duration) -> bool {
        self.coordinator.drain_timeout(timeout)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Waits for outstanding flushes, stops the transfer engine and releases every surface.
    ///
    /// Idempotent. Later flush requests fail with [`DualFbError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.coordinator.drain();
        self.coordinator.engine().shutdown();
        self.coordinator.surfaces().close_all();
        tracing::info!(stats = %self.coordinator.stats().to_json(), "compositor shut down");
    }
}

impl core::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Compositor")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
