//! A virtual canvas spread across several physical display surfaces.
//!
//! The producer renders into a [`VirtualCanvas`] whose width is the sum of the surface widths.
//! When part of it changes, [`Compositor::request_flush`] splits the dirty region at surface
//! boundaries, copies each piece to its surface on a transfer thread, and calls the producer back
//! once, after the last piece has landed.
//!
//! ```no_run
//! use dualfb::{Compositor, CompositorConfig, DualPanelLayout, Rect};
//!
//! let layout = DualPanelLayout::default();
//! let mut provider = layout.heap_provider();
//! let compositor = Compositor::open(
//!     CompositorConfig::default(),
//!     &mut provider,
//!     &layout.surface_ids(),
//!     layout.format,
//! )?;
//!
//! let canvas = compositor.canvas();
//! canvas.fill_rect(canvas.draw_buffer(), Rect::new(900, 10, 1020, 20), &[0xff, 0, 0, 0])?;
//! compositor.request_flush(Rect::new(900, 10, 1020, 20), || println!("flushed"))?;
//! compositor.shutdown();
//! # Ok::<(), dualfb::DualFbError>(())
//! ```

#![forbid(unsafe_code)]

mod canvas;
mod compositor;
mod config;
mod coordinator;
mod engine;
mod error;
mod format;
mod geometry;
mod queue;
mod splitter;
mod stats;
mod surface;

pub use canvas::{Buffering, CanvasBuffer, CanvasReadGuard, CanvasWriteGuard, VirtualCanvas};
pub use compositor::Compositor;
pub use config::{
    CompositorConfig, ConfigError, DualPanelLayout, GeometryPolicy, ENV_BUFFERING,
    ENV_GEOMETRY_POLICY, ENV_QUEUE_DEPTH, ENV_SUBMIT_RETRIES, ENV_WORKERS,
};
pub use coordinator::{FlushCoordinator, FlushId};
pub use engine::{InlineEngine, SubmitError, Transfer, TransferCompletion, TransferEngine, WorkItem};
pub use error::{DualFbError, Result};
pub use format::PixelFormat;
pub use geometry::{DirtyRegion, Rect};
pub use queue::WorkQueue;
pub use splitter::{split, validate_layout, LayoutError, SubRegion, SurfaceSpan};
pub use stats::{FlushStats, FlushStatsSnapshot};
pub use surface::{
    AcquireError, AcquireStage, HeapSurfaceProvider, PhysicalSurface, SurfaceId, SurfaceMapping,
    SurfaceMemory, SurfaceProvider, SurfaceRegistry,
};

pub use dualfb_blit::{BlitError, TransferJob};
