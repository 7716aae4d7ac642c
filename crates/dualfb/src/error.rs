use thiserror::Error;

use crate::config::ConfigError;
use crate::format::PixelFormat;
use crate::geometry::Rect;
use crate::splitter::LayoutError;
use crate::surface::{AcquireError, SurfaceId};

pub type Result<T> = std::result::Result<T, DualFbError>;

#[derive(Debug, Error)]
pub enum DualFbError {
    /// Opening or mapping a physical surface failed. Everything acquired before it has already
    /// been released when this is returned.
    #[error("failed to acquire surface: {0}")]
    ResourceAcquisition(#[from] AcquireError),

    #[error("failed to allocate {bytes}-byte canvas buffer")]
    CanvasAllocation { bytes: usize },

    #[error("surface {surface} uses {actual:?} but the canvas uses {expected:?}")]
    FormatMismatch {
        surface: SurfaceId,
        expected: PixelFormat,
        actual: PixelFormat,
    },

    #[error("invalid surface layout: {0:?}")]
    InvalidLayout(LayoutError),

    #[error("dirty region {region} lies outside the {width}x{height} canvas")]
    GeometryViolation { region: Rect, width: u32, height: u32 },

    #[error("failed to start transfer worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("transfer failed: {0}")]
    Transfer(#[from] dualfb_blit::BlitError),

    #[error("surface {0} is closed")]
    SurfaceClosed(SurfaceId),

    #[error("compositor has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<LayoutError> for DualFbError {
    fn from(err: LayoutError) -> Self {
        DualFbError::InvalidLayout(err)
    }
}
