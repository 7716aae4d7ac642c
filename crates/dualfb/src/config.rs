use thiserror::Error;

use crate::canvas::Buffering;
use crate::format::PixelFormat;
use crate::surface::{HeapSurfaceProvider, SurfaceId};

pub const ENV_WORKERS: &str = "DUALFB_WORKERS";
pub const ENV_QUEUE_DEPTH: &str = "DUALFB_QUEUE_DEPTH";
pub const ENV_SUBMIT_RETRIES: &str = "DUALFB_SUBMIT_RETRIES";
pub const ENV_BUFFERING: &str = "DUALFB_BUFFERING";
pub const ENV_GEOMETRY_POLICY: &str = "DUALFB_GEOMETRY_POLICY";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// What to do with a dirty region that extends past the canvas.
///
/// Defaults to [`GeometryPolicy::Strict`] in debug builds and [`GeometryPolicy::Clamp`] in
/// release builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryPolicy {
    /// Intersect with the canvas and log a warning.
    Clamp,
    /// Reject the flush with [`crate::DualFbError::GeometryViolation`].
    Strict,
}

impl Default for GeometryPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            GeometryPolicy::Strict
        } else {
            GeometryPolicy::Clamp
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositorConfig {
    /// Transfer worker threads.
    pub workers: usize,
    /// Transfers that may wait in the queue before submission reports it full.
    pub queue_depth: usize,
    /// Submission attempts on a full queue before a transfer runs on the caller's thread.
    pub submit_retries: u32,
    pub buffering: Buffering,
    pub geometry_policy: GeometryPolicy,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_depth: 8,
            submit_retries: 3,
            buffering: Buffering::Double,
            geometry_policy: GeometryPolicy::default(),
        }
    }
}

impl CompositorConfig {
    /// Defaults overridden by any `DUALFB_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_WORKERS) {
            config.workers = parse_number(ENV_WORKERS, &value)?;
        }
        if let Some(value) = lookup(ENV_QUEUE_DEPTH) {
            config.queue_depth = parse_number(ENV_QUEUE_DEPTH, &value)?;
        }
        if let Some(value) = lookup(ENV_SUBMIT_RETRIES) {
            config.submit_retries = parse_number(ENV_SUBMIT_RETRIES, &value)?;
        }
        if let Some(value) = lookup(ENV_BUFFERING) {
            config.buffering = match value.trim().to_ascii_lowercase().as_str() {
                "single" => Buffering::Single,
                "double" => Buffering::Double,
                _ => return Err(invalid(ENV_BUFFERING, &value)),
            };
        }
        if let Some(value) = lookup(ENV_GEOMETRY_POLICY) {
            config.geometry_policy = match value.trim().to_ascii_lowercase().as_str() {
                "clamp" => GeometryPolicy::Clamp,
                "strict" => GeometryPolicy::Strict,
                _ => return Err(invalid(ENV_GEOMETRY_POLICY, &value)),
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Zero("queue_depth"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(var, value))
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    }
}

/// Two identical panels side by side, left panel at virtual x = 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualPanelLayout {
    pub left: SurfaceId,
    pub right: SurfaceId,
    pub panel_width: u32,
    pub panel_height: u32,
    pub format: PixelFormat,
}

impl Default for DualPanelLayout {
    fn default() -> Self {
        Self {
            left: SurfaceId::new("/dev/fb0"),
            right: SurfaceId::new("/dev/fb1"),
            panel_width: 960,
            panel_height: 720,
            format: PixelFormat::Xrgb8888,
        }
    }
}

impl DualPanelLayout {
    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        vec![self.left.clone(), self.right.clone()]
    }

    pub fn virtual_size(&self) -> (u32, u32) {
        (self.panel_width * 2, self.panel_height)
    }

    /// Heap-backed stand-ins for both panels.
    pub fn heap_provider(&self) -> HeapSurfaceProvider {
        HeapSurfaceProvider::new()
            .with_panel(self.left.clone(), self.panel_width, self.panel_height, self.format)
            .with_panel(self.right.clone(), self.panel_width, self.panel_height, self.format)
    }
}
