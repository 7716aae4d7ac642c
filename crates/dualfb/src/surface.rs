//! Physical surfaces: acquisition from a provider, geometry, and release.
//!
//! A [`SurfaceProvider`] stands in for whatever opens and maps display memory (a framebuffer
//! device, a DMA-able carve-out, or a heap buffer in tests). The [`SurfaceRegistry`] places the
//! surfaces it returns left to right on the virtual canvas and owns them until they are closed.

use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::error::{DualFbError, Result};
use crate::format::PixelFormat;
use crate::geometry::Rect;
use crate::splitter::{validate_layout, SurfaceSpan};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SurfaceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SurfaceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Mapped display memory. Dropping it unmaps/releases the memory.
pub trait SurfaceMemory: Send {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl SurfaceMemory for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// What a provider reports for an acquired surface.
pub struct SurfaceMapping {
    pub memory: Box<dyn SurfaceMemory>,
    /// Row pitch in bytes.
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AcquireStage {
    Open,
    GeometryQuery,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("cannot open {surface}: {reason}")]
    Open { surface: SurfaceId, reason: String },

    #[error("cannot query geometry of {surface}: {reason}")]
    GeometryQuery { surface: SurfaceId, reason: String },

    #[error("cannot map {surface}: {reason}")]
    Map { surface: SurfaceId, reason: String },
}

impl AcquireError {
    pub fn new(stage: AcquireStage, surface: SurfaceId, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match stage {
            AcquireStage::Open => AcquireError::Open { surface, reason },
            AcquireStage::GeometryQuery => AcquireError::GeometryQuery { surface, reason },
            AcquireStage::Map => AcquireError::Map { surface, reason },
        }
    }

    pub fn stage(&self) -> AcquireStage {
        match self {
            AcquireError::Open { .. } => AcquireStage::Open,
            AcquireError::GeometryQuery { .. } => AcquireStage::GeometryQuery,
            AcquireError::Map { .. } => AcquireStage::Map,
        }
    }

    pub fn surface(&self) -> &SurfaceId {
        match self {
            AcquireError::Open { surface, .. }
            | AcquireError::GeometryQuery { surface, .. }
            | AcquireError::Map { surface, .. } => surface,
        }
    }
}

pub trait SurfaceProvider {
    fn acquire(&mut self, id: &SurfaceId) -> std::result::Result<SurfaceMapping, AcquireError>;
}

/// One display surface placed on the virtual canvas.
///
/// Geometry is fixed at acquisition; only the pixel content changes. The memory lives behind a
/// mutex so transfers from any worker can write it, and so [`PhysicalSurface::close`] waits for a
/// copy in progress before releasing it.
pub struct PhysicalSurface {
    id: SurfaceId,
    stride: usize,
    byte_length: usize,
    width: u32,
    height: u32,
    origin_x: u32,
    format: PixelFormat,
    memory: Mutex<Option<Box<dyn SurfaceMemory>>>,
}

impl PhysicalSurface {
    fn from_mapping(
        id: SurfaceId,
        mapping: SurfaceMapping,
        origin_x: u32,
    ) -> std::result::Result<Self, AcquireError> {
        let byte_length = mapping.memory.bytes().len();
        let row_bytes = mapping.width as usize * mapping.format.bytes_per_pixel() as usize;
        if mapping.stride < row_bytes {
            return Err(AcquireError::GeometryQuery {
                surface: id,
                reason: format!(
                    "stride {} is shorter than a {}-pixel row ({row_bytes} bytes)",
                    mapping.stride, mapping.width
                ),
            });
        }
        let required = mapping.stride.checked_mul(mapping.height as usize);
        if required.map_or(true, |required| required > byte_length) {
            return Err(AcquireError::GeometryQuery {
                surface: id,
                reason: format!(
                    "{byte_length}-byte mapping cannot hold {} rows of {} bytes",
                    mapping.height, mapping.stride
                ),
            });
        }

        Ok(Self {
            id,
            stride: mapping.stride,
            byte_length,
            width: mapping.width,
            height: mapping.height,
            origin_x,
            format: mapping.format,
            memory: Mutex::new(Some(mapping.memory)),
        })
    }

    pub fn id(&self) -> &SurfaceId {
        &self.id
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Offset of this surface's first column within the virtual canvas.
    pub fn origin_x(&self) -> u32 {
        self.origin_x
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn span(&self) -> SurfaceSpan {
        SurfaceSpan {
            origin_x: self.origin_x,
            width: self.width,
            height: self.height,
        }
    }

    pub fn is_open(&self) -> bool {
        self.memory
            .lock()
            .expect("surface lock poisoned")
            .is_some()
    }

    /// Releases the mapped memory. Safe to call any number of times; returns `true` only for the
    /// call that actually released it.
    pub fn close(&self) -> bool {
        let released = self.memory.lock().expect("surface lock poisoned").take();
        match released {
            Some(memory) => {
                drop(memory);
                tracing::debug!(surface = %self.id, "surface released");
                true
            }
            None => false,
        }
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self.memory.lock().expect("surface lock poisoned");
        match guard.as_mut() {
            Some(memory) => Ok(f(memory.bytes_mut())),
            None => Err(DualFbError::SurfaceClosed(self.id.clone())),
        }
    }

    /// Copies `rect` (surface-local, must lie inside the surface) into a tightly packed buffer.
    pub fn read_rect(&self, rect: Rect) -> Result<Vec<u8>> {
        let bounds = Rect::from_size(self.width, self.height);
        if !bounds.contains(&rect) {
            return Err(DualFbError::GeometryViolation {
                region: rect,
                width: self.width,
                height: self.height,
            });
        }

        let bpp = self.format.bytes_per_pixel() as usize;
        let row_bytes = rect.width() as usize * bpp;
        let mut out = Vec::with_capacity(row_bytes * rect.height() as usize);
        let guard = self.memory.lock().expect("surface lock poisoned");
        let memory = guard
            .as_ref()
            .ok_or_else(|| DualFbError::SurfaceClosed(self.id.clone()))?;
        let bytes = memory.bytes();
        for y in rect.y1..=rect.y2 {
            let start = y as usize * self.stride + rect.x1 as usize * bpp;
            out.extend_from_slice(&bytes[start..start + row_bytes]);
        }
        Ok(out)
    }

    /// The visible pixels of the whole surface, packed.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.read_rect(Rect::from_size(self.width, self.height))
    }
}

impl fmt::Debug for PhysicalSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalSurface")
            .field("id", &self.id)
            .field("origin_x", &self.origin_x)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("byte_length", &self.byte_length)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Owns the physical surfaces of one compositor, in left-to-right order.
#[derive(Debug)]
pub struct SurfaceRegistry {
    format: PixelFormat,
    surfaces: Vec<Arc<PhysicalSurface>>,
}

impl SurfaceRegistry {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            surfaces: Vec::new(),
        }
    }

    /// Acquires every surface in `ids`, placing them left to right.
    ///
    /// On failure every surface acquired so far is released before the error is returned.
    pub fn open_all(
        provider: &mut dyn SurfaceProvider,
        ids: &[SurfaceId],
        format: PixelFormat,
    ) -> Result<Self> {
        let mut registry = Self::new(format);
        for id in ids {
            if let Err(err) = registry.open(provider, id.clone()) {
                tracing::error!(surface = %id, "surface acquisition failed: {err}");
                registry.close_all();
                return Err(err);
            }
        }
        validate_layout(&registry.spans())?;
        Ok(registry)
    }

    /// Acquires one surface and places it to the right of those already open.
    pub fn open(
        &mut self,
        provider: &mut dyn SurfaceProvider,
        id: SurfaceId,
    ) -> Result<Arc<PhysicalSurface>> {
        let origin_x = self.next_origin()?;
        let mapping = provider.acquire(&id)?;
        if mapping.format != self.format {
            return Err(DualFbError::FormatMismatch {
                surface: id,
                expected: self.format,
                actual: mapping.format,
            });
        }

        let surface = Arc::new(PhysicalSurface::from_mapping(id, mapping, origin_x)?);
        tracing::info!(
            surface = %surface.id(),
            origin_x,
            width = surface.width(),
            height = surface.height(),
            stride = surface.stride(),
            "surface acquired"
        );
        self.surfaces.push(surface.clone());
        Ok(surface)
    }

    fn next_origin(&self) -> Result<u32> {
        let mut origin = 0u32;
        for surface in &self.surfaces {
            origin = origin
                .checked_add(surface.width())
                .ok_or(DualFbError::InvalidLayout(crate::splitter::LayoutError::Overflow))?;
        }
        Ok(origin)
    }

    /// Releases every surface. Idempotent, and safe on a partially opened registry.
    pub fn close_all(&self) {
        for surface in &self.surfaces {
            surface.close();
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn surfaces(&self) -> &[Arc<PhysicalSurface>] {
        &self.surfaces
    }

    pub fn get(&self, index: usize) -> Option<&Arc<PhysicalSurface>> {
        self.surfaces.get(index)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn spans(&self) -> Vec<SurfaceSpan> {
        self.surfaces.iter().map(|s| s.span()).collect()
    }

    /// `(width, height)` of the virtual canvas covering every surface.
    pub fn virtual_size(&self) -> Result<(u32, u32)> {
        Ok(validate_layout(&self.spans())?)
    }
}

impl Drop for SurfaceRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[derive(Clone, Debug)]
struct HeapPanel {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride_padding: usize,
}

/// Surfaces backed by zeroed heap memory.
///
/// Used headless and in tests. Individual surfaces can be told to fail at a given acquisition
/// stage, and [`HeapSurfaceProvider::live_mappings`] counts mappings that have not been released.
#[derive(Debug, Default)]
pub struct HeapSurfaceProvider {
    panels: HashMap<SurfaceId, HeapPanel>,
    failures: HashMap<SurfaceId, AcquireStage>,
    live: Arc<AtomicUsize>,
}

impl HeapSurfaceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_panel(
        mut self,
        id: impl Into<SurfaceId>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        self.panels.insert(
            id.into(),
            HeapPanel {
                width,
                height,
                format,
                stride_padding: 0,
            },
        );
        self
    }

    /// Adds `bytes` of padding to the end of every row of `id`.
    pub fn with_stride_padding(mut self, id: impl Into<SurfaceId>, bytes: usize) -> Self {
        if let Some(panel) = self.panels.get_mut(&id.into()) {
            panel.stride_padding = bytes;
        }
        self
    }

    pub fn fail_at(mut self, id: impl Into<SurfaceId>, stage: AcquireStage) -> Self {
        self.failures.insert(id.into(), stage);
        self
    }

    /// Mappings handed out and not yet released.
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// A counter that stays readable after the provider itself is dropped.
    pub fn live_counter(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }
}

impl SurfaceProvider for HeapSurfaceProvider {
    fn acquire(&mut self, id: &SurfaceId) -> std::result::Result<SurfaceMapping, AcquireError> {
        let fail = self.failures.get(id).copied();
        if fail == Some(AcquireStage::Open) {
            return Err(AcquireError::new(AcquireStage::Open, id.clone(), "injected failure"));
        }
        let panel = self
            .panels
            .get(id)
            .cloned()
            .ok_or_else(|| AcquireError::new(AcquireStage::Open, id.clone(), "no such surface"))?;

        if fail == Some(AcquireStage::GeometryQuery) {
            return Err(AcquireError::new(
                AcquireStage::GeometryQuery,
                id.clone(),
                "injected failure",
            ));
        }
        let stride = panel.width as usize * panel.format.bytes_per_pixel() as usize
            + panel.stride_padding;
        let len = stride * panel.height as usize;

        if fail == Some(AcquireStage::Map) {
            return Err(AcquireError::new(AcquireStage::Map, id.clone(), "injected failure"));
        }
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|err| AcquireError::new(AcquireStage::Map, id.clone(), err.to_string()))?;
        bytes.resize(len, 0);

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(SurfaceMapping {
            memory: Box::new(HeapMemory {
                bytes,
                live: self.live.clone(),
            }),
            stride,
            width: panel.width,
            height: panel.height,
            format: panel.format,
        })
    }
}

struct HeapMemory {
    bytes: Vec<u8>,
    live: Arc<AtomicUsize>,
}

impl SurfaceMemory for HeapMemory {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HeapSurfaceProvider {
        HeapSurfaceProvider::new()
            .with_panel("/dev/fb0", 64, 32, PixelFormat::Xrgb8888)
            .with_panel("/dev/fb1", 48, 40, PixelFormat::Xrgb8888)
    }

    fn ids() -> Vec<SurfaceId> {
        vec!["/dev/fb0".into(), "/dev/fb1".into()]
    }

    #[test]
    fn surfaces_are_placed_left_to_right() {
        let mut provider = provider().with_stride_padding("/dev/fb1", 16);
        let registry =
            SurfaceRegistry::open_all(&mut provider, &ids(), PixelFormat::Xrgb8888).unwrap();

        assert_eq!(registry.len(), 2);
        let right = registry.get(1).unwrap();
        assert_eq!(right.origin_x(), 64);
        assert_eq!(right.stride(), 48 * 4 + 16);
        assert_eq!(right.byte_length(), (48 * 4 + 16) * 40);
        assert_eq!(registry.virtual_size().unwrap(), (112, 40));
        assert_eq!(provider.live_mappings(), 2);
    }

    #[test]
    fn failed_acquisition_releases_earlier_surfaces() {
        for stage in [AcquireStage::Open, AcquireStage::GeometryQuery, AcquireStage::Map] {
            let mut provider = provider().fail_at("/dev/fb1", stage);
            let err = SurfaceRegistry::open_all(&mut provider, &ids(), PixelFormat::Xrgb8888)
                .unwrap_err();

            match err {
                DualFbError::ResourceAcquisition(err) => {
                    assert_eq!(err.stage(), stage);
                    assert_eq!(err.surface().as_str(), "/dev/fb1");
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert_eq!(provider.live_mappings(), 0, "stage {stage:?}");
        }
    }

    #[test]
    fn unknown_surface_fails_to_open() {
        let mut provider = provider();
        let err = SurfaceRegistry::open_all(
            &mut provider,
            &["/dev/fb9".into()],
            PixelFormat::Xrgb8888,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DualFbError::ResourceAcquisition(AcquireError::Open { .. })
        ));
    }

    #[test]
    fn format_mismatch_is_rejected_and_released() {
        let mut provider = provider().with_panel("/dev/fb1", 48, 40, PixelFormat::Rgb565);
        let err = SurfaceRegistry::open_all(&mut provider, &ids(), PixelFormat::Xrgb8888)
            .unwrap_err();
        assert!(matches!(err, DualFbError::FormatMismatch { .. }));
        assert_eq!(provider.live_mappings(), 0);
    }

    #[test]
    fn short_mapping_is_a_geometry_failure() {
        struct Short;
        impl SurfaceProvider for Short {
            fn acquire(
                &mut self,
                _id: &SurfaceId,
            ) -> std::result::Result<SurfaceMapping, AcquireError> {
                Ok(SurfaceMapping {
                    memory: Box::new(vec![0u8; 100]),
                    stride: 40,
                    width: 10,
                    height: 3,
                    format: PixelFormat::Xrgb8888,
                })
            }
        }

        let mut registry = SurfaceRegistry::new(PixelFormat::Xrgb8888);
        let err = registry.open(&mut Short, "short".into()).unwrap_err();
        assert!(matches!(
            err,
            DualFbError::ResourceAcquisition(AcquireError::GeometryQuery { .. })
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let mut provider = provider();
        let registry =
            SurfaceRegistry::open_all(&mut provider, &ids(), PixelFormat::Xrgb8888).unwrap();
        let left = registry.get(0).unwrap().clone();

        assert!(left.close());
        assert!(!left.close());
        assert!(!left.is_open());
        assert_eq!(provider.live_mappings(), 1);

        registry.close_all();
        registry.close_all();
        assert_eq!(provider.live_mappings(), 0);
        assert!(matches!(
            left.snapshot(),
            Err(DualFbError::SurfaceClosed(_))
        ));
    }

    #[test]
    fn dropping_the_registry_releases_everything() {
        let mut provider = provider();
        {
            let _registry =
                SurfaceRegistry::open_all(&mut provider, &ids(), PixelFormat::Xrgb8888).unwrap();
            assert_eq!(provider.live_mappings(), 2);
        }
        assert_eq!(provider.live_mappings(), 0);
    }

    #[test]
    fn read_rect_respects_stride() {
        let mut provider = provider().with_stride_padding("/dev/fb0", 8);
        let registry =
            SurfaceRegistry::open_all(&mut provider, &ids(), PixelFormat::Xrgb8888).unwrap();
        let left = registry.get(0).unwrap();

        left.with_bytes_mut(|bytes| {
            let stride = 64 * 4 + 8;
            bytes[stride + 4..stride + 8].copy_from_slice(&[1, 2, 3, 4]);
        })
        .unwrap();

        assert_eq!(left.read_rect(Rect::new(1, 1, 1, 1)).unwrap(), vec![1, 2, 3, 4]);
        assert!(left.read_rect(Rect::new(0, 0, 64, 0)).is_err());
    }
}
