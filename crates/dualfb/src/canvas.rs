//! The virtual canvas the producer renders into.
//!
//! Each buffer counts the transfers currently reading it. [`CanvasBuffer::write`] waits for that
//! count to reach zero, which is what keeps the producer from overwriting pixels a transfer has
//! not copied yet. With [`Buffering::Double`] the producer renders into one buffer while the
//! other is being flushed, so the wait is normally free.

use core::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dualfb_blit::TransferJob;

use crate::error::{DualFbError, Result};
use crate::format::PixelFormat;
use crate::geometry::Rect;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Buffering {
    /// One buffer; the producer blocks on drawing until the flush reading it has completed.
    Single,
    /// Two buffers rendered alternately.
    #[default]
    Double,
}

impl Buffering {
    pub const fn buffer_count(self) -> usize {
        match self {
            Buffering::Single => 1,
            Buffering::Double => 2,
        }
    }
}

pub struct CanvasBuffer {
    index: usize,
    pixels: RwLock<Vec<u8>>,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl CanvasBuffer {
    fn allocate(index: usize, len: usize) -> Result<Self> {
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|_| DualFbError::CanvasAllocation { bytes: len })?;
        pixels.resize(len, 0);
        Ok(Self {
            index,
            pixels: RwLock::new(pixels),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive access for rendering. Blocks until no transfer is reading this buffer.
    ///
    /// Drop the guard before requesting a flush of this buffer; transfers take a read lock.
    pub fn write(&self) -> CanvasWriteGuard<'_> {
        self.wait_idle();
        CanvasWriteGuard(self.pixels.write().expect("canvas lock poisoned"))
    }

    pub fn read(&self) -> CanvasReadGuard<'_> {
        CanvasReadGuard(self.pixels.read().expect("canvas lock poisoned"))
    }

    /// Transfers submitted against this buffer that have not finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().expect("canvas lock poisoned")
    }

    pub fn wait_idle(&self) {
        let guard = self.in_flight.lock().expect("canvas lock poisoned");
        let _guard = self
            .idle
            .wait_while(guard, |pending| *pending > 0)
            .expect("canvas lock poisoned");
    }

    pub(crate) fn begin_reads(&self, count: usize) {
        *self.in_flight.lock().expect("canvas lock poisoned") += count;
    }

    pub(crate) fn end_read(&self) {
        let mut pending = self.in_flight.lock().expect("canvas lock poisoned");
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

impl core::fmt::Debug for CanvasBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CanvasBuffer")
            .field("index", &self.index)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

pub struct CanvasWriteGuard<'a>(RwLockWriteGuard<'a, Vec<u8>>);

impl Deref for CanvasWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for CanvasWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

pub struct CanvasReadGuard<'a>(RwLockReadGuard<'a, Vec<u8>>);

impl Deref for CanvasReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug)]
pub struct VirtualCanvas {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    buffering: Buffering,
    buffers: Vec<Arc<CanvasBuffer>>,
    draw_index: AtomicUsize,
}

impl VirtualCanvas {
    /// Allocates `width * height * bpp` bytes per buffer, both buffers or neither.
    pub fn allocate(
        width: u32,
        height: u32,
        format: PixelFormat,
        buffering: Buffering,
    ) -> Result<Self> {
        let stride = (width as usize)
            .checked_mul(format.bytes_per_pixel() as usize)
            .ok_or(DualFbError::CanvasAllocation { bytes: usize::MAX })?;
        let len = stride
            .checked_mul(height as usize)
            .ok_or(DualFbError::CanvasAllocation { bytes: usize::MAX })?;

        let buffers = (0..buffering.buffer_count())
            .map(|index| CanvasBuffer::allocate(index, len).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(width, height, stride, ?buffering, "canvas allocated");
        Ok(Self {
            width,
            height,
            format,
            stride,
            buffering,
            buffers,
            draw_index: AtomicUsize::new(0),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.format.bytes_per_pixel()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn buffering(&self) -> Buffering {
        self.buffering
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    pub fn buffers(&self) -> &[Arc<CanvasBuffer>] {
        &self.buffers
    }

    /// The buffer the producer renders into, and which flushes read from.
    pub fn draw_buffer(&self) -> &Arc<CanvasBuffer> {
        &self.buffers[self.draw_index.load(Ordering::Acquire) % self.buffers.len()]
    }

    /// The buffer most recently handed to the panels. Same as the draw buffer when single-buffered.
    pub fn present_buffer(&self) -> &Arc<CanvasBuffer> {
        let count = self.buffers.len();
        &self.buffers[(self.draw_index.load(Ordering::Acquire) + count - 1) % count]
    }

    /// Moves rendering to the other buffer. Returns the new draw buffer index.
    pub fn swap(&self) -> usize {
        let count = self.buffers.len();
        let next = (self.draw_index.load(Ordering::Acquire) + 1) % count;
        self.draw_index.store(next, Ordering::Release);
        next
    }

    pub fn byte_offset(&self, x: i32, y: i32) -> usize {
        y as usize * self.stride + x as usize * self.bytes_per_pixel() as usize
    }

    /// Fills `rect` of `buffer` with one pixel value.
    pub fn fill_rect(&self, buffer: &CanvasBuffer, rect: Rect, pixel: &[u8]) -> Result<()> {
        self.check_inside(rect)?;
        let bpp = self.bytes_per_pixel() as usize;
        if pixel.len() != bpp {
            return Err(DualFbError::GeometryViolation {
                region: rect,
                width: self.width,
                height: self.height,
            });
        }

        let mut pixels = buffer.write();
        for y in rect.y1..=rect.y2 {
            let start = self.byte_offset(rect.x1, y);
            let row = &mut pixels[start..start + rect.width() as usize * bpp];
            for px in row.chunks_exact_mut(bpp) {
                px.copy_from_slice(pixel);
            }
        }
        Ok(())
    }

    /// Copies `rect` from one buffer to the other, e.g. to carry an area just flushed from the
    /// old draw buffer into the new one after [`VirtualCanvas::swap`].
    pub fn sync_region(&self, from: &CanvasBuffer, to: &CanvasBuffer, rect: Rect) -> Result<()> {
        if from.index() == to.index() {
            return Ok(());
        }
        self.check_inside(rect)?;
        let offset = self.byte_offset(rect.x1, rect.y1);
        let job = TransferJob {
            flush_id: 0,
            src_offset: offset,
            src_stride: self.stride,
            dst_offset: offset,
            dst_stride: self.stride,
            width_px: rect.width(),
            height_px: rect.height(),
            bytes_per_pixel: self.bytes_per_pixel(),
        };
        let src = from.read();
        let mut dst = to.write();
        dualfb_blit::execute(&job, &src, &mut dst)?;
        Ok(())
    }

    fn check_inside(&self, rect: Rect) -> Result<()> {
        if self.bounds().contains(&rect) {
            Ok(())
        } else {
            Err(DualFbError::GeometryViolation {
                region: rect,
                width: self.width,
                height: self.height,
            })
        }
    }
}
