use crate::BlitError;

/// One rectangular copy from a source buffer into a destination buffer.
///
/// Offsets address the top-left pixel of the rectangle in each buffer. Strides are the distance in
/// bytes between the starts of consecutive rows and may differ between the two sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferJob {
    /// Flush operation this job belongs to.
    pub flush_id: u64,
    pub src_offset: usize,
    pub src_stride: usize,
    pub dst_offset: usize,
    pub dst_stride: usize,
    pub width_px: u32,
    pub height_px: u32,
    pub bytes_per_pixel: u32,
}

impl TransferJob {
    pub fn is_empty(&self) -> bool {
        self.width_px == 0 || self.height_px == 0
    }

    /// Bytes copied per row.
    pub fn row_bytes(&self) -> Result<usize, BlitError> {
        (self.width_px as usize)
            .checked_mul(self.bytes_per_pixel as usize)
            .ok_or(BlitError::Overflow)
    }

    /// Total payload in bytes (excluding row padding).
    pub fn byte_count(&self) -> Result<usize, BlitError> {
        self.row_bytes()?
            .checked_mul(self.height_px as usize)
            .ok_or(BlitError::Overflow)
    }

    /// One past the last source byte read.
    pub fn src_end(&self) -> Result<usize, BlitError> {
        self.end(self.src_offset, self.src_stride)
    }

    /// One past the last destination byte written.
    pub fn dst_end(&self) -> Result<usize, BlitError> {
        self.end(self.dst_offset, self.dst_stride)
    }

    fn end(&self, offset: usize, stride: usize) -> Result<usize, BlitError> {
        if self.is_empty() {
            return Ok(offset);
        }
        let row_bytes = self.row_bytes()?;
        (self.height_px as usize - 1)
            .checked_mul(stride)
            .and_then(|v| v.checked_add(offset))
            .and_then(|v| v.checked_add(row_bytes))
            .ok_or(BlitError::Overflow)
    }

    /// Checks the job against the lengths of the buffers it will be executed on.
    pub fn validate(&self, src_len: usize, dst_len: usize) -> Result<(), BlitError> {
        if self.is_empty() {
            return Ok(());
        }

        let row_bytes = self.row_bytes()?;
        // Rows would overlap each other; only a single row may ignore the stride.
        if self.height_px > 1 {
            for stride in [self.src_stride, self.dst_stride] {
                if stride < row_bytes {
                    return Err(BlitError::StrideTooSmall { stride, row_bytes });
                }
            }
        }

        let src_end = self.src_end()?;
        if src_end > src_len {
            return Err(BlitError::SourceOutOfBounds {
                end: src_end,
                len: src_len,
            });
        }
        let dst_end = self.dst_end()?;
        if dst_end > dst_len {
            return Err(BlitError::DestinationOutOfBounds {
                end: dst_end,
                len: dst_len,
            });
        }
        Ok(())
    }
}
