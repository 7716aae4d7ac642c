use crate::{BlitError, TransferJob};

/// Copies `job` from `src` into `dst`, one row at a time.
///
/// The job is validated against both buffers first, so a failing job leaves `dst` untouched.
/// Returns the number of payload bytes written.
pub fn execute(job: &TransferJob, src: &[u8], dst: &mut [u8]) -> Result<usize, BlitError> {
    job.validate(src.len(), dst.len())?;
    if job.is_empty() {
        return Ok(0);
    }

    let row_bytes = job.row_bytes()?;

    // Contiguous on both sides: one copy covers every row.
    if job.src_stride == row_bytes && job.dst_stride == row_bytes {
        let len = job.byte_count()?;
        dst[job.dst_offset..job.dst_offset + len]
            .copy_from_slice(&src[job.src_offset..job.src_offset + len]);
        return Ok(len);
    }

    let mut src_row = job.src_offset;
    let mut dst_row = job.dst_offset;
    for _ in 0..job.height_px {
        dst[dst_row..dst_row + row_bytes].copy_from_slice(&src[src_row..src_row + row_bytes]);
        src_row += job.src_stride;
        dst_row += job.dst_stride;
    }

    Ok(row_bytes * job.height_px as usize)
}
