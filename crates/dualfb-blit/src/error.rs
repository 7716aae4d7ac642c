use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlitError {
    #[error("source rectangle ends at byte {end} but the source buffer is {len} bytes")]
    SourceOutOfBounds { end: usize, len: usize },

    #[error("destination rectangle ends at byte {end} but the destination buffer is {len} bytes")]
    DestinationOutOfBounds { end: usize, len: usize },

    #[error("row stride {stride} is shorter than the {row_bytes}-byte row it must hold")]
    StrideTooSmall { stride: usize, row_bytes: usize },

    #[error("integer overflow while computing transfer extents")]
    Overflow,
}
