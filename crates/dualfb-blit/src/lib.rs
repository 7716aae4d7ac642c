//! Rectangular byte-copy jobs between buffers with independent row pitches.
//!
//! A [`TransferJob`] names a sub-rectangle by byte offset, row stride and pixel extent in both a
//! source and a destination buffer. [`execute`] validates the whole job against the two buffers
//! before touching any byte, then copies it row by row.

#![forbid(unsafe_code)]

mod error;
mod executor;
mod job;

pub use error::BlitError;
pub use executor::execute;
pub use job::TransferJob;
