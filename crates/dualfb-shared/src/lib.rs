//! Lock-free state shared between the flush producer and transfer workers.

#![forbid(unsafe_code)]

mod flush_join;

pub use flush_join::{Arrival, FlushJoin};
