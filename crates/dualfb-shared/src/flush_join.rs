//! Fan-out/fan-in join counter for a single flush operation.
//!
//! A flush fans out into one transfer per touched surface. Each transfer calls
//! [`FlushJoin::arrive`] once when its bytes have landed; exactly one of those calls observes
//! [`Arrival::Last`], no matter how many workers race or in which order they finish.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicUsize;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicUsize;

use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Other participants are still outstanding; carries the remaining count.
    Pending(usize),
    /// This arrival brought the count to zero. Only ever returned once.
    Last,
    /// The join had already completed. Indicates a participant arrived twice.
    Overrun,
}

#[derive(Debug)]
pub struct FlushJoin {
    remaining: AtomicUsize,
}

impl FlushJoin {
    pub fn new(participants: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(participants),
        }
    }

    /// Records one participant as finished.
    ///
    /// Uses acquire/release ordering so the participant observing [`Arrival::Last`] also observes
    /// every write made by the participants that arrived before it.
    pub fn arrive(&self) -> Arrival {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Arrival::Overrun;
            }

            match self.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(1) => return Arrival::Last,
                Ok(prev) => return Arrival::Pending(prev - 1),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}
