//! # Bounded lock-free queues
//!
//! The cross-thread mailboxes of the runtime: a multi-producer
//! multi-consumer ring ([`Mpmc`]) and an ordered-commit multi-producer
//! single-consumer ring ([`OrderedMpsc`]).
//!
//! ## Design
//!
//! - Heap-allocated, power-of-2 capacity with bitmask indexing
//! - Per-cell sequence numbers for MPMC coordination
//! - Cache-padded cursors prevent false sharing
//! - Acquire/Release memory ordering throughout; no locks
//! - Optional wake hook fired on the empty → non-empty transition
//!
//! ## Wake hook
//!
//! A queue built with [`Mpmc::with_waker`] (or the MPSC equivalent)
//! notifies its [`QueueWaker`] when an enqueue observes the queue empty.
//! The waker guarantees at most one in-flight notification per
//! transition: the flag is armed with a CAS on the producer side and
//! disarmed at the start of the next consumer batch.

mod mpmc;
mod mpsc;

pub use mpmc::Mpmc;
pub use mpsc::OrderedMpsc;

use std::sync::atomic::{AtomicBool, Ordering};

/// A wrapper that pads a value to a cache line boundary to prevent false
/// sharing.
///
/// False sharing occurs when two threads access different data that
/// happens to reside on the same cache line, causing unnecessary cache
/// invalidations between cores.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Returns a reference to the inner value.
    #[must_use]
    pub const fn get(&self) -> &T {
        &self.value
    }

    /// Consumes the wrapper and returns the inner value.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: Default> Default for CachePadded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePadded")
            .field("value", &self.value)
            .finish()
    }
}

/// Edge-triggered notification hook attached to a queue.
///
/// Producers fire the hook when their enqueue moved the queue from
/// empty to non-empty; the consumer disarms it at the start of each
/// drain batch. Between a fire and the matching disarm, further fires
/// are suppressed, so a reactor blocked on its wake channel receives at
/// most one signal per transition.
pub struct QueueWaker {
    armed: AtomicBool,
    notify: Box<dyn Fn() + Send + Sync>,
}

impl QueueWaker {
    /// Creates a waker that invokes `notify` on each empty → non-empty
    /// transition. `notify` must not block; the intended payload is a
    /// non-blocking channel send.
    #[must_use]
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            armed: AtomicBool::new(false),
            notify: Box::new(notify),
        }
    }

    /// Fires the notification if it is not already in flight.
    pub(crate) fn fire(&self) {
        if self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            (self.notify)();
        }
    }

    /// Disarms the hook so the next transition can fire again.
    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for QueueWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWaker")
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn cache_padded_is_a_full_line() {
        assert!(std::mem::size_of::<CachePadded<u8>>() >= 64);
        assert_eq!(std::mem::align_of::<CachePadded<u8>>(), 64);
    }

    #[test]
    fn cache_padded_deref() {
        let mut padded = CachePadded::new(7usize);
        assert_eq!(*padded, 7);
        *padded = 9;
        assert_eq!(padded.into_inner(), 9);
    }

    #[test]
    fn waker_fires_once_until_disarmed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let waker = QueueWaker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        waker.fire();
        waker.fire();
        waker.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        waker.disarm();
        waker.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
