//! Ordered-commit multi-producer single-consumer ring buffer.
//!
//! Used for reactor invoke queues, where the consumer must observe
//! payloads in producer-enqueue order rather than CAS-success order.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CachePadded, QueueWaker};

/// A bounded MPSC queue with linearised commits.
///
/// Producers reserve a ticket on `tail`, then wait for every earlier
/// ticket to commit before publishing their own, so the single consumer
/// sees strict FIFO across producers without a lock.
///
/// # Safety contract
///
/// Any number of threads may [`push`](Self::push); exactly one thread
/// may [`pop`](Self::pop) / [`pop_each`](Self::pop_each) at a time.
pub struct OrderedMpsc<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Consumer cursor.
    head: CachePadded<AtomicUsize>,
    /// Producer reservation cursor.
    tail: CachePadded<AtomicUsize>,
    /// Highest contiguously published ticket.
    commit: CachePadded<AtomicUsize>,
    waker: Option<QueueWaker>,
}

// SAFETY: slots are owned exclusively by the producer that reserved the
// ticket until commit passes it, then exclusively by the consumer.
unsafe impl<T: Send> Send for OrderedMpsc<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for OrderedMpsc<T> {}

impl<T> OrderedMpsc<T> {
    /// Creates a queue with at least `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Creates a queue with a wake hook fired on every empty →
    /// non-empty transition.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_waker(capacity: usize, waker: QueueWaker) -> Self {
        Self::build(capacity, Some(waker))
    }

    fn build(capacity: usize, waker: Option<QueueWaker>) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();
        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            commit: CachePadded::new(AtomicUsize::new(0)),
            waker,
        }
    }

    /// Returns the capacity of the queue.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns the number of committed items (snapshot).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let commit = self.commit.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        commit.saturating_sub(head)
    }

    /// Returns true if no committed items are pending (snapshot).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if all slots are reserved (snapshot).
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head) >= self.capacity()
    }

    /// Enqueues an item, preserving arrival order across producers.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        // Reserve a ticket, bounded by capacity.
        let begin = loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if tail.saturating_sub(self.head.load(Ordering::Acquire)) >= self.capacity() {
                return Err(item);
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break tail;
            }
        };

        // Linearise: wait for every earlier ticket to commit.
        while self.commit.load(Ordering::Acquire) != begin {
            std::hint::spin_loop();
        }

        // SAFETY: tickets before `begin` have committed and the
        // consumer cannot pass `commit`, so this slot is exclusively
        // ours.
        unsafe {
            (*self.buffer[begin & self.mask].get()).write(item);
        }

        let was_empty = begin == self.head.load(Ordering::Relaxed);
        self.commit.store(begin + 1, Ordering::Release);

        if was_empty {
            if let Some(waker) = &self.waker {
                waker.fire();
            }
        }
        Ok(())
    }

    /// Dequeues one item, or `None` if nothing has committed.
    ///
    /// Must only be called from the single consumer thread.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        if let Some(waker) = &self.waker {
            waker.disarm();
        }
        self.pop_inner()
    }

    fn pop_inner(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.commit.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: committed slots below `commit` are published and only
        // the single consumer advances `head`.
        let item = unsafe { (*self.buffer[head & self.mask].get()).assume_init_read() };
        self.head.store(head + 1, Ordering::Release);
        Some(item)
    }

    /// Dequeues up to `max` items, invoking `f` for each.
    ///
    /// Stops early when the queue empties or `f` returns `false`.
    /// Returns the number of items consumed.
    pub fn pop_each<F>(&self, max: usize, mut f: F) -> usize
    where
        F: FnMut(T) -> bool,
    {
        if let Some(waker) = &self.waker {
            waker.disarm();
        }
        let mut popped = 0;
        while popped < max {
            match self.pop_inner() {
                Some(item) => {
                    popped += 1;
                    if !f(item) {
                        break;
                    }
                }
                None => break,
            }
        }
        popped
    }
}

impl<T> Drop for OrderedMpsc<T> {
    fn drop(&mut self) {
        while self.pop_inner().is_some() {}
    }
}

impl<T> std::fmt::Debug for OrderedMpsc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMpsc")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
