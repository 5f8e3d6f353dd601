//! Bounded multi-producer multi-consumer ring buffer.
//!
//! Vyukov-style: every cell carries a sequence number that encodes which
//! round of the ring it belongs to, so producers and consumers
//! coordinate with a single CAS each and never touch a lock.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{CachePadded, QueueWaker};

/// One ring cell: a sequence word plus the payload slot.
struct Cell<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded lock-free MPMC queue.
///
/// Any number of producers may [`push`](Self::push) and any number of
/// consumers may [`pop`](Self::pop) concurrently. Capacity is rounded
/// up to the next power of two.
///
/// # Algorithm
///
/// A producer at ticket `t` owns cell `t & mask` once the cell's
/// sequence equals `t`; after writing it publishes `seq = t + 1`. A
/// consumer at ticket `h` waits for `seq == h + 1` and, after reading,
/// publishes `seq = h + mask + 1` — the cell's ticket for the next
/// round. A lagging sequence means the ring is full (producer) or
/// empty (consumer); a leading one means another thread raced and the
/// cursor must be reloaded.
pub struct Mpmc<T> {
    buffer: Box<[Cell<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    waker: Option<QueueWaker>,
}

// SAFETY: cells are handed off between threads through the seq
// protocol; a cell's payload is only touched by the single thread that
// won the CAS for its ticket.
unsafe impl<T: Send> Send for Mpmc<T> {}
// SAFETY: see above; &Mpmc only exposes the ticket-guarded operations.
unsafe impl<T: Send> Sync for Mpmc<T> {}

impl<T> Mpmc<T> {
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

        let buffer: Vec<Cell<T>> = (0..capacity)
            .map(|i| Cell {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            waker,
        }
    }

    /// Returns the capacity of the queue.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns the current number of items.
    ///
    /// A snapshot; may be stale by the time it returns.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    /// Returns true if the queue is empty (snapshot).
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the queue is full (snapshot).
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Enqueues an item.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;

            if dif == 0 {
                // Cell is free for this round; claim the ticket.
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let was_empty = pos == self.head.load(Ordering::Relaxed);
                        // SAFETY: winning the CAS gives exclusive write
                        // access to this cell until seq is published.
                        unsafe {
                            (*cell.value.get()).write(item);
                        }
                        cell.seq.store(pos + 1, Ordering::Release);
                        if was_empty {
                            if let Some(waker) = &self.waker {
                                waker.fire();
                            }
                        }
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                // Cell still holds last round's payload: full.
                return Err(item);
            } else {
                // Another producer raced past us; reload.
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueues an item, retrying with exponential back-off yields
    /// until it succeeds or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue stayed full for the whole
    /// timeout window.
    pub fn push_timeout(&self, mut item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut spins = 1u32;
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    if Instant::now() >= deadline {
                        return Err(back);
                    }
                    item = back;
                    for _ in 0..spins {
                        std::thread::yield_now();
                    }
                    spins = (spins * 2).min(64);
                }
            }
        }
    }

    /// Dequeues one item, or `None` if the queue is empty.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        if let Some(waker) = &self.waker {
            waker.disarm();
        }
        self.pop_inner()
    }

    fn pop_inner(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let dif = seq as isize - (pos + 1) as isize;

            if dif == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS gives exclusive read
                        // access; the producer published the payload
                        // before storing seq = pos + 1.
                        let item = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.seq.store(pos + self.mask + 1, Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues up to `max` items, invoking `f` for each.
    ///
    /// Stops early when the queue empties or `f` returns `false`.
    /// Returns the number of items consumed. Disarms the wake hook at
    /// the start of the batch so the next enqueue can signal again.
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

impl<T> Drop for Mpmc<T> {
    fn drop(&mut self) {
        while self.pop_inner().is_some() {}
    }
}

impl<T> std::fmt::Debug for Mpmc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpmc")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_roundtrip() {
        let q: Mpmc<u32> = Mpmc::new(4);
        assert_eq!(q.capacity(), 4);
        assert!(q.is_empty());

        for i in 0..4 {
            assert!(q.push(i).is_ok());
        }
        assert!(q.is_full());
        assert_eq!(q.push(99), Err(99));

        for i in 0..4 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wraps_around_many_rounds() {
        let q: Mpmc<usize> = Mpmc::new(8);
        for round in 0..100 {
            for i in 0..5 {
                q.push(round * 10 + i).unwrap();
            }
            for i in 0..5 {
                assert_eq!(q.pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn pop_each_batches() {
        let q: Mpmc<u32> = Mpmc::new(16);
        for i in 0..10 {
            q.push(i).unwrap();
        }
        let mut seen = Vec::new();
        let n = q.pop_each(6, |v| {
            seen.push(v);
            true
        });
        assert_eq!(n, 6);
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn pop_each_early_stop() {
        let q: Mpmc<u32> = Mpmc::new(16);
        for i in 0..10 {
            q.push(i).unwrap();
        }
        let n = q.pop_each(100, |v| v < 3);
        assert_eq!(n, 4); // 0,1,2 continue; 3 stops the batch
        assert_eq!(q.len(), 6);
    }

    #[test]
    fn push_timeout_gives_up() {
        let q: Mpmc<u8> = Mpmc::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        let res = q.push_timeout(3, Duration::from_millis(20));
        assert_eq!(res, Err(3));
    }

    #[test]
    fn wake_fires_on_empty_transition_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let q: Mpmc<u32> = Mpmc::with_waker(
            8,
            QueueWaker::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Draining disarms; the next transition fires again.
        q.pop_each(10, |_| true);
        q.push(4).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_releases_remaining_items() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        #[derive(Debug)]
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let q: Mpmc<Counted> = Mpmc::new(8);
            for _ in 0..5 {
                q.push(Counted).unwrap();
            }
            drop(q.pop());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }

    /// 8 producers x 1000 ids each through a capacity-4 ring, 2
    /// consumers; the dequeued multiset equals the enqueued multiset.
    #[test]
    fn multiset_preserved_under_contention() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 1000;

        let q = Arc::new(Mpmc::<usize>::new(4));
        let consumed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                let consumed = Arc::clone(&consumed);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut local = Vec::new();
                    loop {
                        match q.pop() {
                            Some(v) => local.push(v),
                            None => {
                                if done.load(Ordering::Acquire) == PRODUCERS && q.is_empty() {
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                    }
                    consumed.lock().extend(local);
                })
            })
            .collect();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let q = Arc::clone(&q);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        while q.push(id).is_err() {
                            thread::yield_now();
                        }
                    }
                    done.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        let consumed = consumed.lock();
        assert_eq!(consumed.len(), PRODUCERS * PER_PRODUCER);
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for &id in consumed.iter() {
            *counts.entry(id).or_default() += 1;
        }
        for id in 0..PRODUCERS {
            assert_eq!(counts[&id], PER_PRODUCER, "producer {id} lost items");
        }
    }
}
