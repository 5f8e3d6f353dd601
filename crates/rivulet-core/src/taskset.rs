//! Task sets and wake lists.
//!
//! A [`TaskSet`] groups tasks that are woken together, typically the
//! tailers of one append-only stream. Its members may live on several
//! reactors; per reactor the set keeps one [`WakeList`] holding that
//! reactor's members. Waking the set enqueues each list on its own
//! reactor exactly once, no matter how many producers call
//! [`TaskSet::wake`] between two reactor drains.
//!
//! Membership uses shared index cells instead of intrusive links: every
//! member holds an `Arc<WakeSlot>` whose index into the list's dense
//! array is kept current on swap-removal, so detaching a member is O(1)
//! without touching its neighbours.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::error::CoreError;
use crate::queue::Mpmc;
use crate::reactor::{ReactorHandle, TaskHandle};
use crate::task::{Pollable, ReactorId, TaskId};

/// Index value marking a slot that is no longer in any list.
pub const TOMBSTONE: usize = usize::MAX;

/// A dense unordered array with O(1) removal.
///
/// Each entry is paired with a shared index cell. Removal swaps the
/// last entry into the vacated position and updates that entry's cell,
/// so external holders always know where their entry lives.
#[derive(Debug, Default)]
pub struct SwapSlice<T> {
    items: Vec<(T, Arc<AtomicUsize>)>,
}

impl<T> SwapSlice<T> {
    /// Creates an empty slice.
    #[must_use]
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends `item`, recording its position in `cell`.
    pub fn push(&mut self, item: T, cell: Arc<AtomicUsize>) {
        cell.store(self.items.len(), Ordering::Release);
        self.items.push((item, cell));
    }

    /// Removes the entry at `index`, tombstoning its cell. The last
    /// entry takes its place and its cell is updated.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.items.len() {
            return None;
        }
        let (item, cell) = self.items.swap_remove(index);
        cell.store(TOMBSTONE, Ordering::Release);
        if let Some((_, moved)) = self.items.get(index) {
            moved.store(index, Ordering::Release);
        }
        Some(item)
    }

    /// Iterates the entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|(item, _)| item)
    }
}

/// One task's membership in a [`WakeList`].
///
/// Held both by the list (in its dense array) and by the owning task;
/// the task side unlinks on destruction via the shared index cell.
pub struct WakeSlot {
    list: Weak<WakeList>,
    task: TaskId,
    index: Arc<AtomicUsize>,
    /// Stamped just before the member is notified.
    last_wake: Mutex<Option<Instant>>,
}

impl WakeSlot {
    /// The member task.
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// When this member was last notified through the list.
    #[must_use]
    pub fn last_wake(&self) -> Option<Instant> {
        *self.last_wake.lock()
    }

    /// Detaches this membership from its list. Idempotent.
    pub(crate) fn unlink(&self) {
        if let Some(list) = self.list.upgrade() {
            list.remove_slot(self);
        }
    }
}

impl std::fmt::Debug for WakeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeSlot")
            .field("task", &self.task)
            .field("index", &self.index.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Handle to a bare-function wake entry, used to remove it again.
#[derive(Debug)]
pub struct FnSlot {
    index: Arc<AtomicUsize>,
}

/// The per-reactor member list of a task set.
///
/// All members of one list live on the same reactor. Producers on any
/// thread call [`wake`](Self::wake); only the 0→1 transition of
/// `is_waking` enqueues the list on the reactor's wake-list queue, so
/// concurrent wakes coalesce into a single fan-out per reactor cycle.
pub struct WakeList {
    owner: Weak<TaskSetInner>,
    reactor: ReactorId,
    /// The owning reactor's wake-list queue.
    queue: Arc<Mpmc<Arc<WakeList>>>,
    entries: Mutex<SwapSlice<Arc<WakeSlot>>>,
    fns: Mutex<SwapSlice<fn()>>,
    is_waking: AtomicU32,
}

impl WakeList {
    pub(crate) fn new(
        owner: Weak<TaskSetInner>,
        reactor: ReactorId,
        queue: Arc<Mpmc<Arc<WakeList>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner,
            reactor,
            queue,
            entries: Mutex::new(SwapSlice::new()),
            fns: Mutex::new(SwapSlice::new()),
            is_waking: AtomicU32::new(0),
        })
    }

    /// The reactor whose tasks this list holds.
    #[must_use]
    pub fn reactor(&self) -> ReactorId {
        self.reactor
    }

    /// Number of task members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the list has no task members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registers `task` as a member; called on the reactor thread when
    /// the spawn request is drained.
    pub(crate) fn attach(self: &Arc<Self>, task: TaskId) -> Arc<WakeSlot> {
        let index = Arc::new(AtomicUsize::new(TOMBSTONE));
        let slot = Arc::new(WakeSlot {
            list: Arc::downgrade(self),
            task,
            index: Arc::clone(&index),
            last_wake: Mutex::new(None),
        });
        self.entries.lock().push(Arc::clone(&slot), index);
        slot
    }

    /// Registers a bare function called on every fan-out.
    pub fn attach_fn(&self, f: fn()) -> FnSlot {
        let index = Arc::new(AtomicUsize::new(TOMBSTONE));
        self.fns.lock().push(f, Arc::clone(&index));
        FnSlot { index }
    }

    /// Removes a bare-function entry. Idempotent.
    pub fn remove_fn(&self, slot: &FnSlot) {
        let mut fns = self.fns.lock();
        let index = slot.index.load(Ordering::Acquire);
        if index != TOMBSTONE {
            fns.remove(index);
        }
    }

    fn remove_slot(&self, slot: &WakeSlot) {
        let removed = {
            let mut entries = self.entries.lock();
            let index = slot.index.load(Ordering::Acquire);
            index != TOMBSTONE && entries.remove(index).is_some()
        };
        if removed {
            if let Some(owner) = self.owner.upgrade() {
                owner.len.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Signals every member once before the next reactor drain.
    ///
    /// Any thread may call this; calls between two drains coalesce.
    pub fn wake(self: &Arc<Self>) {
        if self.is_waking.fetch_add(1, Ordering::AcqRel) == 0 {
            if self.queue.push(Arc::clone(self)).is_err() {
                // Drop the signal rather than wedge the list; a later
                // wake retries the transition.
                self.is_waking.store(0, Ordering::Release);
                tracing::warn!(reactor = %self.reactor, "wake-list queue full, wake dropped");
            }
        }
    }

    /// Fans the pending wake out: stamps `last_wake` on every member,
    /// passes each task id to `notify`, then runs the function entries.
    /// Called by the owning reactor when it pops the list.
    pub(crate) fn drain<F>(&self, now: Instant, mut notify: F)
    where
        F: FnMut(TaskId),
    {
        self.is_waking.store(0, Ordering::Release);
        {
            let entries = self.entries.lock();
            for slot in entries.iter() {
                *slot.last_wake.lock() = Some(now);
                notify(slot.task);
            }
        }
        let fns = self.fns.lock();
        for f in fns.iter() {
            f();
        }
    }
}

impl std::fmt::Debug for WakeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeList")
            .field("reactor", &self.reactor)
            .field("len", &self.len())
            .field("is_waking", &self.is_waking.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct TaskSetInner {
    closed: AtomicBool,
    len: AtomicUsize,
    lists: Mutex<FxHashMap<ReactorId, Arc<WakeList>>>,
}

/// A group of tasks, possibly spread over several reactors, that wake
/// together.
#[derive(Debug, Clone)]
pub struct TaskSet {
    inner: Arc<TaskSetInner>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    /// Creates an empty, open task set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskSetInner {
                closed: AtomicBool::new(false),
                len: AtomicUsize::new(0),
                lists: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Spawns `pollable` on `reactor` as a member of this set.
    ///
    /// # Errors
    ///
    /// [`CoreError::SetClosed`] after [`close`](Self::close);
    /// [`CoreError::QueueFull`] if the reactor's spawn queue rejects
    /// the request.
    pub fn spawn_on(
        &self,
        reactor: &ReactorHandle,
        pollable: impl Pollable + 'static,
    ) -> Result<TaskHandle, CoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::SetClosed);
        }
        let list = self.list_for(reactor);
        let handle = reactor.spawn_member(Box::new(pollable), list)?;
        self.inner.len.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    /// Wakes every member, at most once per reactor cycle.
    pub fn wake(&self) {
        let lists = self.inner.lists.lock();
        for list in lists.values() {
            list.wake();
        }
    }

    /// The wake list for `reactor`, creating it on first use.
    pub(crate) fn list_for(&self, reactor: &ReactorHandle) -> Arc<WakeList> {
        let mut lists = self.inner.lists.lock();
        Arc::clone(lists.entry(reactor.id()).or_insert_with(|| {
            WakeList::new(
                Arc::downgrade(&self.inner),
                reactor.id(),
                reactor.wake_list_queue(),
            )
        }))
    }

    /// Closes the set: spawns fail from now on, existing members run
    /// until they stop naturally.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live members across all reactors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    /// Returns true if no members remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_list(queue: &Arc<Mpmc<Arc<WakeList>>>) -> Arc<WakeList> {
        WakeList::new(Weak::new(), ReactorId(0), Arc::clone(queue))
    }

    #[test]
    fn swap_slice_tracks_indices() {
        let mut slice: SwapSlice<&str> = SwapSlice::new();
        let a = Arc::new(AtomicUsize::new(TOMBSTONE));
        let b = Arc::new(AtomicUsize::new(TOMBSTONE));
        let c = Arc::new(AtomicUsize::new(TOMBSTONE));
        slice.push("a", Arc::clone(&a));
        slice.push("b", Arc::clone(&b));
        slice.push("c", Arc::clone(&c));

        assert_eq!(slice.remove(a.load(Ordering::Acquire)), Some("a"));
        assert_eq!(a.load(Ordering::Acquire), TOMBSTONE);
        // "c" swapped into position 0.
        assert_eq!(c.load(Ordering::Acquire), 0);
        assert_eq!(b.load(Ordering::Acquire), 1);

        assert_eq!(slice.remove(c.load(Ordering::Acquire)), Some("c"));
        assert_eq!(slice.remove(b.load(Ordering::Acquire)), Some("b"));
        assert!(slice.is_empty());
    }

    #[test]
    fn swap_slice_remove_out_of_range() {
        let mut slice: SwapSlice<u8> = SwapSlice::new();
        assert_eq!(slice.remove(0), None);
        assert_eq!(slice.remove(TOMBSTONE), None);
    }

    #[test]
    fn wake_coalesces_until_drained() {
        let queue: Arc<Mpmc<Arc<WakeList>>> = Arc::new(Mpmc::new(8));
        let list = bare_list(&queue);
        let s1 = list.attach(TaskId(1));
        let _s2 = list.attach(TaskId(2));
        let _s3 = list.attach(TaskId(3));

        list.wake();
        list.wake();
        list.wake();
        assert_eq!(queue.len(), 1, "wakes must coalesce");

        let popped = queue.pop().unwrap();
        let mut woken = Vec::new();
        popped.drain(Instant::now(), |t| woken.push(t));
        assert_eq!(woken, vec![TaskId(1), TaskId(2), TaskId(3)]);
        assert!(s1.last_wake().is_some());

        // A new wake after the drain enqueues again.
        list.wake();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unlink_detaches_member() {
        let queue: Arc<Mpmc<Arc<WakeList>>> = Arc::new(Mpmc::new(8));
        let list = bare_list(&queue);
        let s1 = list.attach(TaskId(1));
        let s2 = list.attach(TaskId(2));
        assert_eq!(list.len(), 2);

        s1.unlink();
        s1.unlink(); // idempotent
        assert_eq!(list.len(), 1);

        list.wake();
        let popped = queue.pop().unwrap();
        let mut woken = Vec::new();
        popped.drain(Instant::now(), |t| woken.push(t));
        assert_eq!(woken, vec![TaskId(2)]);
        s2.unlink();
        assert!(list.is_empty());
    }

    #[test]
    fn fn_entries_run_on_drain() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn bump() {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let queue: Arc<Mpmc<Arc<WakeList>>> = Arc::new(Mpmc::new(8));
        let list = bare_list(&queue);
        let slot = list.attach_fn(bump);

        list.wake();
        queue.pop().unwrap().drain(Instant::now(), |_| {});
        assert_eq!(HITS.load(Ordering::SeqCst), 1);

        list.remove_fn(&slot);
        list.remove_fn(&slot); // idempotent
        list.wake();
        queue.pop().unwrap().drain(Instant::now(), |_| {});
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_set_reports_state() {
        let set = TaskSet::new();
        assert!(!set.is_closed());
        assert!(set.is_empty());
        set.close();
        assert!(set.is_closed());
    }
}
