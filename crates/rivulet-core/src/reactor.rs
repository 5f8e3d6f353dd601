//! The reactor: a single-threaded cooperative task executor.
//!
//! Each reactor owns its tasks and timer wheel outright; nothing it
//! owns is shared, so polls run without locks. Other threads reach a
//! reactor only through its bounded queues, and the reactor sleeps on a
//! wake channel that receives [`Signal::Tick`] from the shared ticker
//! and [`Signal::Poke`] from the queues' wake hooks.
//!
//! One cycle: receive a signal (or time out after one tick), process
//! any due ticks oldest-first, then drain the queues in fixed priority
//! — wake lists, invokes, wakes, spawns. A cycle that takes longer than
//! one tick bumps the skew counter and reports it; work is never
//! dropped, ticks are caught up in order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::blocking::BlockingPool;
use crate::error::CoreError;
use crate::queue::{Mpmc, OrderedMpsc, QueueWaker};
use crate::task::{CloseReason, PollContext, PollReason, Pollable, ReactorId, Task, TaskError, TaskId};
use crate::taskset::WakeList;
use crate::wheel::{TimerDecision, TimerWheel, WheelLevelConfig};

/// Items drained from each queue per cycle.
const DRAIN_BATCH: usize = 128;

/// What arrives on a reactor's wake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// An absolute tick number from the shared ticker.
    Tick(u64),
    /// A queue became non-empty; drain without advancing time.
    Poke,
}

/// Reactor construction parameters.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Thread and log name.
    pub name: String,
    /// Timer wheel levels; the first level's tick is the reactor's
    /// base tick and must match the ticker cadence.
    pub wheel_levels: Vec<WheelLevelConfig>,
    /// Invoke queue capacity (rounded up to a power of two).
    pub invoke_capacity: usize,
    /// Wake queue capacity.
    pub wake_capacity: usize,
    /// Spawn queue capacity.
    pub spawn_capacity: usize,
    /// Wake-list queue capacity.
    pub wake_list_capacity: usize,
    /// Wake channel depth.
    pub wake_channel_capacity: usize,
    /// CPU to pin the reactor thread to, if any.
    pub pin_cpu: Option<usize>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            name: "reactor".into(),
            wheel_levels: TimerWheel::<TimerKey>::default_levels(),
            invoke_capacity: 1024,
            wake_capacity: 1024,
            spawn_capacity: 256,
            wake_list_capacity: 256,
            wake_channel_capacity: 64,
            pin_cpu: None,
        }
    }
}

/// Wheel payload: the task plus the generation of the request that
/// scheduled the entry. A mismatched generation means the entry is
/// stale and is dropped when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerKey {
    task: TaskId,
    gen: u32,
}

pub(crate) type InvokeFn = Box<dyn FnOnce(&mut Core) + Send>;

struct SpawnRequest {
    id: TaskId,
    stop: Arc<AtomicBool>,
    pollable: Box<dyn Pollable>,
    interval: Option<Duration>,
    list: Option<Arc<WakeList>>,
}

/// Live counters, updated by the reactor thread and read from anywhere.
#[derive(Debug, Default)]
struct StatsInner {
    polls: AtomicU64,
    spawned: AtomicU64,
    destroyed: AtomicU64,
    ticks: AtomicU64,
    missed_ticks: AtomicU64,
    invokes: AtomicU64,
    skew: AtomicU64,
    tasks: AtomicUsize,
}

/// Snapshot of a reactor's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactorStats {
    /// Total task polls, any reason.
    pub polls: u64,
    /// Tasks created.
    pub spawned: u64,
    /// Tasks destroyed.
    pub destroyed: u64,
    /// Ticks processed (including caught-up ones).
    pub ticks: u64,
    /// Ticks that arrived late and were caught up.
    pub missed_ticks: u64,
    /// Invoke closures executed.
    pub invokes: u64,
    /// Cycles whose wall time exceeded one tick.
    pub skew: u64,
    /// Currently live tasks.
    pub tasks: usize,
}

struct ReactorShared {
    id: ReactorId,
    name: String,
    next_task: AtomicU64,
    /// Accepts spawns and invokes while true.
    accepting: AtomicBool,
    /// Tells the reactor thread to exit.
    shutdown: AtomicBool,
    /// True while the reactor thread is inside its loop.
    running: AtomicBool,
    wake_tx: SyncSender<Signal>,
    wake_lists: Arc<Mpmc<Arc<WakeList>>>,
    invokes: OrderedMpsc<InvokeFn>,
    wakes: Mpmc<TaskId>,
    spawns: Mpmc<SpawnRequest>,
    blocking: OnceLock<Arc<BlockingPool>>,
    stats: StatsInner,
}

/// Cloneable front door to a reactor; safe to use from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// This reactor's id.
    #[must_use]
    pub fn id(&self) -> ReactorId {
        self.shared.id
    }

    /// This reactor's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True while the reactor thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Snapshot of the reactor's counters.
    #[must_use]
    pub fn stats(&self) -> ReactorStats {
        let s = &self.shared.stats;
        ReactorStats {
            polls: s.polls.load(Ordering::Relaxed),
            spawned: s.spawned.load(Ordering::Relaxed),
            destroyed: s.destroyed.load(Ordering::Relaxed),
            ticks: s.ticks.load(Ordering::Relaxed),
            missed_ticks: s.missed_ticks.load(Ordering::Relaxed),
            invokes: s.invokes.load(Ordering::Relaxed),
            skew: s.skew.load(Ordering::Relaxed),
            tasks: s.tasks.load(Ordering::Relaxed),
        }
    }

    /// Spawns a task on this reactor.
    ///
    /// The task is created and first polled with [`PollReason::Start`]
    /// on the reactor thread; the returned handle is valid immediately.
    ///
    /// # Errors
    ///
    /// [`CoreError::ReactorStopped`] after shutdown,
    /// [`CoreError::QueueFull`] if the spawn queue is full.
    pub fn spawn(&self, pollable: impl Pollable + 'static) -> Result<TaskHandle, CoreError> {
        self.spawn_inner(Box::new(pollable), None, None)
    }

    /// Spawns a task with a repeating interval already set.
    ///
    /// # Errors
    ///
    /// Same as [`spawn`](Self::spawn).
    pub fn spawn_interval(
        &self,
        pollable: impl Pollable + 'static,
        interval: Duration,
    ) -> Result<TaskHandle, CoreError> {
        self.spawn_inner(Box::new(pollable), Some(interval), None)
    }

    pub(crate) fn spawn_member(
        &self,
        pollable: Box<dyn Pollable>,
        list: Arc<WakeList>,
    ) -> Result<TaskHandle, CoreError> {
        self.spawn_inner(pollable, None, Some(list))
    }

    fn spawn_inner(
        &self,
        pollable: Box<dyn Pollable>,
        interval: Option<Duration>,
        list: Option<Arc<WakeList>>,
    ) -> Result<TaskHandle, CoreError> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(CoreError::ReactorStopped);
        }
        let id = TaskId(self.shared.next_task.fetch_add(1, Ordering::AcqRel));
        let stop = Arc::new(AtomicBool::new(false));
        let request = SpawnRequest {
            id,
            stop: Arc::clone(&stop),
            pollable,
            interval,
            list,
        };
        self.shared
            .spawns
            .push(request)
            .map_err(|_| CoreError::QueueFull)?;
        Ok(TaskHandle {
            handle: self.clone(),
            task: id,
            stop,
        })
    }

    /// Requests a wake poll for `task`. Wakes arriving within one
    /// reactor cycle coalesce into a single poll. Returns false if the
    /// wake queue is full.
    pub fn wake(&self, task: TaskId) -> bool {
        self.shared.wakes.push(task).is_ok()
    }

    /// Schedules a one-shot wake for `task` roughly `delay` from now,
    /// replacing any pending timed wake. Returns false if the invoke
    /// queue rejects the request.
    pub fn wake_after(&self, task: TaskId, delay: Duration) -> bool {
        self.invoke_core(Box::new(move |core| core.schedule_timed_wake(task, delay)))
    }

    /// Polls `task` once with [`PollReason::Ping`]. Returns false if
    /// the invoke queue rejects the request.
    pub fn ping(&self, task: TaskId) -> bool {
        self.invoke_core(Box::new(move |core| {
            let now = Instant::now();
            core.poll_task(task, PollReason::Ping, None, now);
        }))
    }

    /// Runs `f` on the reactor thread. Closures from one producer
    /// thread execute in submission order. Returns false if the
    /// reactor is stopped or the invoke queue is full.
    pub fn invoke(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.invoke_core(Box::new(move |_core| f()))
    }

    pub(crate) fn invoke_core(&self, f: InvokeFn) -> bool {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return false;
        }
        self.shared.invokes.push(f).is_ok()
    }

    /// Ships `f` to the runtime's blocking pool. Returns false if no
    /// pool is attached or the pool rejected the job.
    pub fn invoke_blocking(&self, f: impl FnOnce() + Send + 'static) -> bool {
        match self.shared.blocking.get() {
            Some(pool) => pool.spawn(f),
            None => false,
        }
    }

    pub(crate) fn attach_blocking_pool(&self, pool: Arc<BlockingPool>) {
        let _ = self.shared.blocking.set(pool);
    }

    pub(crate) fn wake_list_queue(&self) -> Arc<Mpmc<Arc<WakeList>>> {
        Arc::clone(&self.shared.wake_lists)
    }

    pub(crate) fn wake_sender(&self) -> SyncSender<Signal> {
        self.shared.wake_tx.clone()
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

/// Handle to one spawned task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    handle: ReactorHandle,
    task: TaskId,
    stop: Arc<AtomicBool>,
}

impl TaskHandle {
    /// The task's id.
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The reactor the task runs on.
    #[must_use]
    pub fn reactor(&self) -> ReactorId {
        self.handle.id()
    }

    /// Requests a wake poll; coalesces with other wakes in the same
    /// cycle.
    pub fn wake(&self) -> bool {
        self.handle.wake(self.task)
    }

    /// Schedules a one-shot wake `delay` from now, replacing any
    /// pending timed wake.
    pub fn wake_after(&self, delay: Duration) -> bool {
        self.handle.wake_after(self.task, delay)
    }

    /// Flags the task to stop; it is destroyed at its next poll
    /// opportunity.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.handle.wake(self.task);
    }
}

/// The reactor's thread-local state; only ever touched by the reactor
/// thread (or by tests driving cycles by hand).
pub(crate) struct Core {
    shared: Arc<ReactorShared>,
    wake_rx: Receiver<Signal>,
    wheel: TimerWheel<TimerKey>,
    tasks: FxHashMap<TaskId, Task>,
    tick: Duration,
    last_tick: u64,
    cycle: u64,
    pin_cpu: Option<usize>,
}

impl Core {
    pub(crate) fn schedule_timed_wake(&mut self, id: TaskId, delay: Duration) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.wake_gen = task.wake_gen.wrapping_add(1);
            let key = TimerKey {
                task: id,
                gen: task.wake_gen,
            };
            self.wheel.schedule(key, delay, true);
        }
    }

    fn on_tick(&mut self, tick_no: u64, now: Instant) {
        if tick_no <= self.last_tick {
            return;
        }
        let missed = tick_no - self.last_tick - 1;
        if missed > 0 {
            self.shared
                .stats
                .missed_ticks
                .fetch_add(missed, Ordering::Relaxed);
            tracing::debug!(reactor = %self.shared.id, missed, "catching up missed ticks");
        }
        for n in (self.last_tick + 1)..=tick_no {
            self.advance_wheel(n, now);
            self.shared.stats.ticks.fetch_add(1, Ordering::Relaxed);
        }
        self.last_tick = tick_no;
    }

    fn advance_wheel(&mut self, tick_no: u64, now: Instant) {
        let mut fired: SmallVec<[(TimerKey, bool, Duration); 16]> = SmallVec::new();
        {
            let tasks = &self.tasks;
            self.wheel.advance(tick_no, |key, wake, duration| {
                let valid = match tasks.get(&key.task) {
                    Some(task) if wake => key.gen == task.wake_gen,
                    Some(task) => task.interval.is_some() && key.gen == task.interval_gen,
                    None => false,
                };
                if valid {
                    fired.push((key, wake, duration));
                    if wake {
                        TimerDecision::Remove
                    } else {
                        TimerDecision::Keep
                    }
                } else {
                    TimerDecision::Remove
                }
            });
        }

        for (key, wake, duration) in fired {
            if wake {
                self.wake_poll(key.task, now);
            } else {
                let live = self
                    .tasks
                    .get(&key.task)
                    .is_some_and(|t| t.interval.is_some() && t.interval_gen == key.gen);
                if live {
                    self.poll_task(key.task, PollReason::Interval, Some(duration), now);
                }
            }
        }
    }

    fn drain_cycle(&mut self, now: Instant) {
        // 1. Wake lists: fan each pending list out to its members.
        let mut lists: SmallVec<[Arc<WakeList>; 8]> = SmallVec::new();
        self.shared.wake_lists.pop_each(DRAIN_BATCH, |list| {
            lists.push(list);
            true
        });
        let mut ready: SmallVec<[TaskId; 32]> = SmallVec::new();
        for list in &lists {
            list.drain(now, |task| ready.push(task));
        }
        for task in ready {
            self.wake_poll(task, now);
        }

        // 2. Invokes, in producer order.
        let mut invokes: SmallVec<[InvokeFn; 16]> = SmallVec::new();
        self.shared.invokes.pop_each(DRAIN_BATCH, |f| {
            invokes.push(f);
            true
        });
        for f in invokes {
            self.shared.stats.invokes.fetch_add(1, Ordering::Relaxed);
            f(self);
        }

        // 3. Direct wakes.
        let mut wakes: SmallVec<[TaskId; 32]> = SmallVec::new();
        self.shared.wakes.pop_each(DRAIN_BATCH, |task| {
            wakes.push(task);
            true
        });
        for task in wakes {
            self.wake_poll(task, now);
        }

        // 4. Spawns.
        let mut spawns: SmallVec<[SpawnRequest; 8]> = SmallVec::new();
        self.shared.spawns.pop_each(DRAIN_BATCH, |req| {
            spawns.push(req);
            true
        });
        for request in spawns {
            self.handle_spawn(request, now);
        }
    }

    /// Wake poll with per-cycle coalescing: at most one wake poll per
    /// task per cycle, however many wake sources fired.
    fn wake_poll(&mut self, id: TaskId, now: Instant) {
        let due = match self.tasks.get_mut(&id) {
            Some(task) if task.wake_stamp == self.cycle => false,
            Some(task) => {
                task.wake_stamp = self.cycle;
                true
            }
            None => false,
        };
        if due {
            self.poll_task(id, PollReason::Wake, None, now);
        }
    }

    fn handle_spawn(&mut self, request: SpawnRequest, now: Instant) {
        let mut task = Task::new(request.id, request.pollable, now);
        task.stop = request.stop;
        if let Some(list) = request.list {
            let slot = list.attach(request.id);
            task.memberships.push(slot);
        }
        self.tasks.insert(request.id, task);
        self.shared.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.tasks.store(self.tasks.len(), Ordering::Relaxed);
        tracing::trace!(reactor = %self.shared.id, task = %request.id, "task spawned");

        self.poll_task(request.id, PollReason::Start, None, now);

        // A spawn-time interval applies unless the Start poll set one.
        if let Some(interval) = request.interval {
            let wheel = &mut self.wheel;
            if let Some(task) = self.tasks.get_mut(&request.id) {
                if task.interval.is_none() {
                    task.interval_gen = task.interval_gen.wrapping_add(1);
                    task.interval = Some(interval);
                    let key = TimerKey {
                        task: request.id,
                        gen: task.interval_gen,
                    };
                    task.scheduled_interval = Some(wheel.schedule(key, interval, false));
                }
            }
        }
    }

    pub(crate) fn poll_task(
        &mut self,
        id: TaskId,
        reason: PollReason,
        fired: Option<Duration>,
        now: Instant,
    ) {
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };
        if task.stop_requested() {
            self.destroy(task, CloseReason::Stopped);
            return;
        }

        let mut cx = PollContext::new(self.shared.id, id, now, reason, fired);
        let result = catch_unwind(AssertUnwindSafe(|| task.pollable.poll(&mut cx)));

        self.shared.stats.polls.fetch_add(1, Ordering::Relaxed);
        task.stats.polls += 1;
        match reason {
            PollReason::Wake => task.stats.wakes += 1,
            PollReason::Interval => task.stats.intervals += 1,
            _ => {}
        }
        task.last_poll = Some(now);

        match result {
            Err(_) => {
                tracing::error!(reactor = %self.shared.id, task = %id, ?reason, "task panicked in poll");
                self.destroy(task, CloseReason::Failed);
            }
            Ok(Err(TaskError::Stop)) => self.destroy(task, CloseReason::Stopped),
            Ok(Err(TaskError::Failed(err))) => {
                tracing::error!(reactor = %self.shared.id, task = %id, %err, "task failed");
                self.destroy(task, CloseReason::Failed);
            }
            Ok(Ok(())) => {
                let requests = cx.requests;
                if requests.stop || task.stop_requested() {
                    self.destroy(task, CloseReason::Stopped);
                    return;
                }
                if let Some(interval) = requests.interval {
                    task.interval_gen = task.interval_gen.wrapping_add(1);
                    task.interval = interval;
                    task.scheduled_interval = interval.map(|d| {
                        let key = TimerKey {
                            task: id,
                            gen: task.interval_gen,
                        };
                        self.wheel.schedule(key, d, false)
                    });
                }
                if let Some(delay) = requests.wake_after {
                    task.wake_gen = task.wake_gen.wrapping_add(1);
                    let key = TimerKey {
                        task: id,
                        gen: task.wake_gen,
                    };
                    self.wheel.schedule(key, delay, true);
                }
                if requests.wake && self.shared.wakes.push(id).is_err() {
                    tracing::warn!(reactor = %self.shared.id, task = %id, "wake queue full, self-wake dropped");
                }
                self.tasks.insert(id, task);
            }
        }
    }

    fn destroy(&mut self, mut task: Task, reason: CloseReason) {
        if catch_unwind(AssertUnwindSafe(|| task.pollable.poll_close(reason))).is_err() {
            tracing::error!(reactor = %self.shared.id, task = %task.id, "task panicked in poll_close");
        }
        for slot in &task.memberships {
            slot.unlink();
        }
        self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.tasks.store(self.tasks.len(), Ordering::Relaxed);
        tracing::debug!(reactor = %self.shared.id, task = %task.id, ?reason, "task destroyed");
    }

    /// Stats snapshot for a live task, if it exists.
    #[cfg(test)]
    fn task_stats(&self, id: TaskId) -> Option<crate::task::TaskStats> {
        self.tasks.get(&id).map(|t| t.stats)
    }

    fn run(mut self) {
        if let Some(cpu) = self.pin_cpu {
            pin_thread(cpu, &self.shared.name);
        }
        self.shared.running.store(true, Ordering::Release);
        tracing::debug!(reactor = %self.shared.id, name = %self.shared.name, "reactor started");

        loop {
            let signal = self.wake_rx.recv_timeout(self.tick);
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let cycle_start = Instant::now();
            self.cycle = self.cycle.wrapping_add(1);
            match signal {
                Ok(Signal::Tick(tick_no)) => self.on_tick(tick_no, cycle_start),
                Ok(Signal::Poke) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.drain_cycle(cycle_start);

            let elapsed = cycle_start.elapsed();
            if elapsed > self.tick {
                self.shared.stats.skew.fetch_add(1, Ordering::Relaxed);
                // Reporting only; a supervisor may move load off this
                // reactor based on the counter.
                tracing::warn!(
                    reactor = %self.shared.id,
                    elapsed = ?elapsed,
                    tick = ?self.tick,
                    "cycle overran the tick"
                );
            }
        }

        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            if let Some(task) = self.tasks.remove(&id) {
                self.destroy(task, CloseReason::Shutdown);
            }
        }
        self.shared.running.store(false, Ordering::Release);
        tracing::debug!(reactor = %self.shared.id, "reactor stopped");
    }
}

/// A reactor plus its thread lifecycle.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    core: Option<Core>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Creates a reactor. No thread runs until [`start`](Self::start);
    /// work submitted before then queues up.
    #[must_use]
    pub fn new(id: ReactorId, config: ReactorConfig) -> Self {
        let (wake_tx, wake_rx) = sync_channel(config.wake_channel_capacity.max(1));

        let poke = |tx: SyncSender<Signal>| {
            QueueWaker::new(move || {
                let _ = tx.try_send(Signal::Poke);
            })
        };

        let shared = Arc::new(ReactorShared {
            id,
            name: config.name.clone(),
            next_task: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
            wake_tx: wake_tx.clone(),
            wake_lists: Arc::new(Mpmc::with_waker(
                config.wake_list_capacity,
                poke(wake_tx.clone()),
            )),
            invokes: OrderedMpsc::with_waker(config.invoke_capacity, poke(wake_tx.clone())),
            wakes: Mpmc::with_waker(config.wake_capacity, poke(wake_tx.clone())),
            spawns: Mpmc::with_waker(config.spawn_capacity, poke(wake_tx)),
            blocking: OnceLock::new(),
            stats: StatsInner::default(),
        });

        let wheel = TimerWheel::new(&config.wheel_levels);
        let tick = wheel.base_tick();
        let core = Core {
            shared: Arc::clone(&shared),
            wake_rx,
            wheel,
            tasks: FxHashMap::default(),
            tick,
            last_tick: 0,
            cycle: 0,
            pin_cpu: config.pin_cpu,
        };

        Self {
            shared,
            core: Some(core),
            thread: None,
        }
    }

    /// The reactor's front door.
    #[must_use]
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawns the reactor thread and waits until its loop is running.
    ///
    /// # Panics
    ///
    /// Panics if called twice or if the OS refuses to spawn the thread.
    pub fn start(&mut self) {
        let core = self
            .core
            .take()
            .unwrap_or_else(|| panic!("reactor {} already started", self.shared.id));
        let thread = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || core.run())
            .unwrap_or_else(|e| panic!("failed to spawn reactor thread: {e}"));
        self.thread = Some(thread);
        while !self.shared.running.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    /// Stops accepting work, destroys remaining tasks with
    /// [`CloseReason::Shutdown`], and joins the thread.
    pub fn stop(&mut self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.wake_tx.try_send(Signal::Poke);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(reactor = %self.shared.id, "reactor thread panicked");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("started", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

/// Pins the current thread to `cpu`. Linux only; a no-op elsewhere.
#[cfg(target_os = "linux")]
fn pin_thread(cpu: usize, name: &str) {
    // SAFETY: cpu_set_t is a plain bitmask; CPU_ZERO/CPU_SET only
    // write within the set, and sched_setaffinity reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(name, cpu, "failed to pin reactor thread");
        } else {
            tracing::debug!(name, cpu, "reactor thread pinned");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_thread(_cpu: usize, name: &str) {
    tracing::debug!(name, "thread pinning not supported on this platform");
}
