//! Runtime bootstrap: reactors, ticker, and blocking pool as one unit.
//!
//! Most programs call [`Runtime::init`] once and use the process-global
//! instance from then on; embedders and tests can build private
//! [`Runtime`] values instead. Shutdown is ordered: reactors first (no
//! new spawns, remaining tasks closed), then the blocking pool, then
//! the ticker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::blocking::BlockingPool;
use crate::reactor::{Reactor, ReactorConfig, ReactorHandle, TimerKey};
use crate::task::ReactorId;
use crate::ticker::Ticker;
use crate::wheel::TimerWheel;

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Runtime construction parameters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of reactor threads. Defaults to half the cores, at least
    /// one.
    pub reactors: usize,
    /// Base tick duration shared by the ticker and every wheel.
    pub tick: Duration,
    /// Per-reactor invoke queue capacity.
    pub invoke_capacity: usize,
    /// Per-reactor wake queue capacity.
    pub wake_capacity: usize,
    /// Per-reactor spawn queue capacity.
    pub spawn_capacity: usize,
    /// Per-reactor wake-list queue capacity.
    pub wake_list_capacity: usize,
    /// Blocking pool workers; 0 picks the default (half the cores).
    pub blocking_workers: usize,
    /// Pin reactor threads to CPUs round-robin.
    pub pin_reactors: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            reactors: (cores / 2).max(1),
            tick: Duration::from_millis(250),
            invoke_capacity: 1024,
            wake_capacity: 1024,
            spawn_capacity: 256,
            wake_list_capacity: 256,
            blocking_workers: 0,
            pin_reactors: false,
        }
    }
}

/// The assembled runtime: reactor threads, the shared ticker, and the
/// blocking pool.
pub struct Runtime {
    reactors: Mutex<Vec<Reactor>>,
    handles: Vec<ReactorHandle>,
    blocking: Arc<BlockingPool>,
    ticker: Ticker,
    tick: Duration,
    next: AtomicUsize,
    down: AtomicBool,
}

impl Runtime {
    /// Initialises the process-global runtime, or returns the existing
    /// one (the new config is ignored in that case).
    pub fn init(config: RuntimeConfig) -> &'static Runtime {
        if GLOBAL.get().is_some() {
            tracing::debug!("runtime already initialised, config ignored");
        }
        GLOBAL.get_or_init(|| Runtime::new(config))
    }

    /// The process-global runtime, if initialised.
    #[must_use]
    pub fn global() -> Option<&'static Runtime> {
        GLOBAL.get()
    }

    /// Builds a private runtime. All threads start before this returns.
    ///
    /// # Panics
    ///
    /// Panics if `config.reactors` is zero or thread spawning fails.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        assert!(config.reactors > 0, "runtime needs at least one reactor");
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);

        let ticker = Ticker::start(config.tick);
        let blocking = Arc::new(if config.blocking_workers == 0 {
            BlockingPool::start()
        } else {
            BlockingPool::with_workers(config.blocking_workers)
        });

        let mut reactors = Vec::with_capacity(config.reactors);
        let mut handles = Vec::with_capacity(config.reactors);
        for i in 0..config.reactors {
            let reactor_config = ReactorConfig {
                name: format!("rivulet-reactor-{i}"),
                wheel_levels: TimerWheel::<TimerKey>::levels_for_tick(config.tick),
                invoke_capacity: config.invoke_capacity,
                wake_capacity: config.wake_capacity,
                spawn_capacity: config.spawn_capacity,
                wake_list_capacity: config.wake_list_capacity,
                wake_channel_capacity: 64,
                pin_cpu: config.pin_reactors.then_some(i % cores),
            };
            let mut reactor = Reactor::new(ReactorId(i), reactor_config);
            let handle = reactor.handle();
            handle.attach_blocking_pool(Arc::clone(&blocking));
            ticker.register(handle.wake_sender());
            reactor.start();
            reactors.push(reactor);
            handles.push(handle);
        }

        tracing::debug!(
            reactors = config.reactors,
            tick = ?config.tick,
            "runtime started"
        );
        Self {
            reactors: Mutex::new(reactors),
            handles,
            blocking,
            ticker,
            tick: config.tick,
            next: AtomicUsize::new(0),
            down: AtomicBool::new(false),
        }
    }

    /// The base tick duration.
    #[must_use]
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Handle to reactor `i`, if it exists.
    #[must_use]
    pub fn reactor(&self, i: usize) -> Option<&ReactorHandle> {
        self.handles.get(i)
    }

    /// All reactor handles.
    #[must_use]
    pub fn reactors(&self) -> &[ReactorHandle] {
        &self.handles
    }

    /// The next reactor in round-robin order; use for load-spreading
    /// spawns.
    #[must_use]
    pub fn next_reactor(&self) -> &ReactorHandle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.handles[n % self.handles.len()]
    }

    /// The shared blocking pool.
    #[must_use]
    pub fn blocking(&self) -> &BlockingPool {
        &self.blocking
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Stops everything in order: reactors (refusing new work, closing
    /// remaining tasks), then the blocking pool, then the ticker.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("runtime shutting down");
        let mut reactors = self.reactors.lock();
        for reactor in reactors.iter_mut() {
            reactor.stop();
        }
        self.blocking.shutdown();
        self.ticker.stop();
        tracing::debug!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("reactors", &self.handles.len())
            .field("tick", &self.tick)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PollContext, PollReason};
    use crate::taskset::TaskSet;
    use std::time::Instant;

    fn fast_config(reactors: usize) -> RuntimeConfig {
        RuntimeConfig {
            reactors,
            tick: Duration::from_millis(10),
            blocking_workers: 1,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn round_robin_covers_all_reactors() {
        let runtime = Runtime::new(fast_config(3));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(runtime.next_reactor().id());
        }
        assert_eq!(seen.len(), 3);
        runtime.shutdown();
    }

    #[test]
    fn interval_cadence_is_close_to_requested() {
        let runtime = Runtime::new(fast_config(1));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        runtime
            .reactor(0)
            .unwrap()
            .spawn_interval(
                move |cx: &mut PollContext| {
                    if cx.reason() == PollReason::Interval {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                },
                Duration::from_millis(20),
            )
            .unwrap();

        // 20ms interval on a 10ms tick observed for 200ms: about 10
        // firings, allowing scheduler jitter.
        std::thread::sleep(Duration::from_millis(200));
        let n = fired.load(Ordering::SeqCst);
        assert!((7..=13).contains(&n), "fired {n} times");
        runtime.shutdown();
    }

    #[test]
    fn task_set_fan_out_hits_every_member_once() {
        const REACTORS: usize = 4;
        const PER_REACTOR: usize = 25;

        let runtime = Runtime::new(fast_config(REACTORS));
        let set = TaskSet::new();
        let started = Arc::new(AtomicUsize::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        for i in 0..REACTORS {
            for _ in 0..PER_REACTOR {
                let started = Arc::clone(&started);
                let woken = Arc::clone(&woken);
                set.spawn_on(runtime.reactor(i).unwrap(), move |cx: &mut PollContext| {
                    match cx.reason() {
                        PollReason::Start => {
                            started.fetch_add(1, Ordering::SeqCst);
                        }
                        PollReason::Wake => {
                            woken.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                    Ok(())
                })
                .unwrap();
            }
        }

        let total = REACTORS * PER_REACTOR;
        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < total && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(started.load(Ordering::SeqCst), total);
        assert_eq!(set.len(), total);

        set.wake();
        let deadline = Instant::now() + Duration::from_secs(5);
        while woken.load(Ordering::SeqCst) < total && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        // One wake call fans out to every member exactly once.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), total);

        runtime.shutdown();
    }

    #[test]
    fn shutdown_refuses_further_spawns() {
        let runtime = Runtime::new(fast_config(1));
        runtime.shutdown();
        runtime.shutdown(); // idempotent
        assert!(runtime.is_shutdown());
        assert!(runtime
            .reactor(0)
            .unwrap()
            .spawn(|_cx: &mut PollContext| Ok(()))
            .is_err());
    }

    #[test]
    fn blocking_pool_is_reachable_from_handles() {
        let runtime = Runtime::new(fast_config(1));
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        assert!(runtime
            .reactor(0)
            .unwrap()
            .invoke_blocking(move || {
                flag.store(1, Ordering::SeqCst);
            }));
        let deadline = Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }
}
