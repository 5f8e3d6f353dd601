//! The shared tick source.
//!
//! One thread owns the clock. Every base tick it multicasts
//! [`Signal::Tick`] with the absolute tick number into every registered
//! reactor's wake channel with a non-blocking send; a reactor that is
//! mid-cycle simply finds the signal waiting. Deadlines are computed
//! from the start instant, so delivery does not drift even when a send
//! or sleep runs long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::reactor::Signal;

struct TickerShared {
    tick: Duration,
    running: AtomicBool,
    sinks: Mutex<Vec<SyncSender<Signal>>>,
}

/// Drives all registered reactors with a fixed-cadence tick signal.
pub struct Ticker {
    shared: Arc<TickerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Starts the tick thread with the given base tick duration.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is zero or the OS refuses to spawn the thread.
    #[must_use]
    pub fn start(tick: Duration) -> Self {
        assert!(tick > Duration::ZERO, "tick must be positive");
        let shared = Arc::new(TickerShared {
            tick,
            running: AtomicBool::new(true),
            sinks: Mutex::new(Vec::new()),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("rivulet-ticker".into())
            .spawn(move || run(&thread_shared))
            .unwrap_or_else(|e| panic!("failed to spawn ticker thread: {e}"));

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// The base tick duration.
    #[must_use]
    pub fn tick(&self) -> Duration {
        self.shared.tick
    }

    /// Registers a reactor wake channel to receive tick signals.
    pub fn register(&self, sink: SyncSender<Signal>) {
        self.shared.sinks.lock().push(sink);
    }

    /// Stops the tick thread and joins it. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("tick", &self.shared.tick)
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn run(shared: &TickerShared) {
    tracing::debug!(tick = ?shared.tick, "ticker started");
    let mut deadline = Instant::now();
    let mut tick_no: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        tick_no += 1;
        deadline += shared.tick;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let mut sinks = shared.sinks.lock();
        sinks.retain(|sink| match sink.try_send(Signal::Tick(tick_no)) {
            // A full channel means the reactor already has a pending
            // signal and will catch up from the next tick number.
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
    tracing::debug!(ticks = tick_no, "ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn delivers_monotonic_ticks() {
        let ticker = Ticker::start(Duration::from_millis(5));
        let (tx, rx) = sync_channel(16);
        ticker.register(tx);

        let mut last = 0;
        for _ in 0..5 {
            match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                Signal::Tick(n) => {
                    assert!(n > last, "tick {n} after {last}");
                    last = n;
                }
                Signal::Poke => panic!("unexpected poke"),
            }
        }
        ticker.stop();
    }

    #[test]
    fn full_channel_does_not_block_the_ticker() {
        let ticker = Ticker::start(Duration::from_millis(2));
        let (tx, rx) = sync_channel(1);
        ticker.register(tx);

        // Never drain; the ticker must keep running regardless.
        std::thread::sleep(Duration::from_millis(30));
        ticker.stop();
        drop(rx);
    }

    #[test]
    fn dropped_receiver_is_unregistered() {
        let ticker = Ticker::start(Duration::from_millis(2));
        let (tx, rx) = sync_channel(4);
        ticker.register(tx);
        drop(rx);
        std::thread::sleep(Duration::from_millis(20));
        ticker.stop();
    }
}
