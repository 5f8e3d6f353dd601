//! Tasks and the poll contract.
//!
//! A task is a [`Pollable`] owned by exactly one reactor. The reactor
//! calls [`Pollable::poll`] on its own thread whenever the task has a
//! reason to run; the task communicates back through the
//! [`PollContext`] (set an interval, request a wake, stop). Tasks never
//! share state with the reactor except through these calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::taskset::WakeSlot;

/// Identifies a reactor within the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactorId(pub usize);

impl std::fmt::Display for ReactorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reactor-{}", self.0)
    }
}

/// Identifies a task within its owning reactor. Monotonic, never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Errors a task may return from [`Pollable::poll`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task is finished and wants to be destroyed. This is the
    /// normal way for a task to end itself and is not logged as a
    /// failure.
    #[error("task requested stop")]
    Stop,
    /// The task hit an unrecoverable error. The reactor logs it and
    /// destroys the task.
    #[error("task failed: {0}")]
    Failed(String),
}

/// Why a task is being destroyed, passed to [`Pollable::poll_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The task returned [`TaskError::Stop`] or its stop flag was set.
    Stopped,
    /// The task returned an error or panicked during a poll.
    Failed,
    /// The owning reactor is shutting down.
    Shutdown,
}

/// Why a task is being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    /// First poll after the spawn request was drained.
    Start,
    /// A wake was requested (cross-thread, wake list, or `wake_after`).
    Wake,
    /// The task's interval timer fired.
    Interval,
    /// Liveness probe.
    Ping,
    /// Final poll before destruction.
    Close,
}

/// Requests a task records during a poll, applied by the reactor
/// afterwards.
#[derive(Debug, Default)]
pub(crate) struct PollRequests {
    /// `Some(None)` clears the interval, `Some(Some(d))` sets it.
    pub(crate) interval: Option<Option<Duration>>,
    pub(crate) wake_after: Option<Duration>,
    pub(crate) wake: bool,
    pub(crate) stop: bool,
}

/// Per-poll context handed to [`Pollable::poll`].
///
/// Carries the reason and timing of the poll, and collects the task's
/// requests for the reactor to apply once the poll returns.
#[derive(Debug)]
pub struct PollContext {
    reactor: ReactorId,
    task: TaskId,
    now: Instant,
    reason: PollReason,
    fired_interval: Option<Duration>,
    pub(crate) requests: PollRequests,
}

impl PollContext {
    pub(crate) fn new(
        reactor: ReactorId,
        task: TaskId,
        now: Instant,
        reason: PollReason,
        fired_interval: Option<Duration>,
    ) -> Self {
        Self {
            reactor,
            task,
            now,
            reason,
            fired_interval,
            requests: PollRequests::default(),
        }
    }

    /// The reactor this task runs on.
    #[must_use]
    pub fn reactor(&self) -> ReactorId {
        self.reactor
    }

    /// This task's id.
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The instant the reactor started this poll.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Why this poll is happening.
    #[must_use]
    pub fn reason(&self) -> PollReason {
        self.reason
    }

    /// For [`PollReason::Interval`] polls, the effective duration of
    /// the interval that fired (bucketed, so it may differ slightly
    /// from the requested one).
    #[must_use]
    pub fn fired_interval(&self) -> Option<Duration> {
        self.fired_interval
    }

    /// Requests a repeating interval. Replaces any existing interval
    /// after this poll returns.
    pub fn set_interval(&mut self, interval: Duration) {
        self.requests.interval = Some(Some(interval));
    }

    /// Cancels the task's interval.
    pub fn clear_interval(&mut self) {
        self.requests.interval = Some(None);
    }

    /// Requests a one-shot wake roughly `delay` from now. Replaces any
    /// pending delayed wake.
    pub fn wake_after(&mut self, delay: Duration) {
        self.requests.wake_after = Some(delay);
    }

    /// Requests an immediate re-poll on the next reactor cycle.
    pub fn request_wake(&mut self) {
        self.requests.wake = true;
    }

    /// Asks the reactor to destroy this task after the poll returns.
    pub fn stop(&mut self) {
        self.requests.stop = true;
    }
}

/// The unit of work a reactor drives.
///
/// `poll` runs on the reactor thread and must not block; hand blocking
/// work to the blocking pool. A panic inside `poll` is caught by the
/// reactor, logged, and destroys the task.
pub trait Pollable: Send {
    /// Called whenever the task has a reason to run.
    ///
    /// # Errors
    ///
    /// Return [`TaskError::Stop`] to end the task normally; any other
    /// error destroys the task and is logged.
    fn poll(&mut self, cx: &mut PollContext) -> Result<(), TaskError>;

    /// Called exactly once before the task is destroyed.
    fn poll_close(&mut self, reason: CloseReason) {
        let _ = reason;
    }
}

impl<F> Pollable for F
where
    F: FnMut(&mut PollContext) -> Result<(), TaskError> + Send,
{
    fn poll(&mut self, cx: &mut PollContext) -> Result<(), TaskError> {
        self(cx)
    }
}

/// Counters kept per task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskStats {
    /// Total polls, any reason.
    pub polls: u64,
    /// Polls with reason [`PollReason::Wake`].
    pub wakes: u64,
    /// Polls with reason [`PollReason::Interval`].
    pub intervals: u64,
}

/// The reactor-owned task record.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) pollable: Box<dyn Pollable>,
    pub(crate) created: Instant,
    pub(crate) last_poll: Option<Instant>,
    /// Requested repeat interval, if any.
    pub(crate) interval: Option<Duration>,
    /// Effective ring duration the interval is currently scheduled on.
    pub(crate) scheduled_interval: Option<Duration>,
    /// Bumped whenever the interval changes; stale wheel entries carry
    /// an older generation and are dropped when they fire.
    pub(crate) interval_gen: u32,
    /// Bumped whenever a timed wake is scheduled; a newer request
    /// invalidates the older entry.
    pub(crate) wake_gen: u32,
    /// Reactor cycle of the last wake poll; wakes arriving within the
    /// same cycle coalesce into one poll.
    pub(crate) wake_stamp: u64,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) stats: TaskStats,
    /// Wake-list memberships; unlinked one by one on destruction.
    pub(crate) memberships: Vec<Arc<WakeSlot>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, pollable: Box<dyn Pollable>, now: Instant) -> Self {
        Self {
            id,
            pollable,
            created: now,
            last_poll: None,
            interval: None,
            scheduled_interval: None,
            interval_gen: 0,
            wake_gen: 0,
            wake_stamp: 0,
            stop: Arc::new(AtomicBool::new(false)),
            stats: TaskStats::default(),
            memberships: Vec::new(),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_records_requests() {
        let mut cx = PollContext::new(
            ReactorId(0),
            TaskId(1),
            Instant::now(),
            PollReason::Start,
            None,
        );
        cx.set_interval(Duration::from_millis(500));
        cx.wake_after(Duration::from_secs(1));
        cx.request_wake();

        assert_eq!(
            cx.requests.interval,
            Some(Some(Duration::from_millis(500)))
        );
        assert_eq!(cx.requests.wake_after, Some(Duration::from_secs(1)));
        assert!(cx.requests.wake);
        assert!(!cx.requests.stop);
    }

    #[test]
    fn clear_interval_overrides_set() {
        let mut cx = PollContext::new(
            ReactorId(0),
            TaskId(1),
            Instant::now(),
            PollReason::Wake,
            None,
        );
        cx.set_interval(Duration::from_secs(1));
        cx.clear_interval();
        assert_eq!(cx.requests.interval, Some(None));
    }

    #[test]
    fn closures_are_pollable() {
        let mut calls = 0;
        let mut task = move |cx: &mut PollContext| {
            calls += 1;
            if cx.reason() == PollReason::Start {
                Ok(())
            } else {
                Err(TaskError::Stop)
            }
        };
        let mut cx = PollContext::new(
            ReactorId(0),
            TaskId(2),
            Instant::now(),
            PollReason::Start,
            None,
        );
        assert!(Pollable::poll(&mut task, &mut cx).is_ok());
    }

    #[test]
    fn task_record_defaults() {
        let task = Task::new(
            TaskId(9),
            Box::new(|_cx: &mut PollContext| Ok(())),
            Instant::now(),
        );
        assert_eq!(task.id, TaskId(9));
        assert!(task.interval.is_none());
        assert_eq!(task.wake_stamp, 0);
        assert!(!task.stop_requested());
        task.stop.store(true, Ordering::Release);
        assert!(task.stop_requested());
    }
}
