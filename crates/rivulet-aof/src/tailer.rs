//! Tailers: reactor tasks that follow a file's published bytes.
//!
//! A tailer keeps a cursor into one [`Aof`](crate::aof::Aof) and hands
//! every newly published byte to its [`Consumer`] exactly once, as a
//! contiguous prefix. Tailers are members of the file's task set, so a
//! single write wakes all of them with one coalesced signal.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rivulet_core::task::{CloseReason, PollContext, PollReason, Pollable, TaskError};

use crate::aof::{Aof, AofState};

/// Where a tailer stands relative to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TailerState {
    /// Spawned, not yet polled.
    Start = 0,
    /// Mid-stream: the consumer left bytes unconsumed last poll.
    Reading = 1,
    /// Caught up with the published size of an open file.
    Tail = 2,
    /// Caught up with a finished file.
    Eof = 3,
    /// Stop requested; the consumer will see one closure callback.
    Closing = 4,
    /// Done.
    Closed = 5,
}

impl TailerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Start,
            1 => Self::Reading,
            2 => Self::Tail,
            3 => Self::Eof,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One delivery of newly published bytes to a [`Consumer`].
pub struct ReadEvent<'a> {
    /// The consumer's cursor: first byte of this delivery.
    pub begin: u64,
    /// The published size at the time of this poll.
    pub end: u64,
    /// The new bytes, `mapping[begin..end]`.
    pub tail: &'a [u8],
    /// The whole published prefix, `mapping[0..end]`.
    pub contents: &'a [u8],
    /// The file's state at the time of this poll.
    pub file_state: AofState,
    /// True once the file is finished; no further bytes will follow.
    pub eof: bool,
    /// Why the tailer was polled.
    pub reason: PollReason,
}

/// Receives the bytes a tailer reads.
///
/// `poll_read` runs on the tailer's reactor thread and must not block.
pub trait Consumer: Send {
    /// Handles `[event.begin, event.end)` and returns the new cursor:
    /// the offset consumed up to, in `[event.begin, event.end]`.
    /// Returning less than `event.end` makes the tailer re-poll on the
    /// next reactor cycle with the remainder.
    ///
    /// # Errors
    ///
    /// Return [`TaskError::Stop`] to unsubscribe; other errors destroy
    /// the tailer and are logged by the reactor.
    fn poll_read(&mut self, event: ReadEvent<'_>) -> Result<u64, TaskError>;

    /// Called exactly once when the tailer ends, whatever the cause.
    fn poll_read_closed(&mut self, reason: CloseReason) {
        let _ = reason;
    }
}

impl<F> Consumer for F
where
    F: FnMut(ReadEvent<'_>) -> Result<u64, TaskError> + Send,
{
    fn poll_read(&mut self, event: ReadEvent<'_>) -> Result<u64, TaskError> {
        self(event)
    }
}

/// The reactor task driving one consumer over one file.
pub(crate) struct Tailer {
    aof: Arc<Aof>,
    consumer: Box<dyn Consumer>,
    cursor: u64,
    state: AtomicU8,
    interval: Option<Duration>,
    closed_delivered: bool,
}

impl Tailer {
    pub(crate) fn new(aof: Arc<Aof>, consumer: Box<dyn Consumer>, interval: Option<Duration>) -> Self {
        Self {
            aof,
            consumer,
            cursor: 0,
            state: AtomicU8::new(TailerState::Start as u8),
            interval,
            closed_delivered: false,
        }
    }

    fn state(&self) -> TailerState {
        TailerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Publishes `next` if the state is still `observed`; a concurrent
    /// transition (external close) wins and the poll restarts.
    fn transition(&self, observed: TailerState, next: TailerState) -> bool {
        self.state
            .compare_exchange(
                observed as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn deliver_closed(&mut self, reason: CloseReason) {
        if !self.closed_delivered {
            self.closed_delivered = true;
            self.consumer.poll_read_closed(reason);
        }
        self.state.store(TailerState::Closed as u8, Ordering::Release);
    }
}

impl Pollable for Tailer {
    fn poll(&mut self, cx: &mut PollContext) -> Result<(), TaskError> {
        if cx.reason() == PollReason::Start {
            if let Some(interval) = self.interval {
                cx.set_interval(interval);
            }
        }

        loop {
            let observed = self.state();
            if matches!(observed, TailerState::Closing | TailerState::Closed) {
                self.deliver_closed(CloseReason::Stopped);
                return Err(TaskError::Stop);
            }

            let file_state = self.aof.state();
            let size = self.aof.size();
            if matches!(file_state, AofState::Closing | AofState::Closed) {
                self.deliver_closed(CloseReason::Stopped);
                return Err(TaskError::Stop);
            }

            let eof = file_state == AofState::Eof;
            if self.cursor == size && !eof {
                // Caught up; wait for the next write's wake.
                if self.transition(observed, TailerState::Tail) {
                    return Ok(());
                }
                continue;
            }
            if self.cursor == size && eof {
                if observed == TailerState::Eof {
                    return Ok(());
                }
                // One final delivery so the consumer observes the EOF.
                let event = ReadEvent {
                    begin: self.cursor,
                    end: size,
                    tail: &[],
                    contents: self.aof.bytes(0, size),
                    file_state,
                    eof: true,
                    reason: cx.reason(),
                };
                self.consumer.poll_read(event)?;
                if self.transition(observed, TailerState::Eof) {
                    return Ok(());
                }
                continue;
            }

            let event = ReadEvent {
                begin: self.cursor,
                end: size,
                tail: self.aof.bytes(self.cursor, size),
                contents: self.aof.bytes(0, size),
                file_state,
                eof,
                reason: cx.reason(),
            };
            let n = self.consumer.poll_read(event)?.min(size);
            self.cursor = n;

            let (next, done) = if n == size {
                (if eof { TailerState::Eof } else { TailerState::Tail }, true)
            } else {
                (TailerState::Reading, false)
            };
            if self.transition(observed, next) {
                if !done {
                    // Partial consumption: come back next cycle.
                    cx.request_wake();
                }
                return Ok(());
            }
        }
    }

    fn poll_close(&mut self, reason: CloseReason) {
        self.deliver_closed(reason);
    }
}
