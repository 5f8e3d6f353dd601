//! # Rivulet core
//!
//! A fixed-tick, single-threaded-per-core reactor runtime.
//!
//! Each [`Reactor`](reactor::Reactor) owns its tasks and timers
//! outright and runs them on one pinned thread; other threads reach it
//! only through bounded lock-free queues. A shared
//! [`Ticker`](ticker::Ticker) drives every reactor's
//! [timer wheels](wheel::TimerWheel) at a coarse cadence (250 ms by
//! default), and a [`BlockingPool`](blocking::BlockingPool) absorbs
//! anything that is allowed to sleep.
//!
//! The design trades timer precision for throughput: timers are
//! bucketed to the tick, wakes coalesce, and nothing in the hot path
//! allocates or locks.
//!
//! ```no_run
//! use std::time::Duration;
//! use rivulet_core::runtime::{Runtime, RuntimeConfig};
//! use rivulet_core::task::PollContext;
//!
//! let runtime = Runtime::init(RuntimeConfig::default());
//! runtime
//!     .next_reactor()
//!     .spawn_interval(
//!         |cx: &mut PollContext| {
//!             println!("tick at {:?}", cx.now());
//!             Ok(())
//!         },
//!         Duration::from_secs(1),
//!     )
//!     .unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod blocking;
pub mod error;
pub mod queue;
pub mod reactor;
pub mod runtime;
pub mod task;
pub mod taskset;
pub mod ticker;
pub mod wheel;

pub use error::CoreError;
pub use queue::{Mpmc, OrderedMpsc, QueueWaker};
pub use reactor::{Reactor, ReactorConfig, ReactorHandle, ReactorStats, Signal, TaskHandle};
pub use runtime::{Runtime, RuntimeConfig};
pub use task::{
    CloseReason, PollContext, PollReason, Pollable, ReactorId, TaskError, TaskId, TaskStats,
};
pub use taskset::{SwapSlice, TaskSet, WakeList};
pub use ticker::Ticker;
pub use wheel::{TimerDecision, TimerWheel, WheelLevelConfig};
