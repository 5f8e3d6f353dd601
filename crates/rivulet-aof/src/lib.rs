//! # Rivulet AOF
//!
//! Memory-mapped append-only files with crash recovery and
//! reactor-driven tailers.
//!
//! A [`Manager`](manager::Manager) owns a directory of named files.
//! Each [`Aof`](aof::Aof) is one contiguous byte log: a single writer
//! appends under a mutex, the valid size is release-published, and any
//! number of [tailers](tailer::Consumer) on
//! [`rivulet_core`] reactors follow the log without locks. An 8-byte
//! sentinel terminates the valid region on disk, so reopening after a
//! crash recovers exactly the published bytes.
//!
//! ```no_run
//! use rivulet_aof::geometry::Geometry;
//! use rivulet_aof::manager::Manager;
//! use rivulet_aof::recovery::RecoveryOptions;
//!
//! # fn main() -> Result<(), rivulet_aof::AofError> {
//! let manager = Manager::open_dir("/var/lib/rivulet")?;
//! let log = manager.open("events", Geometry::default(), RecoveryOptions::default())?;
//! log.write(b"hello")?;
//! log.sync()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aof;
pub mod error;
pub mod geometry;
pub mod manager;
pub mod mmap;
pub mod recovery;
pub mod tailer;

pub use aof::{Aof, AofState, AofStats, AppendSlot};
pub use error::AofError;
pub use geometry::Geometry;
pub use manager::{Manager, ManagerStats};
pub use recovery::{RecoveryKind, RecoveryOptions, RecoveryOutcome, EOF_MAGIC, TAIL_MAGIC};
pub use tailer::{Consumer, ReadEvent, TailerState};
