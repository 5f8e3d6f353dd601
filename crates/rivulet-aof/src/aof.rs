//! The append-only file: a memory-mapped byte log with one writer,
//! many tailers, and sentinel-based crash recovery.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use rivulet_core::error::CoreError;
use rivulet_core::reactor::{ReactorHandle, TaskHandle};
use rivulet_core::taskset::{TaskSet, TOMBSTONE};

use crate::error::AofError;
use crate::geometry::Geometry;
use crate::manager::ManagerInner;
use crate::mmap::Mapping;
use crate::recovery::{RecoveryKind, RecoveryOptions, RecoveryOutcome, EOF_MAGIC, TAIL_MAGIC};
use crate::tailer::{Consumer, Tailer};

const MAGIC_LEN: u64 = 8;

/// Lifecycle state of an append-only file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AofState {
    /// Being opened by the manager; not yet usable.
    Opening = 0,
    /// Accepting appends.
    Opened = 1,
    /// Finished: read-only forever, terminated by the EOF sentinel.
    Eof = 2,
    /// Close requested; tailers are draining.
    Closing = 3,
    /// Fully closed.
    Closed = 4,
}

impl AofState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Opening,
            1 => Self::Opened,
            2 => Self::Eof,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Counters kept per file.
#[derive(Debug, Default, Clone, Copy)]
pub struct AofStats {
    /// Successful writes and appends.
    pub writes: u64,
    /// Payload bytes published.
    pub bytes: u64,
    /// Flush calls that actually flushed.
    pub flushes: u64,
    /// Sync calls.
    pub syncs: u64,
    /// I/O errors observed.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    writes: AtomicU64,
    bytes: AtomicU64,
    flushes: AtomicU64,
    syncs: AtomicU64,
    errors: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> AofStats {
        AofStats {
            writes: self.writes.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// The writable window handed to an [`append`](Aof::append) closure.
///
/// `written` covers the already-published bytes `[0, begin)`; `tail` is
/// the reserved region to encode into. The closure returns how many of
/// the reserved bytes it actually used.
pub struct AppendSlot<'a> {
    /// Offset where the reservation starts.
    pub begin: u64,
    /// Offset one past the reservation.
    pub end: u64,
    /// The published prefix of the file.
    pub written: &'a [u8],
    /// The reserved bytes to write into.
    pub tail: &'a mut [u8],
}

/// A memory-mapped append-only file.
///
/// One writer at a time (serialised by an internal mutex), any number
/// of concurrent tailers. The valid region `[0, size)` is published
/// with release semantics and never mutated again; readers acquire
/// `size` and read below it without locks.
pub struct Aof {
    name: String,
    path: PathBuf,
    file: File,
    map: Mapping,
    geometry: Geometry,
    magic: bool,
    recovered: RecoveryOutcome,
    state: AtomicU8,
    size: AtomicU64,
    file_size: AtomicU64,
    flush_size: AtomicU64,
    sync_size: AtomicU64,
    sticky: Mutex<Option<String>>,
    write_lock: Mutex<()>,
    growing: AtomicBool,
    tailers: TaskSet,
    manager: Weak<ManagerInner>,
    /// Position in the manager's flush list.
    pub(crate) flush_cell: Arc<AtomicUsize>,
    /// Position in the manager's GC list.
    pub(crate) gc_cell: Arc<AtomicUsize>,
    stats: StatsInner,
}

impl Aof {
    /// Opens (or creates) the file at `path` and recovers its tail.
    pub(crate) fn open(
        name: &str,
        path: PathBuf,
        geometry: Geometry,
        recovery: RecoveryOptions,
        mode: u32,
        manager: Weak<ManagerInner>,
    ) -> Result<Self, AofError> {
        let geometry = geometry.validated()?;

        let (created, disk_len) = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                return Err(AofError::IsDirectory(path.display().to_string()));
            }
            Ok(meta) => (false, meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if recovery.eof {
                    return Err(AofError::EmptyFile);
                }
                (true, 0)
            }
            Err(e) => return Err(AofError::Io(e)),
        };

        let mut options = OpenOptions::new();
        options.read(true).write(!recovery.eof).create(created);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = options.open(&path)?;

        if recovery.eof {
            return Self::open_finished(name, path, file, disk_len, geometry, recovery, manager);
        }

        let mut file_size = disk_len;
        if file_size < geometry.size_now {
            file.set_len(geometry.size_now)?;
            file_size = geometry.size_now;
        }

        let map = Mapping::open_rw(&file, geometry.size_upper)?;
        let recovered = if created {
            RecoveryOutcome {
                tail: 0,
                kind: RecoveryKind::Empty,
            }
        } else {
            let scan = recovery.resolve()(map.slice(0, usize::try_from(file_size).unwrap_or(0)));
            recovery.check(scan)?
        };

        let mut aof = Self::assemble(
            name, path, file, map, geometry, recovery, recovered, file_size, manager,
        );
        if recovered.kind == RecoveryKind::Eof {
            aof.freeze_finished()?;
        }
        tracing::debug!(
            name = %aof.name,
            size = aof.size.load(Ordering::Relaxed),
            kind = ?recovered.kind,
            "append-only file opened"
        );
        Ok(aof)
    }

    /// EOF-mode open: the file must already be finished; it is mapped
    /// read-only at its physical length.
    fn open_finished(
        name: &str,
        path: PathBuf,
        file: File,
        disk_len: u64,
        geometry: Geometry,
        recovery: RecoveryOptions,
        manager: Weak<ManagerInner>,
    ) -> Result<Self, AofError> {
        let map = Mapping::open_ro(&file, disk_len)?;
        let scan = recovery.resolve()(map.slice(0, usize::try_from(disk_len).unwrap_or(0)));
        let recovered = recovery.check(scan)?;
        let aof = Self::assemble(
            name, path, file, map, geometry, recovery, recovered, disk_len, manager,
        );
        aof.state.store(AofState::Eof as u8, Ordering::Release);
        Ok(aof)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: &str,
        path: PathBuf,
        file: File,
        map: Mapping,
        geometry: Geometry,
        recovery: RecoveryOptions,
        recovered: RecoveryOutcome,
        file_size: u64,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self {
            name: name.to_string(),
            path,
            file,
            map,
            geometry,
            magic: recovery.magic,
            recovered,
            state: AtomicU8::new(AofState::Opened as u8),
            size: AtomicU64::new(recovered.tail),
            file_size: AtomicU64::new(file_size),
            flush_size: AtomicU64::new(recovered.tail),
            sync_size: AtomicU64::new(recovered.tail),
            sticky: Mutex::new(None),
            write_lock: Mutex::new(()),
            growing: AtomicBool::new(false),
            tailers: TaskSet::new(),
            manager,
            flush_cell: Arc::new(AtomicUsize::new(TOMBSTONE)),
            gc_cell: Arc::new(AtomicUsize::new(TOMBSTONE)),
            stats: StatsInner::default(),
        }
    }

    /// Recovery found an EOF sentinel on a read-write open: shrink the
    /// file to its final length and seal the state.
    fn freeze_finished(&mut self) -> Result<(), AofError> {
        let size = self.size.load(Ordering::Relaxed);
        let final_len = size + if self.magic { MAGIC_LEN } else { 0 };
        if final_len < self.file_size.load(Ordering::Relaxed) {
            self.file.set_len(final_len)?;
            self.file_size.store(final_len, Ordering::Release);
        }
        self.map = Mapping::open_ro(&self.file, final_len)?;
        self.state.store(AofState::Eof as u8, Ordering::Release);
        Ok(())
    }

    /// The file's name within its manager.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path backing this file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AofState {
        AofState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The published valid size. Monotonically non-decreasing.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// The physical file length.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// What recovery found when this file was opened.
    #[must_use]
    pub fn recovered(&self) -> RecoveryOutcome {
        self.recovered
    }

    /// The sizing policy in effect.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> AofStats {
        self.stats.snapshot()
    }

    /// The tailer task set; exposed for the manager's GC.
    pub(crate) fn tailers(&self) -> &TaskSet {
        &self.tailers
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(AofState::Closed as u8, Ordering::Release);
    }

    fn sticky_error(&self) -> Option<AofError> {
        self.sticky.lock().as_ref().map(|m| AofError::Sticky(m.clone()))
    }

    fn set_sticky(&self, e: &std::io::Error) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        let mut sticky = self.sticky.lock();
        if sticky.is_none() {
            tracing::error!(name = %self.name, error = %e, "append-only file entered sticky error state");
            *sticky = Some(e.to_string());
        }
    }

    fn check_writable(&self) -> Result<(), AofError> {
        if let Some(e) = self.sticky_error() {
            return Err(e);
        }
        match self.state() {
            AofState::Opened => Ok(()),
            AofState::Eof => Err(AofError::Full),
            AofState::Opening | AofState::Closing | AofState::Closed => Err(AofError::Closed),
        }
    }

    /// Grows the physical file so `needed` bytes are backed. Caller
    /// holds the write lock.
    fn ensure_file_size(&self, needed: u64) -> Result<(), AofError> {
        let current = self.file_size.load(Ordering::Acquire);
        if needed <= current {
            return Ok(());
        }
        self.growing.store(true, Ordering::Release);
        let next = self.geometry.next_file_size(current, needed);
        let result = self.file.set_len(next);
        self.growing.store(false, Ordering::Release);
        match result {
            Ok(()) => {
                self.file_size.store(next, Ordering::Release);
                tracing::trace!(name = %self.name, file_size = next, "file grown");
                Ok(())
            }
            Err(e) => {
                let err = AofError::Sticky(e.to_string());
                self.set_sticky(&e);
                Err(err)
            }
        }
    }

    /// Appends `bytes`, blocking on the write mutex if another writer
    /// holds it. Returns the new published size.
    ///
    /// # Errors
    ///
    /// [`AofError::EmptyData`] for an empty payload, [`AofError::TooBig`]
    /// if the payload can never fit, [`AofError::Full`] when the file
    /// has reached its upper bound, plus state and I/O errors.
    pub fn write(&self, bytes: &[u8]) -> Result<u64, AofError> {
        let _guard = self.write_lock.lock();
        self.write_locked(bytes)
    }

    /// As [`write`](Self::write), but fails with [`AofError::WouldBlock`]
    /// instead of waiting when another writer holds the mutex or a
    /// growth truncate is in flight.
    pub fn write_non_blocking(&self, bytes: &[u8]) -> Result<u64, AofError> {
        if self.growing.load(Ordering::Acquire) {
            return Err(AofError::WouldBlock);
        }
        let Some(_guard) = self.write_lock.try_lock() else {
            return Err(AofError::WouldBlock);
        };
        self.write_locked(bytes)
    }

    fn write_locked(&self, bytes: &[u8]) -> Result<u64, AofError> {
        self.check_writable()?;
        if bytes.is_empty() {
            return Err(AofError::EmptyData);
        }
        let len = bytes.len() as u64;
        let begin = self.reserve(len)?;
        let begin_at = usize::try_from(begin).unwrap_or(usize::MAX);
        self.map.write_at(begin_at, bytes);
        self.publish(begin, len);
        Ok(begin + len)
    }

    /// Zero-copy append: reserves `reserve` bytes and hands the region
    /// to `f`, which returns how many bytes it actually wrote. Only
    /// those bytes are published.
    ///
    /// # Errors
    ///
    /// As [`write`](Self::write); `reserve == 0` is
    /// [`AofError::EmptyData`].
    pub fn append<F>(&self, reserve: u64, f: F) -> Result<u64, AofError>
    where
        F: FnOnce(AppendSlot<'_>) -> u64,
    {
        let _guard = self.write_lock.lock();
        self.check_writable()?;
        if reserve == 0 {
            return Err(AofError::EmptyData);
        }
        let begin = self.reserve(reserve)?;
        let begin_at = usize::try_from(begin).unwrap_or(usize::MAX);
        let end_at = usize::try_from(begin + reserve).unwrap_or(usize::MAX);
        let n = f(AppendSlot {
            begin,
            end: begin + reserve,
            written: self.map.slice(0, begin_at),
            tail: self.map.slice_mut(begin_at, end_at),
        })
        .min(reserve);
        self.publish(begin, n);
        Ok(begin + n)
    }

    /// Checks capacity and backs `len` payload bytes (plus sentinel)
    /// with physical file. Returns the append offset. Caller holds the
    /// write lock.
    fn reserve(&self, len: u64) -> Result<u64, AofError> {
        let magic = if self.magic { MAGIC_LEN } else { 0 };
        if len + magic > self.geometry.size_upper {
            return Err(AofError::TooBig {
                len,
                upper: self.geometry.size_upper,
            });
        }
        let begin = self.size.load(Ordering::Acquire);
        let new_end = begin + len + magic;
        if new_end > self.map.len() as u64 {
            return Err(AofError::Full);
        }
        self.ensure_file_size(new_end)?;
        Ok(begin)
    }

    /// Stores the tail sentinel past the payload, release-publishes the
    /// new size, and wakes the tailers. Caller holds the write lock.
    fn publish(&self, begin: u64, n: u64) {
        let new_size = begin + n;
        if self.magic {
            let at = usize::try_from(new_size).unwrap_or(usize::MAX);
            self.map.store_u64_le(at, TAIL_MAGIC);
        }
        self.size.store(new_size, Ordering::Release);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(n, Ordering::Relaxed);
        self.tailers.wake();
    }

    /// Reads the published bytes in `[begin, end)`, clamped to the
    /// current size.
    #[must_use]
    pub fn read(&self, begin: u64, end: u64) -> &[u8] {
        let size = self.size();
        let begin = begin.min(size);
        let end = end.min(size).max(begin);
        self.map.slice(
            usize::try_from(begin).unwrap_or(0),
            usize::try_from(end).unwrap_or(0),
        )
    }

    /// Tailer view of the mapping: `[begin, end)` without clamping to
    /// the size the caller may not have re-read.
    pub(crate) fn bytes(&self, begin: u64, end: u64) -> &[u8] {
        self.map.slice(
            usize::try_from(begin).unwrap_or(0),
            usize::try_from(end).unwrap_or(0),
        )
    }

    /// Asynchronously flushes newly published bytes to disk. A no-op if
    /// nothing was published since the last flush.
    ///
    /// # Errors
    ///
    /// Propagates msync failures and sets the sticky error.
    pub fn flush(&self) -> Result<(), AofError> {
        if let Some(e) = self.sticky_error() {
            return Err(e);
        }
        let size = self.size();
        if size <= self.flush_size.load(Ordering::Acquire) {
            return Ok(());
        }
        let len = usize::try_from(size).unwrap_or(usize::MAX);
        if let Err(e) = self.map.flush_range(len) {
            if let AofError::Io(io) = &e {
                self.set_sticky(io);
            }
            return Err(e);
        }
        self.flush_size.store(size, Ordering::Release);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Durably syncs the published bytes: msync plus fsync.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures and sets the sticky error.
    pub fn sync(&self) -> Result<(), AofError> {
        if let Some(e) = self.sticky_error() {
            return Err(e);
        }
        let size = self.size();
        let len = usize::try_from(size).unwrap_or(usize::MAX);
        if let Err(e) = self.map.sync_range(len) {
            if let AofError::Io(io) = &e {
                self.set_sticky(io);
            }
            return Err(e);
        }
        if let Err(e) = self.file.sync_all() {
            let err = AofError::Sticky(e.to_string());
            self.set_sticky(&e);
            return Err(err);
        }
        self.flush_size.store(size, Ordering::Release);
        self.sync_size.store(size, Ordering::Release);
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Finishes the file: replaces the tail sentinel with the EOF
    /// sentinel, truncates to the final length, and fsyncs. The file is
    /// read-only from then on. Idempotent once finished.
    ///
    /// # Errors
    ///
    /// [`AofError::Closed`] if the file is closing or closed;
    /// I/O failures set the sticky error.
    pub fn finish(&self) -> Result<(), AofError> {
        let _guard = self.write_lock.lock();
        match self.state() {
            AofState::Opened => {}
            AofState::Eof => return Ok(()),
            AofState::Opening | AofState::Closing | AofState::Closed => {
                return Err(AofError::Closed);
            }
        }
        if let Some(e) = self.sticky_error() {
            return Err(e);
        }

        let size = self.size();
        let final_len = size + if self.magic { MAGIC_LEN } else { 0 };
        if self.magic {
            self.ensure_file_size(final_len)?;
            let at = usize::try_from(size).unwrap_or(usize::MAX);
            self.map.store_u64_le(at, EOF_MAGIC);
        }
        let len = usize::try_from(final_len).unwrap_or(usize::MAX);
        if let Err(e) = self.map.sync_range(len) {
            if let AofError::Io(io) = &e {
                self.set_sticky(io);
            }
            return Err(e);
        }
        if let Err(e) = self.file.set_len(final_len).and_then(|()| self.file.sync_all()) {
            let err = AofError::Sticky(e.to_string());
            self.set_sticky(&e);
            return Err(err);
        }
        self.file_size.store(final_len, Ordering::Release);
        self.flush_size.store(size, Ordering::Release);
        self.sync_size.store(size, Ordering::Release);
        self.state.store(AofState::Eof as u8, Ordering::Release);
        self.tailers.wake();
        tracing::debug!(name = %self.name, size, "append-only file finished");
        Ok(())
    }

    /// Closes the file: no new writes or subscribers; tailers are woken
    /// to observe the closure and the file detaches from its manager.
    /// Destruction happens once the last tailer departs. Idempotent.
    pub fn close(self: &Arc<Self>) {
        let state = self.state();
        if matches!(state, AofState::Closing | AofState::Closed) {
            return;
        }
        self.state.store(AofState::Closing as u8, Ordering::Release);
        self.tailers.close();
        self.tailers.wake();
        if let Some(manager) = self.manager.upgrade() {
            manager.detach(self);
        } else if self.tailers.is_empty() {
            self.mark_closed();
        }
        tracing::debug!(name = %self.name, "append-only file closing");
    }

    /// Spawns a tailer for `consumer` on `reactor`. The consumer sees
    /// every published byte exactly once, as a contiguous prefix.
    ///
    /// # Errors
    ///
    /// [`AofError::Closed`] once the file is closing, [`AofError::Full`]
    /// if the reactor's spawn queue rejects the task.
    pub fn subscribe(
        self: &Arc<Self>,
        reactor: &ReactorHandle,
        consumer: impl Consumer + 'static,
    ) -> Result<TaskHandle, AofError> {
        self.subscribe_inner(reactor, consumer, None)
    }

    /// As [`subscribe`](Self::subscribe), but the tailer also re-polls
    /// itself every `interval` regardless of wakes.
    ///
    /// # Errors
    ///
    /// As [`subscribe`](Self::subscribe).
    pub fn subscribe_interval(
        self: &Arc<Self>,
        reactor: &ReactorHandle,
        consumer: impl Consumer + 'static,
        interval: Duration,
    ) -> Result<TaskHandle, AofError> {
        self.subscribe_inner(reactor, consumer, Some(interval))
    }

    fn subscribe_inner(
        self: &Arc<Self>,
        reactor: &ReactorHandle,
        consumer: impl Consumer + 'static,
        interval: Option<Duration>,
    ) -> Result<TaskHandle, AofError> {
        if matches!(self.state(), AofState::Closing | AofState::Closed) {
            return Err(AofError::Closed);
        }
        let tailer = Tailer::new(Arc::clone(self), Box::new(consumer), interval);
        self.tailers.spawn_on(reactor, tailer).map_err(|e| match e {
            CoreError::SetClosed | CoreError::ReactorStopped | CoreError::Shutdown => {
                AofError::Closed
            }
            CoreError::QueueFull | CoreError::BlockingTimeout(_) => AofError::Full,
        })
    }

    /// Number of live tailers.
    #[must_use]
    pub fn tailer_count(&self) -> usize {
        self.tailers.len()
    }
}

impl std::fmt::Debug for Aof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aof")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("size", &self.size())
            .field("file_size", &self.file_size())
            .field("tailers", &self.tailers.len())
            .finish_non_exhaustive()
    }
}
