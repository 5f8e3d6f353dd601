//! The manager: a directory of append-only files with get-or-create
//! open semantics, a background flush loop, and deferred destruction
//! of closed files that still have tailers attached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};

use rivulet_core::reactor::{ReactorHandle, TaskHandle};
use rivulet_core::task::{PollContext, TaskError};
use rivulet_core::taskset::{SwapSlice, TOMBSTONE};

use crate::aof::Aof;
use crate::error::AofError;
use crate::geometry::Geometry;
use crate::recovery::RecoveryOptions;

/// Cadence of the background flush and GC loop.
const BACKGROUND_INTERVAL: Duration = Duration::from_secs(1);

/// How long [`Manager::close`] waits for tailers to depart.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregate counters for a manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManagerStats {
    /// Files currently open.
    pub files: usize,
    /// Successful opens since creation.
    pub opens: u64,
    /// Files closed since creation.
    pub closes: u64,
    /// Writes across the currently open files.
    pub writes: u64,
    /// Payload bytes across the currently open files.
    pub bytes: u64,
    /// Syncs across the currently open files.
    pub syncs: u64,
    /// Background flush passes.
    pub flush_passes: u64,
    /// Closed files still awaiting tailer departure.
    pub gc_pending: usize,
    /// Open and flush failures.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    opens: AtomicU64,
    closes: AtomicU64,
    flush_passes: AtomicU64,
    errors: AtomicU64,
}

enum FileEntry {
    /// A placeholder while another caller runs the open; waiters block
    /// on the condvar until it resolves.
    Opening,
    Ready(Arc<Aof>),
}

pub(crate) struct ManagerInner {
    dir: PathBuf,
    /// Permission bits for files this manager creates.
    mode: u32,
    files: Mutex<FxHashMap<String, FileEntry>>,
    opened: Condvar,
    flush_list: Mutex<SwapSlice<Arc<Aof>>>,
    gc_list: Mutex<SwapSlice<Arc<Aof>>>,
    closed: AtomicBool,
    background: Mutex<Option<TaskHandle>>,
    stats: StatsInner,
}

impl ManagerInner {
    /// Removes a closing file from the map and the flush list. If
    /// tailers are still attached the file moves to the GC list;
    /// otherwise it is closed outright.
    pub(crate) fn detach(&self, aof: &Arc<Aof>) {
        self.files.lock().remove(aof.name());
        {
            let mut flush_list = self.flush_list.lock();
            let index = aof.flush_cell.load(Ordering::Acquire);
            if index != TOMBSTONE {
                flush_list.remove(index);
            }
        }
        if aof.tailers().is_empty() {
            aof.mark_closed();
        } else {
            self.gc_list
                .lock()
                .push(Arc::clone(aof), Arc::clone(&aof.gc_cell));
        }
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
    }

    /// One background pass: flush every open file, then release GC'd
    /// files whose tailers have all departed.
    fn background_pass(&self) {
        let members: Vec<Arc<Aof>> = self.flush_list.lock().iter().map(Arc::clone).collect();
        for aof in &members {
            if let Err(e) = aof.flush() {
                if !e.is_transient() {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(name = %aof.name(), error = %e, "background flush failed");
                }
            }
        }
        self.stats.flush_passes.fetch_add(1, Ordering::Relaxed);
        self.collect_garbage();
    }

    fn collect_garbage(&self) {
        let done: Vec<Arc<Aof>> = self
            .gc_list
            .lock()
            .iter()
            .filter(|aof| aof.tailers().is_empty())
            .map(Arc::clone)
            .collect();
        for aof in done {
            let mut gc_list = self.gc_list.lock();
            let index = aof.gc_cell.load(Ordering::Acquire);
            if index != TOMBSTONE && gc_list.remove(index).is_some() {
                aof.mark_closed();
                tracing::debug!(name = %aof.name(), "append-only file destroyed");
            }
        }
    }

    fn gc_pending(&self) -> usize {
        self.gc_list.lock().len()
    }
}

/// A directory of append-only files.
///
/// Opens are get-or-create: concurrent opens of the same name yield the
/// same [`Aof`] instance, with late callers parked until the first open
/// resolves.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Creates a manager over `dir` with the default file mode
    /// (`0o644`), creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Io`] if the directory cannot be created.
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self, AofError> {
        Self::with_mode(dir, 0o644)
    }

    /// As [`open_dir`](Self::open_dir), with explicit permission bits
    /// for the files this manager creates.
    ///
    /// # Errors
    ///
    /// Returns [`AofError::Io`] if the directory cannot be created.
    pub fn with_mode(dir: impl AsRef<Path>, mode: u32) -> Result<Self, AofError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                dir,
                mode,
                files: Mutex::new(FxHashMap::default()),
                opened: Condvar::new(),
                flush_list: Mutex::new(SwapSlice::new()),
                gc_list: Mutex::new(SwapSlice::new()),
                closed: AtomicBool::new(false),
                background: Mutex::new(None),
                stats: StatsInner::default(),
            }),
        })
    }

    /// The directory this manager owns.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Opens (or creates) the file `name`, recovering its tail.
    /// Get-or-create: an already-open file is returned as-is and the
    /// geometry and recovery arguments are ignored.
    ///
    /// # Errors
    ///
    /// [`AofError::Closed`] once the manager is closed, plus everything
    /// the underlying open can fail with ([`AofError::Corrupted`],
    /// [`AofError::EmptyFile`], [`AofError::IsDirectory`], I/O).
    pub fn open(
        &self,
        name: &str,
        geometry: Geometry,
        recovery: RecoveryOptions,
    ) -> Result<Arc<Aof>, AofError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AofError::Closed);
        }

        {
            let mut files = self.inner.files.lock();
            loop {
                match files.get(name) {
                    Some(FileEntry::Ready(aof)) => return Ok(Arc::clone(aof)),
                    Some(FileEntry::Opening) => {
                        self.inner.opened.wait(&mut files);
                    }
                    None => {
                        files.insert(name.to_string(), FileEntry::Opening);
                        break;
                    }
                }
            }
        }

        let path = self.inner.dir.join(name);
        let result = Aof::open(
            name,
            path,
            geometry,
            recovery,
            self.inner.mode,
            Arc::downgrade(&self.inner),
        );

        let mut files = self.inner.files.lock();
        match result {
            Ok(aof) => {
                let aof = Arc::new(aof);
                files.insert(name.to_string(), FileEntry::Ready(Arc::clone(&aof)));
                self.inner.opened.notify_all();
                drop(files);
                self.inner
                    .flush_list
                    .lock()
                    .push(Arc::clone(&aof), Arc::clone(&aof.flush_cell));
                self.inner.stats.opens.fetch_add(1, Ordering::Relaxed);
                Ok(aof)
            }
            Err(e) => {
                files.remove(name);
                self.inner.opened.notify_all();
                self.inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// An append-only file over an anonymous mapping, with no backing
    /// file.
    ///
    /// # Errors
    ///
    /// Always [`AofError::Unsupported`]; the semantics are reserved but
    /// not implemented.
    pub fn open_anonymous(&self, _geometry: Geometry) -> Result<Arc<Aof>, AofError> {
        Err(AofError::Unsupported("anonymous append-only files"))
    }

    /// Starts the background loop on `reactor`: once per second, flush
    /// every open file and release closed files whose tailers departed.
    ///
    /// # Errors
    ///
    /// [`AofError::Full`] if the reactor's spawn queue rejects the
    /// task; [`AofError::Closed`] if the reactor or manager is down.
    pub fn start_background(&self, reactor: &ReactorHandle) -> Result<(), AofError> {
        let mut background = self.inner.background.lock();
        if background.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = reactor
            .spawn_interval(
                move |_cx: &mut PollContext| {
                    let Some(inner) = weak.upgrade() else {
                        return Err(TaskError::Stop);
                    };
                    if inner.closed.load(Ordering::Acquire) {
                        return Err(TaskError::Stop);
                    }
                    inner.background_pass();
                    Ok(())
                },
                BACKGROUND_INTERVAL,
            )
            .map_err(|e| match e {
                rivulet_core::CoreError::QueueFull => AofError::Full,
                _ => AofError::Closed,
            })?;
        *background = Some(handle);
        Ok(())
    }

    /// Flushes every open file once, synchronously on this thread.
    pub fn flush_all(&self) {
        self.inner.background_pass();
    }

    /// Number of open files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.files.lock().len()
    }

    /// Returns true when no files are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot, aggregating the per-file counters of every
    /// open file.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let (mut files, mut writes, mut bytes, mut syncs) = (0, 0, 0, 0);
        for entry in self.inner.files.lock().values() {
            files += 1;
            if let FileEntry::Ready(aof) = entry {
                let s = aof.stats();
                writes += s.writes;
                bytes += s.bytes;
                syncs += s.syncs;
            }
        }
        ManagerStats {
            files,
            opens: self.inner.stats.opens.load(Ordering::Relaxed),
            closes: self.inner.stats.closes.load(Ordering::Relaxed),
            writes,
            bytes,
            syncs,
            flush_passes: self.inner.stats.flush_passes.load(Ordering::Relaxed),
            gc_pending: self.inner.gc_pending(),
            errors: self.inner.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Closes the manager: refuses new opens, closes every file, waits
    /// (bounded) for tailers to depart, then stops the background loop.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(dir = %self.inner.dir.display(), "manager closing");

        let open: Vec<Arc<Aof>> = self
            .inner
            .files
            .lock()
            .values()
            .filter_map(|entry| match entry {
                FileEntry::Ready(aof) => Some(Arc::clone(aof)),
                FileEntry::Opening => None,
            })
            .collect();
        for aof in &open {
            aof.close();
        }

        // Tailers need reactor cycles to observe the closure; wait a
        // bounded time for the GC list to drain.
        let deadline = Instant::now() + CLOSE_DRAIN_TIMEOUT;
        while self.inner.gc_pending() > 0 && Instant::now() < deadline {
            self.inner.collect_garbage();
            std::thread::sleep(Duration::from_millis(10));
        }
        let pending = self.inner.gc_pending();
        if pending > 0 {
            tracing::warn!(pending, "manager closed with tailers still attached");
        }

        if let Some(handle) = self.inner.background.lock().take() {
            handle.stop();
        }
        tracing::debug!(dir = %self.inner.dir.display(), "manager closed");
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("dir", &self.inner.dir)
            .field("files", &self.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
