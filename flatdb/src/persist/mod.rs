// Durability coalescer - collapses bursts of snapshot writes into the latest one

use crate::error::Result;
use crate::storage;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

type WriteFn = dyn Fn(&Path, &str) -> io::Result<()> + Send + Sync;

/// Per-path write state.
#[derive(Debug, Default)]
enum WriteState {
    #[default]
    Idle,
    Writing,
    /// A write is in flight and this newer snapshot waits behind it.
    WritingWithPending(String),
}

#[derive(Debug, Default)]
struct PathSlot {
    state: WriteState,
    /// First background failure since the last flush.
    failure: Option<io::Error>,
    completed: u64,
}

impl PathSlot {
    fn is_busy(&self) -> bool {
        !matches!(self.state, WriteState::Idle)
    }
}

struct Shared {
    slots: Mutex<HashMap<PathBuf, PathSlot>>,
    /// Signalled whenever a path goes back to idle.
    settled: Condvar,
    write: Box<WriteFn>,
}

/// Keeps files in sync with the most recent snapshot handed to it.
///
/// At most one write per path is in flight. Snapshots that arrive while a
/// write is running replace each other in a single pending slot, and the
/// latest one is written as soon as the running write finishes. A running
/// write is never cancelled.
///
/// Background writes run on short-lived threads; [`Coalescer::flush`] is the
/// join point that waits for them and reports their failures.
#[derive(Clone)]
pub struct Coalescer {
    shared: Arc<Shared>,
}

impl Coalescer {
    /// A coalescer that writes with [`storage::write_atomic`].
    pub fn new() -> Self {
        Self::with_writer(storage::write_atomic)
    }

    /// A coalescer that writes through `write` instead of the atomic file writer.
    pub fn with_writer<F>(write: F) -> Self
    where
        F: Fn(&Path, &str) -> io::Result<()> + Send + Sync + 'static,
    {
        Coalescer {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                settled: Condvar::new(),
                write: Box::new(write),
            }),
        }
    }

    /// Schedule `snapshot` to be written to `path` without waiting for it.
    ///
    /// Only fails if a writer thread cannot be started. Write failures are
    /// logged and reported by the next [`flush`](Self::flush).
    pub fn persist(&self, path: &Path, snapshot: String) -> Result<()> {
        let mut slots = self.shared.slots.lock();
        let slot = slots.entry(path.to_path_buf()).or_default();

        if slot.is_busy() {
            if matches!(slot.state, WriteState::WritingWithPending(_)) {
                log::trace!("Superseding pending snapshot for {}", path.display());
            }
            slot.state = WriteState::WritingWithPending(snapshot);
            return Ok(());
        }

        slot.state = WriteState::Writing;
        drop(slots);
        self.spawn_writer(path.to_path_buf(), snapshot)
    }

    /// Write `snapshot` to `path` and wait for that write to finish.
    ///
    /// Any snapshot still pending for the path is older than this one and is
    /// discarded; a write already in flight is allowed to finish first.
    pub fn persist_sync(&self, path: &Path, snapshot: String) -> Result<()> {
        let mut slots = self.shared.slots.lock();
        if let Some(slot) = slots.get_mut(path) {
            if matches!(slot.state, WriteState::WritingWithPending(_)) {
                log::debug!("Discarding pending snapshot for {}", path.display());
                slot.state = WriteState::Writing;
            }
        }
        while slots.get(path).map_or(false, PathSlot::is_busy) {
            self.shared.settled.wait(&mut slots);
        }
        slots.entry(path.to_path_buf()).or_default().state = WriteState::Writing;
        drop(slots);

        let guard = SettleOnPanic {
            shared: &*self.shared,
            path,
        };
        let outcome = (self.shared.write)(path, &snapshot);
        drop(guard);

        let mut slots = self.shared.slots.lock();
        let slot = slots.entry(path.to_path_buf()).or_default();
        slot.completed += 1;
        let pending = match std::mem::take(&mut slot.state) {
            WriteState::WritingWithPending(next) => {
                slot.state = WriteState::Writing;
                Some(next)
            }
            _ => {
                self.shared.settled.notify_all();
                None
            }
        };
        drop(slots);

        if let Some(next) = pending {
            self.spawn_writer(path.to_path_buf(), next)?;
        }
        outcome?;
        Ok(())
    }

    /// Block until no write for `path` is running or pending, then report the
    /// first background failure recorded for it since the last flush.
    pub fn flush(&self, path: &Path) -> Result<()> {
        let mut slots = self.shared.slots.lock();
        while slots.get(path).map_or(false, PathSlot::is_busy) {
            self.shared.settled.wait(&mut slots);
        }
        match slots.get_mut(path).and_then(|slot| slot.failure.take()) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// [`flush`](Self::flush) for every path this coalescer has written to.
    pub fn flush_all(&self) -> Result<()> {
        let mut slots = self.shared.slots.lock();
        while slots.values().any(PathSlot::is_busy) {
            self.shared.settled.wait(&mut slots);
        }
        let mut first = None;
        for slot in slots.values_mut() {
            if let Some(e) = slot.failure.take() {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Whether a write for `path` is running or pending.
    pub fn is_busy(&self, path: &Path) -> bool {
        self.shared.slots.lock().get(path).map_or(false, PathSlot::is_busy)
    }

    /// Number of writes to `path` that have run to completion, successful or not.
    pub fn writes_completed(&self, path: &Path) -> u64 {
        self.shared.slots.lock().get(path).map_or(0, |slot| slot.completed)
    }

    fn spawn_writer(&self, path: PathBuf, snapshot: String) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let target = path.clone();
        let spawned = thread::Builder::new()
            .name("flatdb-writer".into())
            .spawn(move || write_loop(&shared, target, snapshot));

        if let Err(e) = spawned {
            log::error!("Failed to start writer for {}: {e}", path.display());
            let mut slots = self.shared.slots.lock();
            if let Some(slot) = slots.get_mut(&path) {
                slot.state = WriteState::Idle;
            }
            self.shared.settled.notify_all();
            return Err(e.into());
        }
        Ok(())
    }
}

impl Default for Coalescer {
    fn default() -> Self {
        Coalescer::new()
    }
}

// Runs on a writer thread until the path has nothing left to write.
// A failed write does not stop the loop: a pending snapshot is still attempted.
fn write_loop(shared: &Shared, path: PathBuf, mut snapshot: String) {
    let _guard = SettleOnPanic {
        shared,
        path: &path,
    };
    loop {
        let outcome = (shared.write)(&path, &snapshot);

        let mut slots = shared.slots.lock();
        let slot = slots.entry(path.clone()).or_default();
        slot.completed += 1;
        if let Err(e) = outcome {
            log::error!("Failed to write snapshot to {}: {e}", path.display());
            slot.failure.get_or_insert(e);
        }

        match std::mem::replace(&mut slot.state, WriteState::Writing) {
            WriteState::WritingWithPending(next) => snapshot = next,
            _ => {
                slot.state = WriteState::Idle;
                shared.settled.notify_all();
                return;
            }
        }
    }
}

/// Puts a path back to idle if the writer panics, so flushes do not wait forever.
struct SettleOnPanic<'a> {
    shared: &'a Shared,
    path: &'a Path,
}

impl Drop for SettleOnPanic<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        log::error!("Writer panicked while writing {}", self.path.display());
        let mut slots = self.shared.slots.lock();
        if let Some(slot) = slots.get_mut(self.path) {
            slot.state = WriteState::Idle;
            slot.completed += 1;
            slot.failure.get_or_insert_with(|| {
                io::Error::new(io::ErrorKind::Other, "writer panicked")
            });
        }
        self.shared.settled.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;
    use tempfile::TempDir;

    /// A writer that blocks each write until the test releases it, recording
    /// every snapshot it was asked to write.
    fn gated_writer(
        fail_first: bool,
    ) -> (Coalescer, mpsc::Sender<()>, Arc<Mutex<Vec<String>>>) {
        let (release, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);

        let coalescer = Coalescer::with_writer(move |path: &Path, snapshot: &str| {
            let _ = gate.lock().recv();
            let attempt = {
                let mut seen = record.lock();
                seen.push(snapshot.to_string());
                seen.len()
            };
            if fail_first && attempt == 1 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            storage::write_atomic(path, snapshot)
        });
        (coalescer, release, seen)
    }

    #[test]
    fn test_burst_collapses_to_latest_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        let (coalescer, release, seen) = gated_writer(false);

        coalescer.persist(&path, "S1".into()).unwrap();
        coalescer.persist(&path, "S2".into()).unwrap();
        coalescer.persist(&path, "S3".into()).unwrap();
        assert!(coalescer.is_busy(&path));

        drop(release);
        coalescer.flush(&path).unwrap();

        assert_eq!(*seen.lock(), vec!["S1".to_string(), "S3".to_string()]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "S3");
        assert_eq!(coalescer.writes_completed(&path), 2);
        assert!(!coalescer.is_busy(&path));
    }

    #[test]
    fn test_idle_request_writes_immediately() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        let coalescer = Coalescer::new();

        coalescer.persist(&path, "[]".into()).unwrap();
        coalescer.flush(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert_eq!(coalescer.writes_completed(&path), 1);

        coalescer.persist(&path, "[{\"a\":1}]".into()).unwrap();
        coalescer.flush(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[{\"a\":1}]");
        assert_eq!(coalescer.writes_completed(&path), 2);
    }

    #[test]
    fn test_failed_write_still_attempts_pending_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        let (coalescer, release, seen) = gated_writer(true);

        coalescer.persist(&path, "S1".into()).unwrap();
        coalescer.persist(&path, "S2".into()).unwrap();
        drop(release);

        let err = coalescer.flush(&path).unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
        assert_eq!(*seen.lock(), vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "S2");

        // The failure is reported once
        coalescer.flush(&path).unwrap();
    }

    #[test]
    fn test_sync_write_supersedes_pending_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        let (coalescer, release, seen) = gated_writer(false);

        coalescer.persist(&path, "S1".into()).unwrap();
        coalescer.persist(&path, "S2".into()).unwrap();
        // Release S1 only once the sync write is already waiting on it
        let releaser = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            drop(release);
        });
        coalescer.persist_sync(&path, "S3".into()).unwrap();
        releaser.join().unwrap();

        assert_eq!(*seen.lock(), vec!["S1".to_string(), "S3".to_string()]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "S3");
        assert!(!coalescer.is_busy(&path));
    }

    #[test]
    fn test_sync_write_reports_its_own_failure() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        let (coalescer, release, _seen) = gated_writer(true);
        drop(release);

        assert!(coalescer.persist_sync(&path, "S1".into()).is_err());
        coalescer.persist_sync(&path, "S2".into()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "S2");
    }

    #[test]
    fn test_paths_are_independent() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.json");
        let b = tmp.path().join("b.json");
        let coalescer = Coalescer::new();

        coalescer.persist(&a, "A".into()).unwrap();
        coalescer.persist(&b, "B".into()).unwrap();
        coalescer.flush_all().unwrap();

        assert_eq!(std::fs::read_to_string(&a).unwrap(), "A");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "B");
    }

    #[test]
    fn test_panicking_writer_does_not_block_flush() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        let coalescer = Coalescer::with_writer(|path: &Path, snapshot: &str| {
            if snapshot == "boom" {
                panic!("writer exploded");
            }
            storage::write_atomic(path, snapshot)
        });

        coalescer.persist(&path, "boom".into()).unwrap();
        let err = coalescer.flush(&path).unwrap_err();
        assert!(err.to_string().contains("writer panicked"), "{err}");
        assert!(!coalescer.is_busy(&path));

        coalescer.persist(&path, "S2".into()).unwrap();
        coalescer.flush(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "S2");
    }

    #[test]
    fn test_flush_without_writes_is_ok() {
        let coalescer = Coalescer::new();
        coalescer.flush(Path::new("never-written.json")).unwrap();
        coalescer.flush_all().unwrap();
    }
}
