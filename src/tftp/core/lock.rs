//! Per-filename reader/writer gate shared by every transfer session.
//!
//! Any number of readers may hold a file at once; a writer waits until the
//! file has no readers and no other writer, then holds it alone. Releases
//! broadcast to every waiter, which re-check their condition. No fairness
//! is promised beyond that: a steady stream of readers can keep a writer
//! waiting.
//!
//! Entries are created on first use and dropped from the registry once the
//! last session referencing the filename lets go, so a long-running server
//! touching many distinct files does not accumulate them.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

#[derive(Debug, Default)]
struct FileLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl FileLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct Entry {
    lock: Arc<FileLock>,
    refs: usize,
}

/// Registry of [`FileLock`]s keyed by filename.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks while a writer holds `filename`, then joins the readers.
    pub fn acquire_read(self: &Arc<Self>, filename: &str) -> ReadGuard {
        let lock = self.checkout(filename);
        {
            let mut state = lock.state();
            if state.writer {
                log::debug!("Read of '{}' waiting for writer", filename);
            }
            while state.writer {
                state = lock
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.readers += 1;
            log::debug!("Read lock on '{}' ({} reader(s))", filename, state.readers);
        }

        ReadGuard {
            handle: Handle::new(self, filename, lock),
        }
    }

    /// Blocks until `filename` has neither readers nor a writer.
    pub fn acquire_write(self: &Arc<Self>, filename: &str) -> WriteGuard {
        let lock = self.checkout(filename);
        {
            let mut state = lock.state();
            if state.writer || state.readers > 0 {
                log::debug!(
                    "Write of '{}' waiting (readers={}, writer={})",
                    filename,
                    state.readers,
                    state.writer
                );
            }
            while state.writer || state.readers > 0 {
                state = lock
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.writer = true;
            log::debug!("Write lock on '{}'", filename);
        }

        WriteGuard {
            handle: Handle::new(self, filename, lock),
        }
    }

    /// Takes the write lock only if it is free right now.
    pub fn try_acquire_write(self: &Arc<Self>, filename: &str) -> Option<WriteGuard> {
        let lock = self.checkout(filename);
        let granted = {
            let mut state = lock.state();
            let free = !state.writer && state.readers == 0;
            if free {
                state.writer = true;
            }
            free
        };

        if granted {
            Some(WriteGuard {
                handle: Handle::new(self, filename, lock),
            })
        } else {
            self.checkin(filename);
            None
        }
    }

    /// Number of filenames currently referenced by at least one session.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up or creates the entry and takes a reference on it.
    fn checkout(&self, filename: &str) -> Arc<FileLock> {
        let mut entries = self.entries();
        let entry = entries.entry(filename.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(FileLock::default()),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.lock)
    }

    /// Drops a reference, removing the entry when nobody is left.
    fn checkin(&self, filename: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(filename) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(filename);
            }
        }
    }
}

#[derive(Debug)]
struct Handle {
    registry: Arc<LockRegistry>,
    filename: String,
    lock: Arc<FileLock>,
}

impl Handle {
    fn new(registry: &Arc<LockRegistry>, filename: &str, lock: Arc<FileLock>) -> Self {
        Self {
            registry: Arc::clone(registry),
            filename: filename.to_string(),
            lock,
        }
    }
}

/// Shared access to a file; released on drop.
#[derive(Debug)]
pub struct ReadGuard {
    handle: Handle,
}

impl ReadGuard {
    pub fn filename(&self) -> &str {
        &self.handle.filename
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        {
            let mut state = self.handle.lock.state();
            state.readers -= 1;
            log::debug!(
                "Read lock on '{}' released ({} remaining)",
                self.handle.filename,
                state.readers
            );
        }
        self.handle.lock.released.notify_all();
        self.handle.registry.checkin(&self.handle.filename);
    }
}

/// Exclusive access to a file; released on drop.
#[derive(Debug)]
pub struct WriteGuard {
    handle: Handle,
}

impl WriteGuard {
    pub fn filename(&self) -> &str {
        &self.handle.filename
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.handle.lock.state().writer = false;
        log::debug!("Write lock on '{}' released", self.handle.filename);
        self.handle.lock.released.notify_all();
        self.handle.registry.checkin(&self.handle.filename);
    }
}

/// Either kind of guard, held by a session for its whole lifetime.
#[derive(Debug)]
pub enum FileGuard {
    Read(ReadGuard),
    Write(WriteGuard),
}
