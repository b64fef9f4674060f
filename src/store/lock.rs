// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cross-process locking for the env file.
//!
//! Every critical section over the env file is guarded by an exclusive
//! advisory lock taken on an auxiliary __lock marker__ that sits next to the
//! target, i.e., `sync.env` is guarded by `sync.env.lock`. The marker is
//! created on demand, held open for as long as the [`FileLock`] guard lives,
//! and removed again on release. Release happens on drop, so every exit path
//! out of a critical section gives the lock back, including early returns
//! through `?` and unwinding panics.
//!
//! # Lock Backends
//!
//! The actual locking primitive depends on the platform. Each platform gets its
//! own [`LockBackend`], and [`SystemBackend`] selects the right one at compile
//! time. Nothing outside of this module ever needs to care which one is in use.
//!
//! # Marker Removal
//!
//! Removing the marker on release means a waiter can end up holding a lock on
//! a marker that no longer exists at the marker path. The Unix backend checks
//! that the file it locked is still the one at the marker path, and retries
//! otherwise. The marker is only ever removed by whoever currently holds it.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Suffix appended to a target path to form its lock marker path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Default bound on how long to wait for a contended lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between two lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Backend selected for the current platform.
#[cfg(unix)]
pub type SystemBackend = UnixFlock;

/// Backend selected for the current platform.
#[cfg(not(unix))]
pub type SystemBackend = WindowsLockFile;

/// Advisory exclusive lock over a marker path.
pub trait LockBackend: Send + Sync + 'static {
    /// Try once to take an exclusive hold on the marker at `marker`.
    ///
    /// Returns `Ok(None)` if somebody else currently holds it.
    fn try_acquire(&self, marker: &Path) -> io::Result<Option<File>>;

    /// Give up the hold on `file` and clean up the marker.
    ///
    /// Must never fail. Cleanup is best-effort.
    fn release(&self, file: File, marker: &Path);
}

/// Scoped exclusive hold over a target path.
///
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct FileLock<B = SystemBackend>
where
    B: LockBackend,
{
    marker: PathBuf,
    file: Option<File>,
    backend: B,
}

impl FileLock<SystemBackend> {
    /// Acquire exclusive lock over `target` with platform backend.
    ///
    /// Polls every [`DEFAULT_POLL_INTERVAL`] until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Timeout`] if lock is still contended after
    ///   `timeout`.
    /// - Return [`LockError::Marker`] if lock marker cannot be opened.
    pub fn acquire(target: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        Self::acquire_with(SystemBackend::default(), target, timeout, DEFAULT_POLL_INTERVAL)
    }
}

impl<B> FileLock<B>
where
    B: LockBackend,
{
    /// Acquire exclusive lock over `target` through a given backend.
    ///
    /// Never waits longer than `timeout` plus one `poll_interval`.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Timeout`] if lock is still contended after
    ///   `timeout`.
    /// - Return [`LockError::Marker`] if lock marker cannot be opened.
    #[instrument(skip(backend, target), level = "debug")]
    pub fn acquire_with(
        backend: B,
        target: impl AsRef<Path>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let marker = marker_path(target.as_ref());
        let start = Instant::now();

        loop {
            match backend.try_acquire(&marker) {
                Ok(Some(file)) => {
                    debug!("acquired lock {:?}", marker.display());
                    return Ok(Self {
                        marker,
                        file: Some(file),
                        backend,
                    });
                }
                Ok(None) => {}
                Err(source) => return Err(LockError::Marker { source, marker }),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    path: target.as_ref().to_path_buf(),
                    timeout,
                });
            }

            thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }

    /// Path to lock marker being held.
    pub fn marker(&self) -> &Path {
        self.marker.as_path()
    }
}

impl<B> Drop for FileLock<B>
where
    B: LockBackend,
{
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.backend.release(file, &self.marker);
            debug!("released lock {:?}", self.marker.display());
        }
    }
}

/// Lock marker path of a target path.
pub fn marker_path(target: &Path) -> PathBuf {
    let mut marker = OsString::from(target.as_os_str());
    marker.push(LOCK_SUFFIX);
    PathBuf::from(marker)
}

fn open_marker(marker: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(marker)
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Lock backend through `flock(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixFlock;

#[cfg(unix)]
impl UnixFlock {
    fn still_linked(file: &File, marker: &Path) -> io::Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let held = file.metadata()?;
        match fs::metadata(marker) {
            Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(unix)]
impl LockBackend for UnixFlock {
    fn try_acquire(&self, marker: &Path) -> io::Result<Option<File>> {
        let file = open_marker(marker)?;
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if is_contended(&err) => return Ok(None),
            Err(err) => return Err(err),
        }

        // INVARIANT: Only count the lock if we locked the marker currently at the path.
        //   - A previous holder may have unlinked it while we were waiting on it.
        if !Self::still_linked(&file, marker)? {
            debug!("lock marker {:?} was replaced, retrying", marker.display());
            return Ok(None);
        }

        Ok(Some(file))
    }

    fn release(&self, file: File, marker: &Path) {
        // INVARIANT: Unlink marker before unlocking so waiters notice the swap.
        if let Err(err) = fs::remove_file(marker) {
            debug!("cannot remove lock marker {:?}: {err}", marker.display());
        }

        if let Err(err) = fs2::FileExt::unlock(&file) {
            debug!("cannot unlock {:?}: {err}", marker.display());
        }
    }
}

/// Lock backend through `LockFileEx`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsLockFile;

impl LockBackend for WindowsLockFile {
    fn try_acquire(&self, marker: &Path) -> io::Result<Option<File>> {
        let file = match open_marker(marker) {
            Ok(file) => file,
            // Marker is pending deletion by previous holder.
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => return Ok(None),
            Err(err) => return Err(err),
        };

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(file)),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn release(&self, file: File, marker: &Path) {
        if let Err(err) = fs2::FileExt::unlock(&file) {
            debug!("cannot unlock {:?}: {err}", marker.display());
        }
        drop(file);

        if let Err(err) = fs::remove_file(marker) {
            debug!("cannot remove lock marker {:?}: {err}", marker.display());
        }
    }
}

/// Lock acquisition error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock was still held by somebody else when the wait bound ran out.
    #[error("timed out after {timeout:?} waiting for lock on {:?}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    /// Lock marker cannot be opened or locked.
    #[error("failed to lock marker {:?}", marker.display())]
    Marker {
        #[source]
        source: io::Error,
        marker: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LockError> = std::result::Result<T, E>;
