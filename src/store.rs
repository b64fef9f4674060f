// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Env file storage.
//!
//! Bbsync keeps all of its persistent state in one flat `KEY=VALUE` document
//! called the __env file__. This covers global settings, the repository list,
//! and per-repository sync metadata alike.
//!
//! # Critical Sections
//!
//! Nothing held in memory is authoritative. Every mutation of the env file is
//! one critical section: acquire the [`FileLock`], load the whole document,
//! mutate it, write the whole document back, and release the lock. Use
//! [`EnvStore::transaction`] for this. Loading and saving separately leaves a
//! window where a concurrent writer's update can be lost.
//!
//! # Atomic Writes
//!
//! The document is never written in place. Its full content goes into a fresh
//! temporary file inside the same directory as the env file, which is then
//! renamed over the target. Readers thus only ever observe the complete old
//! document or the complete new document. The temporary file must live in the
//! same directory, because rename is only atomic within one file system.
//!
//! # Lock Timeouts
//!
//! Bbsync is a single-operator tool, so availability wins over strict
//! exclusion. If the lock cannot be taken in time, loads fall back to an
//! unlocked read, and saves fall back to an unlocked (but still atomic) write
//! instead of dropping the update.

pub mod document;
pub mod lock;

pub use document::{EnvMap, MalformedLine};
pub use lock::{FileLock, LockError, DEFAULT_LOCK_TIMEOUT};

use std::{
    fs::{self, create_dir_all},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

/// Handle to env file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl EnvStore {
    /// Construct new handle to env file at target path.
    ///
    /// Does not touch the file system.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Use a different bound on lock acquisition.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path to env file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Load the whole env file.
    ///
    /// A missing env file is just an empty mapping.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::CreateDir`] if parent directory cannot be made.
    /// - Return [`StoreError::Lock`] if lock marker cannot be opened.
    /// - Return [`StoreError::Read`] if env file cannot be read.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self) -> Result<EnvMap> {
        let _guard = self.lock("load")?;
        self.read_unlocked()
    }

    /// Replace the whole env file with target mapping.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::CreateDir`] if parent directory cannot be made.
    /// - Return [`StoreError::Lock`] if lock marker cannot be opened.
    /// - Return [`StoreError::Write`] if temporary file cannot be written.
    /// - Return [`StoreError::Persist`] if temporary file cannot be renamed
    ///   over env file.
    #[instrument(skip(self, map), level = "debug")]
    pub fn save(&self, map: &EnvMap) -> Result<()> {
        let _guard = self.lock("save")?;
        self.write_unlocked(map)
    }

    /// Load, edit, and save env file as one critical section.
    ///
    /// The document is saved back even if the editor left it untouched.
    ///
    /// # Errors
    ///
    /// - Return any error [`EnvStore::load`] or [`EnvStore::save`] can.
    #[instrument(skip(self, editor), level = "debug")]
    pub fn transaction<T, F>(&self, editor: F) -> Result<T>
    where
        F: FnOnce(&mut EnvMap) -> T,
    {
        let _guard = self.lock("transaction")?;
        let mut map = self.read_unlocked()?;
        let output = editor(&mut map);
        self.write_unlocked(&map)?;

        Ok(output)
    }

    fn lock(&self, operation: &str) -> Result<Option<FileLock>> {
        self.ensure_parent()?;
        match FileLock::acquire(&self.path, self.lock_timeout) {
            Ok(lock) => Ok(Some(lock)),
            Err(LockError::Timeout { path, timeout }) => {
                warn!(
                    "no lock on {:?} after {timeout:?}, doing unlocked {operation}",
                    path.display()
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                create_dir_all(parent).map_err(|err| StoreError::CreateDir {
                    source: err,
                    path: parent.to_path_buf(),
                })
            }
            _ => Ok(()),
        }
    }

    fn read_unlocked(&self) -> Result<EnvMap> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no env file at {:?} yet", self.path.display());
                return Ok(EnvMap::new());
            }
            Err(err) => {
                return Err(StoreError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        let (map, malformed) = EnvMap::parse(&content);
        for line in malformed {
            warn!("skipping {:?}: {line}", self.path.display());
        }

        Ok(map)
    }

    fn write_unlocked(&self, map: &EnvMap) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let write_err = |err: io::Error| StoreError::Write {
            source: err,
            path: self.path.clone(),
        };

        // INVARIANT: Temporary file shares directory with env file for atomic rename.
        let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
        temp.write_all(map.to_string().as_bytes()).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(&self.path).map_err(|err| StoreError::Persist {
            source: err.error,
            path: self.path.clone(),
        })?;
        debug!("wrote {} keys to {:?}", map.len(), self.path.display());

        Ok(())
    }
}

/// Env file storage error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lock over env file cannot be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Directory holding env file cannot be created.
    #[error("failed to create env file directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Env file cannot be read from.
    #[error("failed to read env file {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Temporary copy of env file cannot be written to.
    #[error("failed to write env file {:?}", path.display())]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Temporary copy of env file cannot replace env file.
    #[error("failed to replace env file {:?}", path.display())]
    Persist {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> EnvMap {
        [
            ("INSECURE", "true"),
            ("BB_BASE_DIR", "/srv/mirror"),
            ("REPO_LIST", "https://a.com/r1\nhttps://b.com/r2"),
            ("REPO_R1_LAST_STATUS", "cloned"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn load_missing_file_is_empty() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = EnvStore::new(dir.path().join("nested").join("sync.env"));
        assert_eq!(store.load()?, EnvMap::new());
        assert!(!store.path().exists());

        Ok(())
    }

    #[test]
    fn save_then_load_round_trips() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = EnvStore::new(dir.path().join("sync.env"));

        store.save(&sample())?;
        assert_eq!(store.load()?, sample());

        Ok(())
    }

    #[test]
    fn save_leaves_no_stray_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = EnvStore::new(dir.path().join("sync.env"));

        store.save(&sample())?;
        store.save(&EnvMap::new())?;
        let names = fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        assert_eq!(names, vec!["sync.env".to_string()]);

        Ok(())
    }

    #[test]
    fn save_regenerates_header() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sync.env");
        fs::write(&path, "# my own notes\nBITBUCKET_USER=jdoe\n")?;

        let store = EnvStore::new(&path);
        let map = store.load()?;
        store.save(&map)?;

        let expect = indoc! {r#"
            # Bitbucket Sync .env
            # Fill required values. INSECURE=true by default.

            BITBUCKET_USER=jdoe
        "#};
        assert_eq!(fs::read_to_string(&path)?, expect);

        Ok(())
    }

    #[test]
    fn transaction_persists_edits() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = EnvStore::new(dir.path().join("sync.env"));
        store.save(&sample())?;

        let old = store.transaction(|map| map.insert("INSECURE", "false"))?;
        assert_eq!(old, Some("true".into()));
        assert_eq!(store.load()?.get("INSECURE"), Some("false"));

        Ok(())
    }

    #[test]
    fn lock_timeout_falls_back_to_unlocked_io() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store =
            EnvStore::new(dir.path().join("sync.env")).with_lock_timeout(Duration::from_millis(50));
        let _held = FileLock::acquire(store.path(), DEFAULT_LOCK_TIMEOUT)?;

        store.save(&sample())?;
        assert_eq!(store.load()?, sample());

        Ok(())
    }
}
