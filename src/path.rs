// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where the env file and the working copies of mirrored
//! repositories are expected to live.

use std::path::{Path, PathBuf};

/// Determine default absolute path to env file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/bbsync/.env` as the default
/// absolute path for the env file. Does not check if the path returned
/// actually exists. The CLI lets `--env-file` or `BBSYNC_ENV_FILE` override
/// this.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_env_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("bbsync").join(".env"))
        .ok_or(NoWayHome)
}

/// Working copy path of a repository under base directory.
pub fn working_copy_dir(base_dir: impl AsRef<Path>, slug: &str) -> PathBuf {
    base_dir.as_ref().join(slug)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
