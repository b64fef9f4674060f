// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror Bitbucket repositories into local working copies.
//!
//! Bbsync keeps everything it knows in one `.env` style __env file__: global
//! settings, the list of repositories to mirror, and sync metadata for each of
//! them. The [`store`] module owns all access to that file, so every update is
//! one locked and atomic read-modify-write cycle, even when several sync runs
//! share the same env file.

pub mod config;
pub mod metadata;
pub mod migrate;
pub mod path;
pub mod remote;
pub mod repo_list;
pub mod store;
pub mod sync;
pub mod vcs;

pub use config::{ensure_env_defaults, Destination, Settings};
pub use metadata::{record_outcome, LocalState, SyncStatus};
pub use repo_list::{ensure_url_in_repo_list, normalize_url_for_list, parse_repo_list};
pub use store::{EnvMap, EnvStore};
