// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Per-repository sync metadata.
//!
//! After every sync attempt, bbsync records how it went under a family of
//! keys namespaced by the repository's slug:
//!
//! ```text
//! REPO_MY_REPO_DEFAULT_BRANCH=main
//! REPO_MY_REPO_LAST_SYNC=2025-10-24T12:34:56Z
//! REPO_MY_REPO_LAST_STATUS=updated
//! REPO_MY_REPO_LAST_COMMIT=abc123
//! REPO_MY_REPO_ACTIVE_BRANCH=main
//! ```
//!
//! [`record_outcome`] is the only thing that writes these keys. It writes all
//! of them in the same save, so a reader never sees a fresh timestamp next to
//! a stale status.

use crate::{
    migrate::migrate,
    repo_list::ensure_url_in_repo_list,
    store::{EnvMap, EnvStore, StoreError},
};

use chrono::Utc;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use tracing::{info, instrument};

/// Layout of `LAST_SYNC` timestamps, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Metadata field recorded per repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    DefaultBranch,
    LastSync,
    LastStatus,
    LastCommit,
    ActiveBranch,
}

impl MetadataField {
    pub const ALL: [Self; 5] = [
        Self::DefaultBranch,
        Self::LastSync,
        Self::LastStatus,
        Self::LastCommit,
        Self::ActiveBranch,
    ];

    /// Key suffix of field.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::DefaultBranch => "DEFAULT_BRANCH",
            Self::LastSync => "LAST_SYNC",
            Self::LastStatus => "LAST_STATUS",
            Self::LastCommit => "LAST_COMMIT",
            Self::ActiveBranch => "ACTIVE_BRANCH",
        }
    }
}

/// Key namespace of one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoKey(String);

impl RepoKey {
    /// Derive key namespace from repository slug.
    ///
    /// Slug is uppercased, and every character outside `[A-Z0-9_]` becomes an
    /// underscore, so the resulting keys always survive a reload of the env
    /// file.
    ///
    /// # Errors
    ///
    /// - Return [`MetadataError::EmptySlug`] if slug is blank.
    pub fn from_slug(slug: &str) -> Result<Self> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(MetadataError::EmptySlug);
        }

        let key = slug
            .chars()
            .map(|ch| match ch.to_ascii_uppercase() {
                upper @ ('A'..='Z' | '0'..='9' | '_') => upper,
                _ => '_',
            })
            .collect();

        Ok(Self(key))
    }

    /// Full env key of a metadata field.
    pub fn field(&self, field: MetadataField) -> String {
        format!("REPO_{}_{}", self.0, field.suffix())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for RepoKey {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Outcome of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Fresh working copy was cloned.
    Cloned,

    /// Existing working copy was updated.
    Updated,

    /// Sync attempt failed.
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloned => "cloned",
            Self::Updated => "updated",
            Self::Error => "error",
        }
    }
}

impl Display for SyncStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = MetadataError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim() {
            "cloned" => Ok(Self::Cloned),
            "updated" => Ok(Self::Updated),
            "error" => Ok(Self::Error),
            other => Err(MetadataError::UnknownStatus(other.to_string())),
        }
    }
}

/// State of a working copy after a sync attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalState {
    /// Checked out branch, or short commit for detached HEAD.
    pub active_branch: Option<String>,

    /// Short hash of HEAD commit.
    pub commit: Option<String>,
}

/// Metadata recorded for one repository.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepoMetadata {
    pub default_branch: Option<String>,
    pub last_sync: Option<String>,
    pub last_status: Option<String>,
    pub last_commit: Option<String>,
    pub active_branch: Option<String>,
}

impl RepoMetadata {
    /// Parse recorded status token.
    ///
    /// A missing or blank status yields `None`.
    ///
    /// # Errors
    ///
    /// - Return [`MetadataError::UnknownStatus`] if the recorded token is not
    ///   one bbsync writes.
    pub fn status(&self) -> Result<Option<SyncStatus>> {
        self.last_status
            .as_deref()
            .filter(|status| !status.trim().is_empty())
            .map(str::parse)
            .transpose()
    }
}

/// Current time in [`TIMESTAMP_FORMAT`].
pub fn now_utc() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Record outcome of a sync attempt in env file.
///
/// Runs as one critical section: load, migrate legacy keys, list the URL,
/// write every metadata field, save. An empty default branch never replaces a
/// previously recorded one.
///
/// # Errors
///
/// - Return [`MetadataError::EmptySlug`] if slug is blank.
/// - Return [`MetadataError::Store`] if env file cannot be loaded or saved.
#[instrument(skip(store, local_state), level = "debug")]
pub fn record_outcome(
    store: &EnvStore,
    slug: &str,
    repository_url: &str,
    default_branch: &str,
    status: SyncStatus,
    local_state: &LocalState,
) -> Result<()> {
    let key = RepoKey::from_slug(slug)?;
    store.transaction(|map| {
        migrate(map);
        let synced_at = now_utc();
        apply_outcome(map, &key, repository_url, default_branch, status, local_state, &synced_at);
    })?;
    info!("recorded {status} for {slug}");

    Ok(())
}

fn apply_outcome(
    map: &mut EnvMap,
    key: &RepoKey,
    repository_url: &str,
    default_branch: &str,
    status: SyncStatus,
    local_state: &LocalState,
    synced_at: &str,
) {
    ensure_url_in_repo_list(map, repository_url);

    let default_branch = default_branch.trim();
    if !default_branch.is_empty() {
        map.insert(key.field(MetadataField::DefaultBranch), default_branch);
    }
    map.insert(key.field(MetadataField::LastSync), synced_at);
    map.insert(key.field(MetadataField::LastStatus), status.as_str());
    map.insert(
        key.field(MetadataField::LastCommit),
        local_state.commit.clone().unwrap_or_default(),
    );
    map.insert(
        key.field(MetadataField::ActiveBranch),
        local_state.active_branch.clone().unwrap_or_default(),
    );
}

/// Read recorded metadata of a repository back out of env mapping.
///
/// # Errors
///
/// - Return [`MetadataError::EmptySlug`] if slug is blank.
pub fn read_metadata(map: &EnvMap, slug: &str) -> Result<RepoMetadata> {
    let key = RepoKey::from_slug(slug)?;
    let read = |field| map.get(&key.field(field)).map(str::to_string);

    Ok(RepoMetadata {
        default_branch: read(MetadataField::DefaultBranch),
        last_sync: read(MetadataField::LastSync),
        last_status: read(MetadataField::LastStatus),
        last_commit: read(MetadataField::LastCommit),
        active_branch: read(MetadataField::ActiveBranch),
    })
}

/// Metadata error types.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// Env file cannot be loaded or saved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Slug does not name anything.
    #[error("repository slug is empty")]
    EmptySlug,

    /// Status token is not part of the vocabulary.
    #[error("unknown sync status {0:?}")]
    UnknownStatus(String),
}

/// Friendly result alias :3
type Result<T, E = MetadataError> = std::result::Result<T, E>;
