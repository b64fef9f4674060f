// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sync orchestration.
//!
//! Drive one sync attempt per repository: clone or pull its working copy,
//! read back local state, and record the outcome in the env file. Version
//! control calls never run while the env file is locked. Only the final
//! [`record_outcome`] call takes the lock.
//!
//! A failing repository never stops the run. Its outcome is recorded with
//! [`SyncStatus::Error`] and the next repository is attempted.

use crate::{
    config::{keys::REPO_LIST, Destination},
    metadata::{record_outcome, MetadataError, SyncStatus},
    path::working_copy_dir,
    remote::{is_valid_slug, RemoteError, RepoDescriptor, RepositoryLister, StaticLister},
    repo_list::{ensure_url_in_repo_list, RepoList},
    store::{EnvStore, StoreError},
    vcs::{commit_env_file, GitEnv, VcsError, VersionControl},
};

use std::path::PathBuf;
use tracing::{info, instrument, warn};

/// Ask destination for its repositories and add them to repository list.
///
/// Returns the discovered repositories followed by every already listed
/// repository the destination did not report.
///
/// # Errors
///
/// - Return [`SyncError::Remote`] if destination cannot be listed.
/// - Return [`SyncError::Store`] if repository list cannot be updated.
#[instrument(skip(store, lister), level = "debug")]
pub fn discover(
    store: &EnvStore,
    lister: &impl RepositoryLister,
    destination: &Destination,
) -> Result<Vec<RepoDescriptor>> {
    let mut repos = lister.list(destination)?;
    let (added, listed) = store.transaction(|map| {
        let added = repos
            .iter()
            .filter(|repo| ensure_url_in_repo_list(map, &repo.url))
            .count();
        (added, RepoList::from(map.get(REPO_LIST).unwrap_or_default()))
    })?;
    info!("discovered {} repositories, {added} newly listed", repos.len());

    let known = repos.iter().map(|repo| repo.url.as_str()).collect::<RepoList>();
    let leftover = StaticLister::new(listed)
        .list(destination)?
        .into_iter()
        .filter(|repo| !known.contains(&repo.url))
        .collect::<Vec<_>>();
    repos.extend(leftover);

    Ok(repos)
}

/// Mirror repositories into base directory.
#[derive(Debug)]
pub struct Syncer<'store, V> {
    store: &'store EnvStore,
    vcs: V,
    env: GitEnv,
    base_dir: PathBuf,
    auto_commit_env: bool,
}

impl<'store, V> Syncer<'store, V>
where
    V: VersionControl,
{
    pub fn new(store: &'store EnvStore, vcs: V, env: GitEnv, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            vcs,
            env,
            base_dir: base_dir.into(),
            auto_commit_env: false,
        }
    }

    /// Commit env file after every recorded outcome.
    pub fn with_auto_commit(mut self, auto_commit_env: bool) -> Self {
        self.auto_commit_env = auto_commit_env;
        self
    }

    /// Sync one repository and record its outcome.
    ///
    /// The outcome is recorded even if version control fails.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::InvalidSlug`] if slug does not name a single
    ///   directory. Nothing is cloned or recorded then.
    /// - Return [`SyncError::Vcs`] if clone or pull failed.
    /// - Return [`SyncError::Record`] if outcome cannot be recorded.
    #[instrument(skip(self, repo), fields(slug = %repo.slug), level = "debug")]
    pub fn sync_repo(&self, repo: &RepoDescriptor) -> Result<SyncStatus> {
        if !is_valid_slug(&repo.slug) {
            return Err(SyncError::InvalidSlug {
                slug: repo.slug.clone(),
            });
        }

        let dest = working_copy_dir(&self.base_dir, &repo.slug);
        let attempt = self.vcs.sync(&repo.url, &dest, &self.env);
        let status = match &attempt {
            Ok(status) => *status,
            Err(_) => SyncStatus::Error,
        };
        let local_state = self.vcs.local_state(&dest);

        record_outcome(
            self.store,
            &repo.slug,
            &repo.url,
            &repo.default_branch,
            status,
            &local_state,
        )
        .map_err(|err| SyncError::Record {
            slug: repo.slug.clone(),
            source: err,
        })?;

        if self.auto_commit_env {
            let message = format!("bbsync: record {status} for {}", repo.slug);
            if let Err(err) = commit_env_file(self.store.path(), &message) {
                warn!("cannot commit env file: {err}");
            }
        }

        attempt.map_err(|err| SyncError::Vcs {
            slug: repo.slug.clone(),
            source: err,
        })
    }

    /// Sync every repository in order.
    pub fn sync_all<'repo>(
        &self,
        repos: impl IntoIterator<Item = &'repo RepoDescriptor>,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for repo in repos {
            report.push(repo, self.sync_repo(repo));
        }

        report
    }
}

/// Outcome of one repository within a run.
#[derive(Debug)]
pub struct RepoOutcome {
    pub slug: String,
    pub result: Result<SyncStatus>,
}

/// Outcomes of a sync run, in attempt order.
#[derive(Debug, Default)]
pub struct SyncReport {
    outcomes: Vec<RepoOutcome>,
}

impl SyncReport {
    /// Add outcome of a repository, logging failures.
    pub fn push(&mut self, repo: &RepoDescriptor, result: Result<SyncStatus>) {
        if let Err(err) = &result {
            warn!("{err}");
        }

        self.outcomes.push(RepoOutcome {
            slug: repo.slug.clone(),
            result,
        });
    }

    pub fn outcomes(&self) -> &[RepoOutcome] {
        self.outcomes.as_slice()
    }

    /// Slugs of repositories that failed.
    pub fn failed(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.slug.clone())
            .collect()
    }

    /// Collapse report into a single result.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Incomplete`] if any repository failed.
    pub fn into_result(self) -> Result<usize> {
        let failed = self.failed();
        if !failed.is_empty() {
            return Err(SyncError::Incomplete { failed });
        }

        Ok(self.outcomes.len())
    }
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Slug cannot serve as working copy directory name.
    #[error("refusing to sync {slug:?}, not a plain directory name")]
    InvalidSlug { slug: String },

    /// Destination cannot be listed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Repository list cannot be updated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Clone or pull of a repository failed.
    #[error("failed to sync {slug}")]
    Vcs {
        slug: String,
        #[source]
        source: VcsError,
    },

    /// Outcome of a repository cannot be written to env file.
    #[error("failed to record outcome of {slug}")]
    Record {
        slug: String,
        #[source]
        source: MetadataError,
    },

    /// Some repositories of a run failed.
    #[error("{} repositories failed to sync: {}", failed.len(), failed.join(", "))]
    Incomplete { failed: Vec<String> },
}

/// Friendly result alias :3
type Result<T, E = SyncError> = std::result::Result<T, E>;
