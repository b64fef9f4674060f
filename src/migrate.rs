// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Legacy key migration.
//!
//! Early env files tracked each repository through one bare key per
//! repository, e.g., `REPO_MY_REPO=https://host/team/my-repo`. That shape has
//! been superseded by the `REPO_LIST` key. Legacy keys are removed whenever
//! they are encountered, and their URLs can be folded into the repository list
//! on the way out.
//!
//! Migration is a one-way normalization pass over the mapping, not a versioned
//! chain of schema upgrades. Running it on an already migrated mapping does
//! nothing. It never persists anything itself, callers save the mapping within
//! the same critical section that loaded it.

use crate::{
    config::keys::REPO_LIST,
    metadata::MetadataField,
    repo_list::{ensure_url_in_repo_list, normalize_url_for_list},
    store::EnvMap,
};

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};
use url::Url;

static LEGACY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^REPO_[A-Z0-9_]+$").unwrap());

/// What to do with the URL held by a legacy key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LegacyPolicy {
    /// Add http(s) URLs to `REPO_LIST` before removing the key.
    #[default]
    Fold,

    /// Just remove the key.
    Discard,
}

/// Summary of what a migration pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy keys that were removed.
    pub removed: Vec<String>,

    /// URLs that were newly added to `REPO_LIST`.
    pub folded: Vec<String>,
}

impl MigrationReport {
    /// Check if migration pass left mapping untouched.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.folded.is_empty()
    }
}

/// Check if key has the legacy bare per-repository shape.
///
/// Keys carrying a known metadata suffix share the `REPO_<SLUG>` prefix shape
/// but are never legacy keys. Neither is `REPO_LIST`.
pub fn is_legacy_key(key: &str) -> bool {
    key != REPO_LIST
        && LEGACY_KEY.is_match(key)
        && !MetadataField::ALL
            .iter()
            .any(|field| key.ends_with(&format!("_{}", field.suffix())))
}

/// Migrate legacy keys with default [`LegacyPolicy`].
pub fn migrate(map: &mut EnvMap) -> MigrationReport {
    migrate_with(map, LegacyPolicy::default())
}

/// Migrate legacy keys out of mapping in place.
pub fn migrate_with(map: &mut EnvMap, policy: LegacyPolicy) -> MigrationReport {
    let legacy = map
        .keys()
        .filter(|key| is_legacy_key(key))
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut report = MigrationReport::default();
    for key in legacy {
        let Some(value) = map.remove(&key) else {
            continue;
        };

        if policy == LegacyPolicy::Fold
            && is_http_url(&value)
            && ensure_url_in_repo_list(map, &value)
        {
            debug!("folded {key} into {REPO_LIST}");
            report.folded.push(normalize_url_for_list(&value));
        }

        report.removed.push(key);
    }

    if !report.is_empty() {
        info!(
            "migrated {} legacy keys, folded {} urls",
            report.removed.len(),
            report.folded.len()
        );
    }

    report
}

fn is_http_url(value: &str) -> bool {
    Url::parse(value.trim()).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}
