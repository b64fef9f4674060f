// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the global keys bbsync reads out of the env file, and turn them
//! into typed [`Settings`]. Per-repository keys are handled by
//! [`metadata`](crate::metadata) instead.
//!
//! # Destinations
//!
//! Bbsync talks to either Bitbucket Cloud or a self-hosted Bitbucket
//! Server/Data Center instance. Cloud only needs a workspace name. Server needs
//! a base URL and a project key, which can either be given separately or by
//! pasting the project URL itself into the workspace key.

use crate::store::{EnvMap, EnvStore, StoreError};

use regex::Regex;
use std::{
    env::{self, VarError},
    path::PathBuf,
    sync::LazyLock,
};
use tracing::{debug, instrument, warn};
use url::Url;

/// Global env file keys.
pub mod keys {
    /// Skip TLS verification, bool-like.
    pub const INSECURE: &str = "INSECURE";

    /// Repositories to mirror.
    pub const REPO_LIST: &str = "REPO_LIST";

    /// Directory that holds every working copy.
    pub const BB_BASE_DIR: &str = "BB_BASE_DIR";

    pub const BITBUCKET_USER: &str = "BITBUCKET_USER";
    pub const BITBUCKET_TOKEN: &str = "BITBUCKET_TOKEN";
    pub const BITBUCKET_WORKSPACE: &str = "BITBUCKET_WORKSPACE";
    pub const BITBUCKET_BASE_URL: &str = "BITBUCKET_BASE_URL";
    pub const BITBUCKET_PROJECT: &str = "BITBUCKET_PROJECT";

    /// CA bundle handed to git.
    pub const GIT_CA_BUNDLE: &str = "GIT_CA_BUNDLE";

    /// CA bundle handed to the API client.
    pub const REQUESTS_CA_BUNDLE: &str = "REQUESTS_CA_BUNDLE";

    /// Commit the env file after each metadata update, bool-like.
    pub const AUTO_COMMIT_ENV: &str = "AUTO_COMMIT_ENV";
}

static PROJECT_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/projects/([^/]+)/?").unwrap());

const CLOUD_HOST: &str = "bitbucket.org";

/// Load env file and fill in defaults.
///
/// Makes sure `INSECURE` and `REPO_LIST` exist, defaulting to `true` and an
/// empty list. Defaults are only written back if something was missing, and
/// failing to write them back is not fatal. Also reports which required keys
/// are still unset.
///
/// # Errors
///
/// - Return [`ConfigError::Store`] if env file cannot be loaded.
#[instrument(skip(store), level = "debug")]
pub fn ensure_env_defaults(store: &EnvStore) -> Result<(EnvMap, Vec<String>)> {
    let mut map = store.load()?;

    if apply_defaults(&mut map) {
        debug!("writing defaults to {:?}", store.path().display());
        let persisted = store.transaction(|current| {
            apply_defaults(current);
            current.clone()
        });

        match persisted {
            Ok(current) => map = current,
            Err(err) => warn!("cannot persist env defaults: {err}"),
        }
    }

    let missing = missing_required_keys(&map);
    Ok((map, missing))
}

fn apply_defaults(map: &mut EnvMap) -> bool {
    let mut changed = false;
    for (key, default) in [(keys::INSECURE, "true"), (keys::REPO_LIST, "")] {
        if !map.contains_key(key) {
            map.insert(key, default);
            changed = true;
        }
    }

    changed
}

/// List required keys that are unset or empty.
///
/// Cloud needs a workspace, server needs base URL plus project. Either one is
/// fine, so the pair is reported as one combined entry.
pub fn missing_required_keys(map: &EnvMap) -> Vec<String> {
    let is_set = |key: &str| map.get(key).is_some_and(|value| !value.is_empty());
    let mut missing = Vec::new();

    for key in [keys::BITBUCKET_USER, keys::BB_BASE_DIR] {
        if !is_set(key) {
            missing.push(key.to_string());
        }
    }

    if !is_set(keys::BITBUCKET_WORKSPACE)
        && !(is_set(keys::BITBUCKET_BASE_URL) && is_set(keys::BITBUCKET_PROJECT))
    {
        missing.push(format!(
            "{} or ({} and {})",
            keys::BITBUCKET_WORKSPACE,
            keys::BITBUCKET_BASE_URL,
            keys::BITBUCKET_PROJECT
        ));
    }

    missing
}

/// Mirror env mapping into process environment.
///
/// Variables that are already set are left alone.
pub fn export_to_process_env(map: &EnvMap) {
    for (key, value) in map.iter() {
        // INVARIANT: Skip anything set_var would reject.
        if key.contains(['=', '\0']) || value.contains('\0') {
            continue;
        }

        if env::var_os(key).is_none() {
            env::set_var(key, value);
        }
    }
}

/// Interpret bool-like env value.
pub fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

/// Where repositories get listed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Bitbucket Cloud workspace.
    Cloud { workspace: String },

    /// Bitbucket Server/Data Center project.
    Server { base_url: String, project: String },
}

impl Destination {
    /// Figure out destination from raw settings.
    ///
    /// A workspace that looks like a URL must point at a server project, i.e.,
    /// `https://host/projects/KEY`. Otherwise an explicit base URL and project
    /// pair wins over a plain workspace name.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidWorkspaceUrl`] if workspace is a URL
    ///   without a project path.
    /// - Return [`ConfigError::IncompleteDestination`] if neither form is
    ///   fully given.
    pub fn detect(workspace_or_url: &str, base_url: &str, project: &str) -> Result<Self> {
        let workspace_or_url = workspace_or_url.trim();
        if workspace_or_url.starts_with("http://") || workspace_or_url.starts_with("https://") {
            let url = Url::parse(workspace_or_url).map_err(|err| {
                ConfigError::InvalidWorkspaceUrl {
                    url: workspace_or_url.to_string(),
                    reason: err.to_string(),
                }
            })?;
            let project = PROJECT_PATH
                .captures(url.path())
                .and_then(|captures| captures.get(1))
                .ok_or_else(|| ConfigError::InvalidWorkspaceUrl {
                    url: workspace_or_url.to_string(),
                    reason: "expected a /projects/<KEY> path".into(),
                })?;

            return Ok(Self::Server {
                base_url: url.origin().ascii_serialization(),
                project: project.as_str().to_string(),
            });
        }

        let (base_url, project) = (base_url.trim(), project.trim());
        if !base_url.is_empty() && !project.is_empty() {
            return Ok(Self::Server {
                base_url: base_url.to_string(),
                project: project.to_string(),
            });
        }

        if !workspace_or_url.is_empty() {
            return Ok(Self::Cloud {
                workspace: workspace_or_url.to_string(),
            });
        }

        Err(ConfigError::IncompleteDestination)
    }

    /// Host that credentials should be stored for.
    pub fn host(&self) -> Option<String> {
        match self {
            Self::Cloud { .. } => Some(CLOUD_HOST.to_string()),
            Self::Server { base_url, .. } => Url::parse(base_url)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string)),
        }
    }
}

/// Typed view of global settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub user: String,
    pub token: Option<String>,
    pub base_dir: PathBuf,
    pub destination: Destination,
    pub insecure: bool,
    pub git_ca_bundle: Option<PathBuf>,
    pub api_ca_bundle: Option<PathBuf>,
    pub auto_commit_env: bool,
}

impl Settings {
    /// Extract settings from env mapping.
    ///
    /// Base directory goes through shell expansion. Missing `INSECURE` means
    /// insecure mode. Missing `AUTO_COMMIT_ENV` falls back to the process
    /// environment.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingKey`] if a required key is unset.
    /// - Return [`ConfigError::ShellExpansion`] if base directory cannot be
    ///   expanded.
    /// - Return any error [`Destination::detect`] can.
    pub fn from_env_map(map: &EnvMap) -> Result<Self> {
        let optional = |key: &str| {
            map.get(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let required = |key: &'static str| optional(key).ok_or(ConfigError::MissingKey { key });

        let base_dir = shellexpand::full(&required(keys::BB_BASE_DIR)?)?.into_owned();
        let destination = Destination::detect(
            map.get(keys::BITBUCKET_WORKSPACE).unwrap_or_default(),
            map.get(keys::BITBUCKET_BASE_URL).unwrap_or_default(),
            map.get(keys::BITBUCKET_PROJECT).unwrap_or_default(),
        )?;
        let auto_commit_env = optional(keys::AUTO_COMMIT_ENV)
            .or_else(|| env::var(keys::AUTO_COMMIT_ENV).ok())
            .is_some_and(|value| str_to_bool(&value));

        Ok(Self {
            user: required(keys::BITBUCKET_USER)?,
            token: optional(keys::BITBUCKET_TOKEN),
            base_dir: PathBuf::from(base_dir),
            destination,
            insecure: optional(keys::INSECURE).is_none_or(|value| str_to_bool(&value)),
            git_ca_bundle: optional(keys::GIT_CA_BUNDLE).map(PathBuf::from),
            api_ca_bundle: optional(keys::REQUESTS_CA_BUNDLE).map(PathBuf::from),
            auto_commit_env,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Env file cannot be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<VarError>),

    /// Required key is unset.
    #[error("required key {key} is not set")]
    MissingKey { key: &'static str },

    /// Neither cloud nor server destination is fully specified.
    #[error(
        "incomplete destination, set {} or both {} and {}",
        keys::BITBUCKET_WORKSPACE,
        keys::BITBUCKET_BASE_URL,
        keys::BITBUCKET_PROJECT
    )]
    IncompleteDestination,

    /// Workspace looks like a URL but does not name a server project.
    #[error("workspace URL {url:?} is not usable: {reason}")]
    InvalidWorkspaceUrl { url: String, reason: String },
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;
    use tempfile::TempDir;

    #[test]
    fn ensure_env_defaults_writes_missing_defaults() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = EnvStore::new(dir.path().join("sync.env"));

        let (map, missing) = ensure_env_defaults(&store)?;
        pretty_assertions::assert_eq!(map.get(keys::INSECURE), Some("true"));
        pretty_assertions::assert_eq!(map.get(keys::REPO_LIST), Some(""));
        pretty_assertions::assert_eq!(
            missing,
            vec![
                "BITBUCKET_USER".to_string(),
                "BB_BASE_DIR".to_string(),
                "BITBUCKET_WORKSPACE or (BITBUCKET_BASE_URL and BITBUCKET_PROJECT)".to_string(),
            ]
        );
        pretty_assertions::assert_eq!(store.load()?, map);

        Ok(())
    }

    #[test]
    fn ensure_env_defaults_keeps_existing_values() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = EnvStore::new(dir.path().join("sync.env"));
        let existing: EnvMap = [
            ("INSECURE", "false"),
            ("REPO_LIST", "https://a.com/r1"),
            ("BITBUCKET_USER", "jdoe"),
            ("BB_BASE_DIR", "/srv/mirror"),
            ("BITBUCKET_BASE_URL", "https://git.corp"),
            ("BITBUCKET_PROJECT", "OPS"),
        ]
        .into_iter()
        .collect();
        store.save(&existing)?;

        let (map, missing) = ensure_env_defaults(&store)?;
        pretty_assertions::assert_eq!(map, existing);
        assert!(missing.is_empty());

        Ok(())
    }

    #[test]
    fn server_pair_needs_both_halves() {
        let map: EnvMap = [
            ("BITBUCKET_USER", "jdoe"),
            ("BB_BASE_DIR", "/srv/mirror"),
            ("BITBUCKET_BASE_URL", "https://git.corp"),
        ]
        .into_iter()
        .collect();
        pretty_assertions::assert_eq!(missing_required_keys(&map).len(), 1);
    }

    #[test_case("https://git.corp:7990/projects/OPS", "https://git.corp:7990", "OPS"; "project url")]
    #[test_case("https://git.corp/projects/ops/repos/", "https://git.corp", "ops"; "project url with repos")]
    #[test_case("http://git.corp/PROJECTS/OPS/", "http://git.corp", "OPS"; "uppercase path")]
    #[test]
    fn detect_server_from_workspace_url(workspace: &str, base_url: &str, project: &str) {
        let result = Destination::detect(workspace, "", "");
        let expect = Destination::Server {
            base_url: base_url.into(),
            project: project.into(),
        };
        pretty_assertions::assert_eq!(result.ok(), Some(expect));
    }

    #[test]
    fn detect_destination_forms() {
        pretty_assertions::assert_eq!(
            Destination::detect("", "https://git.corp", "OPS").ok(),
            Some(Destination::Server {
                base_url: "https://git.corp".into(),
                project: "OPS".into()
            })
        );
        pretty_assertions::assert_eq!(
            Destination::detect("team", "", "").ok(),
            Some(Destination::Cloud {
                workspace: "team".into()
            })
        );
        assert!(matches!(
            Destination::detect("", "https://git.corp", ""),
            Err(ConfigError::IncompleteDestination)
        ));
        assert!(matches!(
            Destination::detect("https://git.corp/users/jdoe", "", ""),
            Err(ConfigError::InvalidWorkspaceUrl { .. })
        ));
    }

    #[test]
    fn destination_host() {
        let cloud = Destination::Cloud {
            workspace: "team".into(),
        };
        let server = Destination::Server {
            base_url: "https://git.corp:7990".into(),
            project: "OPS".into(),
        };
        pretty_assertions::assert_eq!(cloud.host(), Some("bitbucket.org".into()));
        pretty_assertions::assert_eq!(server.host(), Some("git.corp".into()));
    }

    #[test_case("1", true; "one")]
    #[test_case("TRUE", true; "upper true")]
    #[test_case(" yes ", true; "padded yes")]
    #[test_case("y", true; "y")]
    #[test_case("false", false; "false value")]
    #[test_case("", false; "empty")]
    #[test]
    fn bool_like_values(value: &str, expect: bool) {
        pretty_assertions::assert_eq!(str_to_bool(value), expect);
    }

    #[sealed_test(env = [("MIRROR_ROOT", "/srv/mirror")])]
    fn settings_expand_base_dir() -> anyhow::Result<()> {
        let map: EnvMap = [
            ("BITBUCKET_USER", "jdoe"),
            ("BB_BASE_DIR", "$MIRROR_ROOT/bitbucket"),
            ("BITBUCKET_WORKSPACE", "team"),
            ("GIT_CA_BUNDLE", "/etc/ssl/corp.pem"),
            ("AUTO_COMMIT_ENV", "yes"),
        ]
        .into_iter()
        .collect();

        let result = Settings::from_env_map(&map)?;
        let expect = Settings {
            user: "jdoe".into(),
            token: None,
            base_dir: PathBuf::from("/srv/mirror/bitbucket"),
            destination: Destination::Cloud {
                workspace: "team".into(),
            },
            insecure: true,
            git_ca_bundle: Some(PathBuf::from("/etc/ssl/corp.pem")),
            api_ca_bundle: None,
            auto_commit_env: true,
        };
        pretty_assertions::assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn settings_require_user() {
        let map: EnvMap = [("BB_BASE_DIR", "/srv"), ("BITBUCKET_WORKSPACE", "team")]
            .into_iter()
            .collect();
        assert!(matches!(
            Settings::from_env_map(&map),
            Err(ConfigError::MissingKey {
                key: "BITBUCKET_USER"
            })
        ));
    }

    #[sealed_test(env = [("BITBUCKET_USER", "from-shell")])]
    fn export_does_not_override_process_env() {
        let map: EnvMap = [
            ("BITBUCKET_USER", "from-file"),
            ("BBSYNC_EXPORT_CHECK", "exported"),
        ]
        .into_iter()
        .collect();

        export_to_process_env(&map);
        pretty_assertions::assert_eq!(env::var("BITBUCKET_USER").ok(), Some("from-shell".into()));
        pretty_assertions::assert_eq!(
            env::var("BBSYNC_EXPORT_CHECK").ok(),
            Some("exported".into())
        );
    }
}
