// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control plumbing.
//!
//! Working copies are cloned and pulled through the Git binary, so the
//! operator's own credential helpers, proxies, and TLS settings apply. Reading
//! local state back out of a working copy goes through [`git2`] instead, which
//! needs no process spawn.
//!
//! # Non-Interactive Calls
//!
//! Every Git call made here is non-interactive. Terminal prompts are disabled
//! by dropping `GIT_TERMINAL_PROMPT` from the child environment, and output is
//! captured instead of inherited. A sync run over many repositories must never
//! stall waiting on a password prompt.

use crate::{
    config::Settings,
    metadata::{LocalState, SyncStatus},
};

use git2::Repository;
use std::{
    ffi::{OsStr, OsString},
    fs::create_dir_all,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, instrument};

/// Environment handed to every Git call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GitEnv {
    /// CA bundle to verify remotes with.
    pub ca_bundle: Option<PathBuf>,

    /// Skip TLS verification entirely.
    pub insecure: bool,
}

impl GitEnv {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ca_bundle: settings.git_ca_bundle.clone(),
            insecure: settings.insecure,
        }
    }

    /// Apply environment to command about to be spawned.
    pub fn apply(&self, command: &mut Command) {
        if let Some(bundle) = &self.ca_bundle {
            command
                .env("GIT_SSL_CAINFO", bundle)
                .env("CURL_CA_BUNDLE", bundle);
        }

        if self.insecure {
            command.env("GIT_SSL_NO_VERIFY", "1");
        }

        command.env_remove("GIT_TERMINAL_PROMPT");
    }
}

/// Mirror remote repositories into working copies.
pub trait VersionControl {
    /// Bring working copy at destination up to date with remote.
    ///
    /// Clones if destination holds no repository yet, otherwise fast-forwards.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::Syscall`] if Git binary cannot be spawned.
    /// - Return [`VcsError::CommandFailed`] if Git reports failure.
    fn sync(&self, url: &str, dest: &Path, env: &GitEnv) -> Result<SyncStatus>;

    /// Local state of working copy at destination.
    ///
    /// Unknown fields are left empty rather than failing.
    fn local_state(&self, dest: &Path) -> LocalState;
}

/// Version control through the Git binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    bin: OsString,
}

impl GitCli {
    pub fn new(bin: impl Into<OsString>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self, env: &GitEnv) -> Command {
        let mut command = Command::new(&self.bin);
        env.apply(&mut command);
        command
    }

    /// URL always follows `--`, so it is never read as a clone option.
    fn clone_command(&self, url: &str, dest: &Path, env: &GitEnv) -> Command {
        let mut command = self.command(env);
        command.arg("clone").arg("--").arg(url).arg(dest);
        command
    }

    fn pull_command(&self, dest: &Path, env: &GitEnv) -> Command {
        let mut command = self.command(env);
        command.arg("-C").arg(dest).args(["pull", "--ff-only"]);
        command
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl VersionControl for GitCli {
    #[instrument(skip(self, env), level = "debug")]
    fn sync(&self, url: &str, dest: &Path, env: &GitEnv) -> Result<SyncStatus> {
        if dest.join(".git").exists() {
            syscall_non_interactive(self.pull_command(dest, env))?;
            return Ok(SyncStatus::Updated);
        }

        if let Some(parent) = dest.parent() {
            create_dir_all(parent)?;
        }

        syscall_non_interactive(self.clone_command(url, dest, env))?;

        Ok(SyncStatus::Cloned)
    }

    fn local_state(&self, dest: &Path) -> LocalState {
        local_state(dest).unwrap_or_else(|err| {
            debug!("no local state for {:?}: {err}", dest.display());
            LocalState::default()
        })
    }
}

/// Read active branch and HEAD commit of working copy.
///
/// A detached HEAD reports the short commit hash as its active branch.
///
/// # Errors
///
/// - Return [`VcsError::Git2`] if working copy cannot be opened, or if HEAD
///   does not point at a commit yet.
pub fn local_state(path: impl AsRef<Path>) -> Result<LocalState> {
    let repository = Repository::open(path.as_ref())?;
    let head = repository.head()?;
    let commit = head.peel_to_commit()?;
    let short = commit.as_object().short_id()?.as_str().map(str::to_string);

    let active_branch = if repository.head_detached()? {
        short.clone()
    } else {
        head.shorthand().map(str::to_string)
    };

    Ok(LocalState {
        active_branch,
        commit: short,
    })
}

/// Persist credentials for later Git calls.
pub trait CredentialWriter {
    /// Store secret of user for host.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if credential store rejects the entry.
    fn store(&self, host: &str, user: &str, secret: &str) -> Result<()>;
}

/// Credential writer backed by `git credential approve`.
///
/// Hands the entry to whatever credential helper the operator configured.
#[derive(Debug, Clone)]
pub struct GitCredentialApprove {
    bin: OsString,
}

impl GitCredentialApprove {
    pub fn new(bin: impl Into<OsString>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for GitCredentialApprove {
    fn default() -> Self {
        Self::new("git")
    }
}

impl CredentialWriter for GitCredentialApprove {
    #[instrument(skip(self, secret), level = "debug")]
    fn store(&self, host: &str, user: &str, secret: &str) -> Result<()> {
        let mut child = Command::new(&self.bin)
            .args(["credential", "approve"])
            .env_remove("GIT_TERMINAL_PROMPT")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(credential_description(host, user, secret).as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: "git credential approve".into(),
                message: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }

        Ok(())
    }
}

fn credential_description(host: &str, user: &str, secret: &str) -> String {
    format!("protocol=https\nhost={host}\nusername={user}\npassword={secret}\n\n")
}

/// Commit env file into the repository that holds it.
///
/// Only the env file itself is staged and committed, anything else already
/// staged in that repository stays staged.
///
/// # Errors
///
/// - Return [`VcsError::Syscall`] if Git binary cannot be spawned.
/// - Return [`VcsError::CommandFailed`] if env file is not inside a
///   repository, or if there is nothing to commit.
#[instrument(level = "debug")]
pub fn commit_env_file(env_file: &Path, message: &str) -> Result<()> {
    let dir = match env_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = env_file.file_name().unwrap_or(env_file.as_os_str());

    let mut add = Command::new("git");
    add.arg("-C").arg(dir).arg("add").arg("--").arg(name);
    syscall_non_interactive(add)?;

    let mut commit = Command::new("git");
    commit
        .arg("-C")
        .arg(dir)
        .args(["commit", "-m", message, "--"])
        .arg(name);
    syscall_non_interactive(commit)?;

    Ok(())
}

fn syscall_non_interactive(mut command: Command) -> Result<String> {
    command.env_remove("GIT_TERMINAL_PROMPT");
    let rendered = render_command(&command);
    debug!("running {rendered}");

    let output = command.output()?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    if !output.status.success() {
        return Err(VcsError::CommandFailed {
            command: rendered,
            message,
        });
    }

    Ok(message)
}

fn render_command(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Version control error types.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Git binary cannot be spawned or talked to.
    #[error(transparent)]
    Syscall(#[from] std::io::Error),

    /// Git ran but reported failure.
    #[error("command {command:?} failed:\n{message}")]
    CommandFailed { command: String, message: String },

    /// Working copy cannot be inspected.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = VcsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env_of(command: &Command) -> Vec<(String, Option<String>)> {
        let mut envs = command
            .get_envs()
            .map(|(key, value)| {
                (
                    key.to_string_lossy().into_owned(),
                    value.map(|value| value.to_string_lossy().into_owned()),
                )
            })
            .collect::<Vec<_>>();
        envs.sort();
        envs
    }

    #[test]
    fn git_env_secure_without_bundle_only_drops_prompt() {
        let mut command = Command::new("git");
        GitEnv::default().apply(&mut command);
        assert_eq!(
            env_of(&command),
            vec![("GIT_TERMINAL_PROMPT".to_string(), None)]
        );
    }

    #[test]
    fn git_env_insecure_with_bundle() {
        let mut command = Command::new("git");
        let env = GitEnv {
            ca_bundle: Some(PathBuf::from("/etc/ssl/corp.pem")),
            insecure: true,
        };
        env.apply(&mut command);

        let expect = vec![
            ("CURL_CA_BUNDLE".to_string(), Some("/etc/ssl/corp.pem".to_string())),
            ("GIT_SSL_CAINFO".to_string(), Some("/etc/ssl/corp.pem".to_string())),
            ("GIT_SSL_NO_VERIFY".to_string(), Some("1".to_string())),
            ("GIT_TERMINAL_PROMPT".to_string(), None),
        ];
        assert_eq!(env_of(&command), expect);
    }

    #[test]
    fn credential_description_layout() {
        assert_eq!(
            credential_description("bitbucket.org", "jdoe", "s3cret"),
            "protocol=https\nhost=bitbucket.org\nusername=jdoe\npassword=s3cret\n\n"
        );
    }

    #[test]
    fn render_command_joins_args() {
        let mut command = Command::new("git");
        command.args(["pull", "--ff-only"]);
        assert_eq!(render_command(&command), "git pull --ff-only");
    }

    #[test]
    fn clone_keeps_option_like_url_as_operand() {
        let command = GitCli::default().clone_command(
            "--upload-pack=touch /tmp/owned",
            Path::new("/srv/mirror/owned"),
            &GitEnv::default(),
        );
        assert_eq!(
            render_command(&command),
            "git clone -- --upload-pack=touch /tmp/owned /srv/mirror/owned"
        );
    }

    #[test]
    fn local_state_of_missing_repository_fails() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        assert!(matches!(local_state(dir.path()), Err(VcsError::Git2(_))));
        assert_eq!(GitCli::default().local_state(dir.path()), LocalState::default());

        Ok(())
    }
}
