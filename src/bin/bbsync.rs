// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use bbsync::{
    config::{ensure_env_defaults, export_to_process_env, keys::REPO_LIST, Destination, Settings},
    metadata::read_metadata,
    migrate::{migrate_with, LegacyPolicy},
    path::default_env_file,
    remote::{CloudLister, RepoDescriptor, RepositoryLister, StaticLister},
    repo_list::{ensure_url_in_repo_list, RepoList},
    store::{EnvMap, EnvStore},
    sync::{discover, SyncReport, Syncer},
    vcs::{CredentialWriter, GitCli, GitCredentialApprove, GitEnv},
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, process::exit, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "bbsync [options] <bbsync-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to env file.
    #[arg(short, long, global = true, env = "BBSYNC_ENV_FILE", value_name = "path")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let store = match self.env_file {
            Some(path) => EnvStore::new(path),
            None => EnvStore::new(default_env_file()?),
        };

        match self.command {
            Command::Check => run_check(&store),
            Command::Add(opts) => run_add(&store, opts),
            Command::List => run_list(&store),
            Command::Migrate(opts) => run_migrate(&store, opts),
            Command::Sync(opts) => run_sync(&store, opts),
            Command::Credentials => run_credentials(&store),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Fill in default settings and report missing required ones.
    #[command(override_usage = "bbsync check [options]")]
    Check,

    /// Add repository URLs to repository list.
    #[command(override_usage = "bbsync add [options] <url>...")]
    Add(AddOptions),

    /// Show listed repositories and their last recorded sync.
    #[command(override_usage = "bbsync list [options]")]
    List,

    /// Remove legacy per-repository keys from env file.
    #[command(override_usage = "bbsync migrate [options]")]
    Migrate(MigrateOptions),

    /// Clone or update every listed or discovered repository.
    #[command(override_usage = "bbsync sync [options]")]
    Sync(SyncOptions),

    /// Hand user and token over to Git's credential helper.
    #[command(override_usage = "bbsync credentials [options]")]
    Credentials,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AddOptions {
    /// Repository URLs to add.
    #[arg(required = true, value_name = "url")]
    pub urls: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MigrateOptions {
    /// Drop legacy keys without adding their URLs to repository list.
    #[arg(short, long)]
    pub discard: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncOptions {
    /// Only sync repositories with these slugs.
    #[arg(short, long, value_name = "slug")]
    pub only: Vec<String>,

    /// Skip asking Bitbucket Cloud for workspace repositories.
    #[arg(long)]
    pub no_discover: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn bootstrap(store: &EnvStore) -> Result<(EnvMap, Settings)> {
    let (map, missing) = ensure_env_defaults(store)?;
    if !missing.is_empty() {
        bail!(
            "missing required keys in {:?}: {}",
            store.path().display(),
            missing.join(", ")
        );
    }

    export_to_process_env(&map);
    let settings = Settings::from_env_map(&map)?;

    Ok((map, settings))
}

fn run_check(store: &EnvStore) -> Result<()> {
    let (_, missing) = ensure_env_defaults(store)?;
    if missing.is_empty() {
        info!("{:?} is ready", store.path().display());
        return Ok(());
    }

    for key in &missing {
        warn!("missing {key}");
    }
    bail!("{} required keys are missing", missing.len())
}

fn run_add(store: &EnvStore, opts: AddOptions) -> Result<()> {
    let added = store.transaction(|map| {
        opts.urls
            .iter()
            .filter(|url| ensure_url_in_repo_list(map, url))
            .count()
    })?;
    info!("added {added} of {} urls", opts.urls.len());

    Ok(())
}

fn run_list(store: &EnvStore) -> Result<()> {
    let map = store.load()?;
    let repos = RepoList::from(map.get(REPO_LIST).unwrap_or_default());
    for repo in repos.iter().filter_map(RepoDescriptor::from_url) {
        let metadata = read_metadata(&map, &repo.slug)?;
        let status = match metadata.status() {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => "-".into(),
            Err(error) => {
                warn!("{}: {error}", repo.slug);
                "?".into()
            }
        };
        println!(
            "{:<24} {:<8} {:<21} {:<16} {}",
            repo.slug,
            status,
            metadata.last_sync.unwrap_or_else(|| "-".into()),
            metadata.active_branch.unwrap_or_else(|| "-".into()),
            repo.url,
        );
    }

    Ok(())
}

fn run_migrate(store: &EnvStore, opts: MigrateOptions) -> Result<()> {
    let policy = if opts.discard {
        LegacyPolicy::Discard
    } else {
        LegacyPolicy::Fold
    };
    let report = store.transaction(|map| migrate_with(map, policy))?;
    if report.is_empty() {
        info!("nothing to migrate");
    }

    for key in &report.removed {
        info!("removed {key}");
    }

    Ok(())
}

fn run_sync(store: &EnvStore, opts: SyncOptions) -> Result<()> {
    let (map, settings) = bootstrap(store)?;
    let repos = match &settings.destination {
        Destination::Cloud { .. } if !opts.no_discover => {
            let lister = CloudLister::from_settings(&settings)?;
            discover(store, &lister, &settings.destination)?
        }
        _ => StaticLister::new(RepoList::from(map.get(REPO_LIST).unwrap_or_default()))
            .list(&settings.destination)?,
    };
    let repos = repos
        .into_iter()
        .filter(|repo| opts.only.is_empty() || opts.only.contains(&repo.slug))
        .collect::<Vec<_>>();
    if repos.is_empty() {
        warn!("no repositories to sync");
        return Ok(());
    }

    let syncer = Syncer::new(
        store,
        GitCli::default(),
        GitEnv::from_settings(&settings),
        &settings.base_dir,
    )
    .with_auto_commit(settings.auto_commit_env);
    let style = ProgressStyle::with_template("{spinner:.green} {elapsed:>4.yellow}  {msg}")?;

    let mut report = SyncReport::default();
    for repo in &repos {
        let bar = ProgressBar::new_spinner().with_style(style.clone());
        bar.set_message(format!("syncing {}", repo.slug));
        bar.enable_steady_tick(Duration::from_millis(100));

        let result = syncer.sync_repo(repo);
        match &result {
            Ok(status) => bar.finish_with_message(format!("{} {status}", repo.slug)),
            Err(_) => bar.finish_with_message(format!("{} failed", repo.slug)),
        }
        report.push(repo, result);
    }

    let synced = report.into_result()?;
    info!("synced {synced} repositories into {:?}", settings.base_dir.display());

    Ok(())
}

fn run_credentials(store: &EnvStore) -> Result<()> {
    let (_, settings) = bootstrap(store)?;
    let token = settings
        .token
        .as_deref()
        .ok_or_else(|| anyhow!("BITBUCKET_TOKEN is not set"))?;
    let host = settings
        .destination
        .host()
        .ok_or_else(|| anyhow!("cannot determine host of {:?}", settings.destination))?;

    GitCredentialApprove::default().store(&host, &settings.user, token)?;
    info!("stored credentials of {} for {host}", settings.user);

    Ok(())
}
