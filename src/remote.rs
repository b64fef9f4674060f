// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote repository listing.
//!
//! Bbsync needs to know which repositories exist at a destination before it
//! can mirror them. Hosting APIs differ between Bitbucket Cloud and
//! Bitbucket Server, so listing sits behind the [`RepositoryLister`] trait.
//! The [`StaticLister`] serves whatever the env file already lists, and the
//! [`CloudLister`] asks the Bitbucket Cloud REST API.

use crate::{
    config::{Destination, Settings},
    repo_list::RepoList,
};

use reqwest::{
    blocking::Client,
    header::{HeaderValue, ACCEPT},
    Certificate, StatusCode,
};
use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};
use tracing::{debug, instrument, warn};
use url::Url;

/// Bitbucket Cloud REST API root.
pub const CLOUD_API: &str = "https://api.bitbucket.org/2.0";

/// Repositories requested per page.
pub const PAGE_LENGTH: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Repository known to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoDescriptor {
    /// Clone URL.
    pub url: String,

    /// Short key-safe name, also used as working copy directory name.
    pub slug: String,

    /// Default branch, empty if unknown.
    pub default_branch: String,
}

impl RepoDescriptor {
    /// Describe repository from its clone URL alone.
    ///
    /// Returns `None` if no slug can be derived from URL.
    pub fn from_url(url: impl Into<String>) -> Option<Self> {
        let url = url.into();
        let slug = slug_from_url(&url)?;

        Some(Self {
            url,
            slug,
            default_branch: String::new(),
        })
    }
}

/// Source of repositories to mirror.
pub trait RepositoryLister {
    /// List repositories available at destination.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Authentication`] if credentials are rejected.
    /// - Return [`RemoteError::Api`] if the listing request fails.
    fn list(&self, destination: &Destination) -> Result<Vec<RepoDescriptor>>;
}

/// Lister that serves the repository list of the env file.
#[derive(Debug, Default, Clone)]
pub struct StaticLister {
    repos: RepoList,
}

impl StaticLister {
    pub fn new(repos: RepoList) -> Self {
        Self { repos }
    }
}

impl RepositoryLister for StaticLister {
    fn list(&self, _destination: &Destination) -> Result<Vec<RepoDescriptor>> {
        let mut descriptors = Vec::with_capacity(self.repos.len());
        for url in self.repos.iter() {
            match RepoDescriptor::from_url(url) {
                Some(descriptor) => descriptors.push(descriptor),
                None => warn!("cannot derive repository name from {url:?}, skipping"),
            }
        }

        Ok(descriptors)
    }
}

/// Lister backed by the Bitbucket Cloud REST API.
///
/// Walks `/repositories/{workspace}` page by page, following the `next` link
/// of every page until none is left. Only HTTPS clone links are used.
#[derive(Debug, Clone)]
pub struct CloudLister {
    client: Client,
    api_base: String,
    user: String,
    token: Option<String>,
}

impl CloudLister {
    /// Build lister from settings.
    ///
    /// Trusts `REQUESTS_CA_BUNDLE` in addition to the bundled roots, and skips
    /// certificate verification entirely when `INSECURE` is set.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::CaBundle`] if CA bundle cannot be read.
    /// - Return [`RemoteError::Request`] if CA bundle is not valid PEM, or
    ///   client cannot be built.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(path) = &settings.api_ca_bundle {
            let pem = fs::read(path).map_err(|err| RemoteError::CaBundle {
                path: path.clone(),
                source: err,
            })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        if settings.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            api_base: CLOUD_API.into(),
            user: settings.user.clone(),
            token: settings.token.clone(),
        })
    }

    /// Point lister at another API root.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn first_page(&self, workspace: &str) -> Result<Url> {
        let raw = format!("{}/repositories/{workspace}", self.api_base.trim_end_matches('/'));
        let mut url = Url::parse(&raw).map_err(|err| RemoteError::InvalidUrl {
            url: raw,
            source: err,
        })?;
        url.query_pairs_mut().append_pair("pagelen", &PAGE_LENGTH.to_string());

        Ok(url)
    }

    fn fetch_page(&self, url: &str) -> Result<RepositoryPage> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .basic_auth(&self.user, self.token.as_deref())
            .send()?;

        match response.status() {
            StatusCode::OK => Ok(response.json()?),
            StatusCode::UNAUTHORIZED => Err(RemoteError::Authentication),
            status => Err(RemoteError::Api {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            }),
        }
    }
}

impl RepositoryLister for CloudLister {
    #[instrument(skip(self), level = "debug")]
    fn list(&self, destination: &Destination) -> Result<Vec<RepoDescriptor>> {
        let Destination::Cloud { workspace } = destination else {
            return Err(RemoteError::Unsupported(format!("{destination:?}")));
        };

        let mut descriptors = Vec::new();
        let mut next = Some(self.first_page(workspace)?.to_string());
        while let Some(url) = next.take() {
            let page = self.fetch_page(&url)?;
            for repo in page.values {
                match repo.into_descriptor() {
                    Some(descriptor) => descriptors.push(descriptor),
                    None => warn!("skipping repository without usable slug or clone link"),
                }
            }
            next = page.next.filter(|link| !link.is_empty());
        }

        Ok(descriptors)
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryPage {
    #[serde(default)]
    values: Vec<CloudRepository>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudRepository {
    slug: String,
    mainbranch: Option<MainBranch>,
    #[serde(default)]
    links: CloudLinks,
}

#[derive(Debug, Deserialize)]
struct MainBranch {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct CloudLinks {
    #[serde(default)]
    clone: Vec<CloneLink>,
}

#[derive(Debug, Deserialize)]
struct CloneLink {
    name: String,
    href: String,
}

impl CloudRepository {
    fn into_descriptor(self) -> Option<RepoDescriptor> {
        if !is_valid_slug(&self.slug) {
            return None;
        }

        let url = self
            .links
            .clone
            .into_iter()
            .find(|link| link.name == "https")?
            .href;

        Some(RepoDescriptor {
            url,
            slug: self.slug,
            default_branch: self.mainbranch.map(|branch| branch.name).unwrap_or_default(),
        })
    }
}

/// Derive repository slug from clone URL.
///
/// The slug is the last path segment with any `.git` suffix removed. Segments
/// that cannot serve as a working copy directory name yield `None`.
pub fn slug_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let (_, last) = trimmed.rsplit_once(['/', ':'])?;
    let slug = last.strip_suffix(".git").unwrap_or(last);
    if !is_valid_slug(slug) {
        return None;
    }

    Some(slug.to_string())
}

/// Check that slug names a single directory below base directory.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug != "."
        && slug != ".."
        && !slug
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | '=') || ch.is_whitespace() || ch.is_control())
}

/// Remote listing error types.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Destination rejected supplied credentials.
    #[error("authentication failed, check username and token")]
    Authentication,

    /// Listing request failed.
    #[error("api request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    /// Request could not be sent, or its response could not be decoded.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// CA bundle of API client cannot be read.
    #[error("failed to read CA bundle {:?}", path.display())]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Listing URL is malformed.
    #[error("invalid api url {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Lister cannot serve this kind of destination.
    #[error("cannot list repositories of {0}")]
    Unsupported(String),
}

/// Friendly result alias :3
type Result<T, E = RemoteError> = std::result::Result<T, E>;
