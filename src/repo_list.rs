// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository list handling.
//!
//! The set of repositories to mirror lives under the `REPO_LIST` key of the
//! env file as an ordered list of URLs.
//!
//! # Separators
//!
//! Older env files separate entries with commas, newer ones put one URL per
//! line, and hand-edited files sometimes mix both. Parsing splits on line
//! breaks first and then on commas. Writing always uses one URL per line.
//!
//! # Normalization
//!
//! Two URLs name the same repository if they are equal after trimming
//! surrounding whitespace and stripping trailing slashes. The list never holds
//! two entries that normalize to the same URL, and insertion is the only way
//! the list ever changes.

use crate::{config::keys::REPO_LIST, store::EnvMap};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Normalize URL for comparison and storage.
///
/// Normalizing twice yields the same result as normalizing once.
pub fn normalize_url_for_list(url: &str) -> String {
    url.trim_start()
        .trim_end_matches(|ch: char| ch == '/' || ch.is_whitespace())
        .to_string()
}

/// Parse raw repository list value.
///
/// Accepts line-separated entries, comma-separated entries, or both. Empty
/// fragments are dropped and order is preserved.
pub fn parse_repo_list(raw: &str) -> Vec<String> {
    raw.lines()
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check if any entry of list normalizes to the same URL.
pub fn contains_normalized(list: &[impl AsRef<str>], url: &str) -> bool {
    let url = normalize_url_for_list(url);
    list.iter()
        .any(|entry| normalize_url_for_list(entry.as_ref()) == url)
}

/// Append normalized URL to list unless it is already present.
///
/// Returns the list along with whether the URL was added.
pub fn ensure_present(mut list: Vec<String>, url: &str) -> (Vec<String>, bool) {
    let normalized = normalize_url_for_list(url);
    if normalized.is_empty() || contains_normalized(&list, &normalized) {
        return (list, false);
    }

    list.push(normalized);
    (list, true)
}

/// Ensure URL is listed under `REPO_LIST` of env mapping.
///
/// Rewrites `REPO_LIST` in the current one-per-line form only when the URL
/// was actually added. Returns whether it was added.
pub fn ensure_url_in_repo_list(map: &mut EnvMap, url: &str) -> bool {
    let mut list = RepoList::from(map.get(REPO_LIST).unwrap_or_default());
    if !list.insert(url) {
        return false;
    }

    map.insert(REPO_LIST, list.to_string());
    true
}

/// Ordered repository list editor.
///
/// # Invariant
///
/// - Every entry is normalized.
/// - No two entries are equal.
/// - Insertion never reorders or drops existing entries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepoList {
    urls: Vec<String>,
}

impl RepoList {
    /// Construct new empty repository list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert URL in normalized form, returning whether it was new.
    pub fn insert(&mut self, url: impl AsRef<str>) -> bool {
        let (urls, added) = ensure_present(std::mem::take(&mut self.urls), url.as_ref());
        self.urls = urls;
        added
    }

    /// Check if URL is already listed.
    pub fn contains(&self, url: impl AsRef<str>) -> bool {
        contains_normalized(&self.urls, url.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.urls.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl Display for RepoList {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.urls.join("\n"))
    }
}

impl From<&str> for RepoList {
    fn from(raw: &str) -> Self {
        let mut list = Self::new();
        for url in parse_repo_list(raw) {
            list.insert(url);
        }
        list
    }
}

impl<S> FromIterator<S> for RepoList
where
    S: AsRef<str>,
{
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = Self::new();
        for url in iter {
            list.insert(url);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case(" https://example.com/repo/ ", "https://example.com/repo"; "padded with slash")]
    #[test_case("https://example.com/repo", "https://example.com/repo"; "already normal")]
    #[test_case("https://example.com/repo//", "https://example.com/repo"; "double slash")]
    #[test_case("https://example.com/repo/ /", "https://example.com/repo"; "slash space slash")]
    #[test_case("  ", ""; "blank")]
    #[test]
    fn normalize_is_idempotent(url: &str, expect: &str) {
        let once = normalize_url_for_list(url);
        pretty_assertions::assert_eq!(once, expect);
        pretty_assertions::assert_eq!(normalize_url_for_list(&once), once);
    }

    #[test]
    fn parse_mixed_separators() {
        let result = parse_repo_list("https://a.com/r1,https://b.com/r2\nhttps://c.com/r3");
        pretty_assertions::assert_eq!(
            result,
            vec!["https://a.com/r1", "https://b.com/r2", "https://c.com/r3"]
        );
    }

    #[test]
    fn parse_drops_empty_fragments() {
        let result = parse_repo_list("\n , https://a.com/r1 ,,\r\n\nhttps://b.com/r2,\n");
        pretty_assertions::assert_eq!(result, vec!["https://a.com/r1", "https://b.com/r2"]);
        assert!(parse_repo_list("").is_empty());
    }

    #[test]
    fn ensure_present_appends_new_url() {
        let list = vec!["https://a.com/r1".to_string()];
        let (result, added) = ensure_present(list, " https://b.com/r2/ ");
        assert!(added);
        pretty_assertions::assert_eq!(result, vec!["https://a.com/r1", "https://b.com/r2"]);
    }

    #[test]
    fn ensure_present_keeps_list_on_duplicate() {
        let list = vec!["https://a.com/r1".to_string(), "https://b.com/r2/".to_string()];
        let (result, added) = ensure_present(list.clone(), "https://b.com/r2");
        assert!(!added);
        pretty_assertions::assert_eq!(result, list);

        let (result, added) = ensure_present(list.clone(), "   ");
        assert!(!added);
        pretty_assertions::assert_eq!(result, list);
    }

    #[test]
    fn ensure_url_in_repo_list_upgrades_comma_form() {
        let mut map: EnvMap = [("REPO_LIST", "https://a.com/r1,https://b.com/r2/")]
            .into_iter()
            .collect();

        assert!(ensure_url_in_repo_list(&mut map, "https://c.com/r3"));
        pretty_assertions::assert_eq!(
            map.get("REPO_LIST"),
            Some("https://a.com/r1\nhttps://b.com/r2\nhttps://c.com/r3")
        );

        assert!(!ensure_url_in_repo_list(&mut map, "https://a.com/r1/"));
        let lines = parse_repo_list(map.get("REPO_LIST").unwrap_or_default());
        pretty_assertions::assert_eq!(lines.len(), 3);
    }

    #[test]
    fn ensure_url_in_repo_list_creates_key() {
        let mut map = EnvMap::new();
        assert!(ensure_url_in_repo_list(&mut map, "https://a.com/r1/"));
        pretty_assertions::assert_eq!(map.get("REPO_LIST"), Some("https://a.com/r1"));
    }

    #[test]
    fn repo_list_collapses_duplicates() {
        let list = RepoList::from("https://a.com/r1\nhttps://a.com/r1/,https://b.com/r2");
        pretty_assertions::assert_eq!(list.len(), 2);
        assert!(list.contains("https://b.com/r2/"));
        pretty_assertions::assert_eq!(list.to_string(), "https://a.com/r1\nhttps://b.com/r2");
    }
}
