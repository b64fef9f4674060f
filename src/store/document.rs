// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Env document layout.
//!
//! The env file is a flat, line-oriented `KEY=VALUE` document. Blank lines and
//! lines starting with `#` are ignored when reading, and a fixed header is
//! regenerated on every write. File I/O is left to the caller to figure out.
//!
//! # Quoting
//!
//! Values never span raw lines. Any value that would not survive the trip
//! through a plain `KEY=VALUE` line, i.e., one that holds a line break, carries
//! surrounding whitespace, or starts with a double quote, is written
//! double-quoted with `\\`, `\"`, `\n`, and `\r` escapes. Only values wrapped
//! in double quotes are unescaped on read. Everything else is taken verbatim,
//! so bare backslashes like those in Windows paths come back untouched.
//!
//! A quoted value is only unescaped if it reads like something bbsync wrote
//! itself: every backslash starts one of the four escapes above and no bare
//! double quote is left inside. Otherwise the text between the quotes is taken
//! verbatim, so a hand-quoted `"C:\new\ca.pem"` survives. A hand-quoted value
//! made up of valid escapes only, like `"C:\new"`, cannot be told apart from a
//! written one and is still unescaped. Leave such values unquoted.

use std::{
    borrow::Cow,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Header regenerated at the top of every written document.
pub const HEADER: [&str; 3] = [
    "# Bitbucket Sync .env",
    "# Fill required values. INSECURE=true by default.",
    "",
];

/// Insertion-ordered mapping of env keys to values.
///
/// # Invariant
///
/// - Keys are unique.
/// - Overwriting a key keeps its original position.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvMap {
    entries: Vec<(String, String)>,
}

impl EnvMap {
    /// Construct new empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse env document leniently.
    ///
    /// Lines that are not `KEY=VALUE` are skipped and handed back as
    /// [`MalformedLine`] diagnostics instead of failing the whole parse.
    pub fn parse(content: &str) -> (Self, Vec<MalformedLine>) {
        let mut map = Self::new();
        let mut malformed = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match trimmed.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    map.insert(key.trim(), decode_value(value.trim()));
                }
                _ => malformed.push(MalformedLine {
                    line_number: index + 1,
                    content: line.to_string(),
                }),
            }
        }

        (map, malformed)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Set key to value, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, old)) => Some(std::mem::replace(old, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Remove key, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Display for EnvMap {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for line in HEADER {
            writeln!(fmt, "{line}")?;
        }

        for (key, value) in &self.entries {
            writeln!(fmt, "{key}={}", encode_value(value))?;
        }

        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for EnvMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl From<&str> for EnvMap {
    fn from(content: &str) -> Self {
        Self::parse(content).0
    }
}

/// Line that does not have `KEY=VALUE` shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line_number} is not KEY=VALUE: {content:?}")]
pub struct MalformedLine {
    pub line_number: usize,
    pub content: String,
}

fn needs_quotes(value: &str) -> bool {
    value.contains(['\n', '\r']) || value.trim() != value || value.starts_with('"')
}

fn encode_value(value: &str) -> Cow<'_, str> {
    if !needs_quotes(value) {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('"');

    Cow::Owned(out)
}

fn decode_value(raw: &str) -> String {
    let Some(inner) = raw.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) else {
        return raw.to_string();
    };

    unescape(inner).unwrap_or_else(|| inner.to_string())
}

/// Reverse [`encode_value`], or `None` if text was not written by it.
fn unescape(inner: &str) -> Option<String> {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                _ => return None,
            },
            '"' => return None,
            _ => out.push(ch),
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use simple_test_case::test_case;

    #[test]
    fn parse_skips_comments_blanks_and_malformed_lines() {
        let content = indoc! {r#"
            # Bitbucket Sync .env

            INSECURE = true
            BB_BASE_DIR=/srv/mirror
            just some garbage
            =no key here
            BITBUCKET_WORKSPACE=team=alpha
        "#};

        let (result, malformed) = EnvMap::parse(content);
        let expect: EnvMap = [
            ("INSECURE", "true"),
            ("BB_BASE_DIR", "/srv/mirror"),
            ("BITBUCKET_WORKSPACE", "team=alpha"),
        ]
        .into_iter()
        .collect();

        pretty_assertions::assert_eq!(result, expect);
        pretty_assertions::assert_eq!(
            malformed.iter().map(|m| m.line_number).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[test]
    fn insert_keeps_original_position() {
        let mut map: EnvMap = [("A", "1"), ("B", "2")].into_iter().collect();
        pretty_assertions::assert_eq!(map.insert("A", "3"), Some("1".into()));
        pretty_assertions::assert_eq!(map.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        pretty_assertions::assert_eq!(map.get("A"), Some("3"));
        pretty_assertions::assert_eq!(map.remove("B"), Some("2".into()));
        pretty_assertions::assert_eq!(map.remove("B"), None);
    }

    #[test]
    fn display_writes_header_then_entries() {
        let map: EnvMap = [
            ("INSECURE", "true"),
            ("REPO_LIST", "https://a.com/r1\nhttps://b.com/r2"),
            ("GIT_CA_BUNDLE", r"C:\certs\new\ca.pem"),
        ]
        .into_iter()
        .collect();

        let expect = indoc! {r#"
            # Bitbucket Sync .env
            # Fill required values. INSECURE=true by default.

            INSECURE=true
            REPO_LIST="https://a.com/r1\nhttps://b.com/r2"
            GIT_CA_BUNDLE=C:\certs\new\ca.pem
        "#};

        pretty_assertions::assert_eq!(map.to_string(), expect);
    }

    #[test_case("plain"; "plain value")]
    #[test_case(""; "empty value")]
    #[test_case("line one\nline two\r\n"; "line breaks")]
    #[test_case("  padded  "; "surrounding whitespace")]
    #[test_case("\"quoted\""; "already quoted")]
    #[test_case("\""; "lone quote")]
    #[test_case(r"back\slash\n"; "literal backslash n")]
    #[test_case("a=b=c"; "equals signs")]
    #[test]
    fn value_survives_document(value: &str) {
        let map: EnvMap = [("KEY", value)].into_iter().collect();
        let result = EnvMap::from(map.to_string().as_str());
        pretty_assertions::assert_eq!(result.get("KEY"), Some(value));
    }

    #[test_case(r#""C:\new\ca.pem""#, r"C:\new\ca.pem"; "hand quoted windows path")]
    #[test_case(r#""C:\certs\""#, r"C:\certs\"; "dangling backslash")]
    #[test_case(r#""say "hi"""#, r#"say "hi""#; "bare inner quotes")]
    #[test_case(r#""line\nbreak""#, "line\nbreak"; "written escape")]
    #[test_case(r#""""#, ""; "empty quotes")]
    #[test_case(r#"""#, r#"""#; "lone quote")]
    #[test]
    fn decode_hand_written_value(raw: &str, expect: &str) {
        pretty_assertions::assert_eq!(decode_value(raw), expect);
    }
}
