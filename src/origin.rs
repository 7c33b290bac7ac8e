//! Origins and match patterns.
//!
//! An origin is scheme + hostname with the port dropped. It is the identity
//! key for capability grants, content-script registrations and the persisted
//! origin → provider-script mapping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheme + hostname of a web page. Only `http` and `https` pages have one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin {
    scheme: String,
    host: String,
}

impl Origin {
    /// Parse an origin out of any page URL. Returns `None` for non-http(s)
    /// pages (browser internals, `file://`, extension pages) and hostless URLs.
    pub fn from_url(page_url: &str) -> Option<Self> {
        let parsed = url::Url::parse(page_url).ok()?;
        match parsed.scheme() {
            "http" | "https" => {}
            _ => return None,
        }
        let host = parsed.host_str()?.to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        Some(Self {
            scheme: parsed.scheme().to_string(),
            host,
        })
    }

    /// Parse a match pattern of the form `<scheme>://<host>/*`.
    pub fn from_match_pattern(pattern: &str) -> Option<Self> {
        let base = pattern.strip_suffix("/*")?;
        Self::from_url(base)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `<scheme>://<host>/*`, used both for permission requests
    /// and content-script registration ids.
    pub fn match_pattern(&self) -> String {
        format!("{}://{}/*", self.scheme, self.host)
    }

    /// Whether a page URL belongs to this origin (port ignored).
    pub fn matches_url(&self, page_url: &str) -> bool {
        Origin::from_url(page_url).is_some_and(|o| &o == self)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

impl TryFrom<String> for Origin {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Origin::from_url(&value).ok_or_else(|| format!("Invalid origin: \"{value}\""))
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.to_string()
    }
}

/// How the extension came to hold capability over an origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantState {
    /// Declared in the extension manifest at install time; cannot be toggled.
    Manifest,
    /// Requested at runtime by the user; revocable.
    User,
    None,
}
