//! Hosting-service adapters.
//!
//! Each service (GitHub, GitLab, Bitbucket, Gitee) implements
//! `ProviderAdapter`; `Provider` is the closed set of them, picked per page
//! by configuration, hostname or page signature.

pub mod api;
pub mod bitbucket;
pub mod gitee;
pub mod github;
pub mod gitlab;
pub mod inject;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ExtensionConfig;
use crate::dom::{Document, Element};
use crate::logger::Logger;
use crate::origin::Origin;
use crate::storage::Protocol;
use crate::tools::{Language, Tool, languages_from_amounts, resolve_tools};

pub use bitbucket::BitbucketAdapter;
pub use gitee::GiteeAdapter;
pub use github::GitHubAdapter;
pub use gitlab::GitLabAdapter;

/// Script registered for origins whose service is not known up front; it
/// boots whichever adapter recognizes the page.
pub const DETECT_SCRIPT: &str = "content/detect.js";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    GitHub,
    GitLab,
    Bitbucket,
    Gitee,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::GitHub,
        ProviderKind::GitLab,
        ProviderKind::Bitbucket,
        ProviderKind::Gitee,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::Bitbucket => "bitbucket",
            ProviderKind::Gitee => "gitee",
        }
    }

    pub fn script_ref(self) -> &'static str {
        match self {
            ProviderKind::GitHub => "content/github.js",
            ProviderKind::GitLab => "content/gitlab.js",
            ProviderKind::Bitbucket => "content/bitbucket.js",
            ProviderKind::Gitee => "content/gitee.js",
        }
    }

    pub fn from_script_ref(script: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.script_ref() == script)
    }

    /// Guess from the hostname (`gitlab.example.com`, `github.corp`, ...).
    pub fn from_hostname(host: &str) -> Option<Self> {
        let labels: Vec<&str> = host.split('.').collect();
        Self::ALL
            .into_iter()
            .find(|k| labels.iter().any(|label| *label == k.name()))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| format!("Unknown provider {s:?} (expected github, gitlab, bitbucket or gitee)"))
    }
}

/// Provider script to register for a newly granted origin.
pub fn provider_script_for(origin: &Origin, config: &ExtensionConfig) -> String {
    config
        .self_hosted_kind(origin)
        .or_else(|| ProviderKind::from_hostname(origin.host()))
        .map(|k| k.script_ref().to_string())
        .unwrap_or_else(|| DETECT_SCRIPT.to_string())
}

/// Identity of the repository shown on a page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMetadata {
    pub user: Option<String>,
    pub repository: String,
    pub branch: String,
    pub https_clone_url: String,
    pub ssh_clone_url: String,
    /// Where the language composition comes from (an API URL)
    pub languages_source: String,
}

impl RepositoryMetadata {
    pub fn clone_url(&self, protocol: Protocol) -> &str {
        match protocol {
            Protocol::Https => &self.https_clone_url,
            Protocol::Ssh => &self.ssh_clone_url,
        }
    }

    /// Two page views show the same repository when their clone URLs match.
    pub fn same_repository(&self, other: &RepositoryMetadata) -> bool {
        self.https_clone_url == other.https_clone_url
    }
}

/// The page is not a repository view, or its metadata could not be fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataUnavailable {
    pub reason: String,
}

impl MetadataUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for MetadataUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Repository metadata unavailable: {}", self.reason)
    }
}

impl std::error::Error for MetadataUnavailable {}

/// File shown on a blob view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLocation {
    pub path: String,
    /// One-based line from the URL anchor
    pub line: Option<u32>,
}

#[async_trait(?Send)]
pub trait ProviderAdapter {
    fn kind(&self) -> ProviderKind;

    /// Whether the page carries this service's markers.
    fn recognizes(&self, doc: &Document) -> bool;

    async fn fetch_metadata(&self, doc: &Document) -> Result<RepositoryMetadata, MetadataUnavailable>;

    /// Language composition from `source`, an API URL taken from the
    /// metadata or from `languages_source_for_url`.
    async fn fetch_languages(&self, source: &str) -> Result<Vec<Language>, String>;

    /// Language composition scraped from the rendered statistics widget.
    fn scrape_languages(&self, doc: &Document) -> Vec<Language>;

    /// API URL with the language composition of the repository at `page_url`.
    fn languages_source_for_url(&self, page_url: &str) -> Option<String>;

    /// Where clone buttons go.
    fn clone_mount_selector(&self) -> &'static str;

    /// Where open-file buttons go on blob views.
    fn file_mount_selector(&self) -> &'static str;

    fn file_location(&self, page_url: &str) -> Option<FileLocation>;
}

pub enum Provider {
    GitHub(GitHubAdapter),
    GitLab(GitLabAdapter),
    Bitbucket(BitbucketAdapter),
    Gitee(GiteeAdapter),
}

impl Provider {
    pub fn for_kind(kind: ProviderKind, origin: &Origin, config: &ExtensionConfig) -> Result<Self, String> {
        let api_base = config.api_base(kind);
        Ok(match kind {
            ProviderKind::GitHub => Provider::GitHub(GitHubAdapter::new(origin, api_base)?),
            ProviderKind::GitLab => Provider::GitLab(GitLabAdapter::new(origin, api_base)?),
            ProviderKind::Bitbucket => Provider::Bitbucket(BitbucketAdapter::new(origin, api_base)?),
            ProviderKind::Gitee => Provider::Gitee(GiteeAdapter::new(origin, api_base)?),
        })
    }

    /// Pick the adapter for a page: configured self-hosted kind, then the
    /// registered script, then the hostname, then page signatures.
    pub fn detect(doc: &Document, script_ref: Option<&str>, config: &ExtensionConfig) -> Option<Self> {
        let origin = Origin::from_url(&doc.url())?;
        let hinted = config
            .self_hosted_kind(&origin)
            .or_else(|| script_ref.and_then(ProviderKind::from_script_ref))
            .or_else(|| ProviderKind::from_hostname(origin.host()));

        let build = |kind| match Provider::for_kind(kind, &origin, config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                tracing::warn!(target: "providers", "Cannot create {kind} adapter: {e}");
                None
            }
        };

        if let Some(kind) = hinted {
            return build(kind);
        }
        ProviderKind::ALL
            .into_iter()
            .filter_map(build)
            .find(|p| p.adapter().recognizes(doc))
    }

    pub fn adapter(&self) -> &dyn ProviderAdapter {
        match self {
            Provider::GitHub(a) => a,
            Provider::GitLab(a) => a,
            Provider::Bitbucket(a) => a,
            Provider::Gitee(a) => a,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.adapter().kind()
    }
}

/// Tools for a repository. Prefers the API; when that fails the statistics
/// widget is scraped instead, which is best-effort only since it depends on
/// the site's markup. Never empty.
pub async fn fetch_tools(
    adapter: &dyn ProviderAdapter,
    metadata: &RepositoryMetadata,
    doc: &Document,
    logger: &Logger,
) -> Vec<Tool> {
    let source = adapter.kind().name();
    let languages = match adapter.fetch_languages(&metadata.languages_source).await {
        Ok(languages) => languages,
        Err(e) => {
            logger.warn(source, format!("Language API failed ({e}); scraping page (best effort)"));
            let scraped = adapter.scrape_languages(doc);
            if scraped.is_empty() {
                logger.info(source, "No languages on page; using default tools");
            }
            scraped
        }
    };
    resolve_tools(&languages)
}

lazy_static! {
    static ref LANGUAGE_TEXT: Regex =
        Regex::new(r"^(.+?)\s*([0-9]+(?:\.[0-9]+)?)\s*%$").expect("valid regex");
    static ref LINE_ANCHOR: Regex = Regex::new(r"^(?:L|lines-)(\d+)").expect("valid regex");
}

/// Parse a `"Java 80.5%"` label.
pub(crate) fn parse_language_label(label: &str) -> Option<(String, f64)> {
    let caps = LANGUAGE_TEXT.captures(label.trim())?;
    let name = caps[1].trim().to_string();
    let percentage = caps[2].parse().ok()?;
    Some((name, percentage))
}

/// Scrape language labels from `selector`, reading each through `label`.
pub(crate) fn scrape_language_labels(
    doc: &Document,
    selector: &str,
    label: impl Fn(&Element) -> String,
) -> Vec<Language> {
    let items = match doc.query_selector_all(selector) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(target: "providers", "{e}");
            return Vec::new();
        }
    };
    let pairs: Vec<(String, f64)> = items
        .iter()
        .filter_map(|item| parse_language_label(&label(item)))
        .collect();
    languages_from_amounts(pairs)
}

/// Non-empty path segments of a page URL.
pub(crate) fn path_segments(page_url: &str) -> Vec<String> {
    url::Url::parse(page_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        })
        .unwrap_or_default()
}

/// Repository-relative file path from raw URL segments. Segments that are
/// not valid UTF-8 once decoded are kept as they appear in the URL.
pub(crate) fn decoded_path(segments: &[String]) -> String {
    segments
        .iter()
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.clone()))
        .collect::<Vec<_>>()
        .join("/")
}

/// One-based line from `#L42`, `#L42-L50` or `#lines-42`.
pub(crate) fn line_from_fragment(page_url: &str) -> Option<u32> {
    let parsed = url::Url::parse(page_url).ok()?;
    let caps = LINE_ANCHOR.captures(parsed.fragment()?)?;
    caps[1].parse().ok()
}

/// Content of `<meta name=... content=...>` or `<meta property=...>`.
pub(crate) fn meta_content(doc: &Document, key: &str, value: &str) -> Option<String> {
    let selector = format!("meta[{key}=\"{value}\"]");
    doc.query_selector(&selector)
        .ok()
        .flatten()
        .and_then(|m| m.attr("content"))
        .filter(|c| !c.trim().is_empty())
}

/// Page state for one content-script context.
///
/// `Idle → MetadataFetched → ToolsResolved → UiInjected`, with
/// `Idle | MetadataFetched → Unavailable`. Navigation resets to `Idle`;
/// turning page modification off steps back from `UiInjected` to
/// `ToolsResolved`.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum PageState {
    #[default]
    Idle,
    MetadataFetched(RepositoryMetadata),
    ToolsResolved {
        metadata: RepositoryMetadata,
        tools: Vec<Tool>,
    },
    UiInjected {
        metadata: RepositoryMetadata,
        tools: Vec<Tool>,
    },
    Unavailable(MetadataUnavailable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid page transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl PageState {
    pub fn name(&self) -> &'static str {
        match self {
            PageState::Idle => "IDLE",
            PageState::MetadataFetched(_) => "METADATA_FETCHED",
            PageState::ToolsResolved { .. } => "TOOLS_RESOLVED",
            PageState::UiInjected { .. } => "UI_INJECTED",
            PageState::Unavailable(_) => "UNAVAILABLE",
        }
    }

    pub fn metadata(&self) -> Option<&RepositoryMetadata> {
        match self {
            PageState::MetadataFetched(m) => Some(m),
            PageState::ToolsResolved { metadata, .. } | PageState::UiInjected { metadata, .. } => Some(metadata),
            PageState::Idle | PageState::Unavailable(_) => None,
        }
    }

    pub fn tools(&self) -> Option<&[Tool]> {
        match self {
            PageState::ToolsResolved { tools, .. } | PageState::UiInjected { tools, .. } => Some(tools),
            _ => None,
        }
    }

    fn invalid(&self, to: &'static str) -> InvalidTransition {
        InvalidTransition { from: self.name(), to }
    }

    pub fn metadata_fetched(&mut self, metadata: RepositoryMetadata) -> Result<(), InvalidTransition> {
        match self {
            PageState::Idle => {
                *self = PageState::MetadataFetched(metadata);
                Ok(())
            }
            _ => Err(self.invalid("METADATA_FETCHED")),
        }
    }

    pub fn unavailable(&mut self, reason: MetadataUnavailable) -> Result<(), InvalidTransition> {
        match self {
            PageState::Idle | PageState::MetadataFetched(_) => {
                *self = PageState::Unavailable(reason);
                Ok(())
            }
            _ => Err(self.invalid("UNAVAILABLE")),
        }
    }

    pub fn tools_resolved(&mut self, tools: Vec<Tool>) -> Result<(), InvalidTransition> {
        match std::mem::take(self) {
            PageState::MetadataFetched(metadata) => {
                *self = PageState::ToolsResolved { metadata, tools };
                Ok(())
            }
            other => {
                *self = other;
                Err(self.invalid("TOOLS_RESOLVED"))
            }
        }
    }

    pub fn ui_injected(&mut self) -> Result<(), InvalidTransition> {
        match std::mem::take(self) {
            PageState::ToolsResolved { metadata, tools } | PageState::UiInjected { metadata, tools } => {
                *self = PageState::UiInjected { metadata, tools };
                Ok(())
            }
            other => {
                *self = other;
                Err(self.invalid("UI_INJECTED"))
            }
        }
    }

    pub fn ui_removed(&mut self) {
        if let PageState::UiInjected { metadata, tools } = std::mem::take(self) {
            *self = PageState::ToolsResolved { metadata, tools };
        }
    }

    pub fn reset(&mut self) {
        *self = PageState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelfHostedProvider;
    use crate::tools::tool_by_tag;

    #[test]
    fn provider_kind_parses_names() {
        assert_eq!("gitlab".parse::<ProviderKind>(), Ok(ProviderKind::GitLab));
        assert_eq!("GitHub".parse::<ProviderKind>(), Ok(ProviderKind::GitHub));
        assert!("gitea".parse::<ProviderKind>().is_err());
    }

    fn metadata() -> RepositoryMetadata {
        RepositoryMetadata {
            user: Some("a".into()),
            repository: "b".into(),
            branch: "main".into(),
            https_clone_url: "https://github.com/a/b.git".into(),
            ssh_clone_url: "git@github.com:a/b.git".into(),
            languages_source: "https://api.github.com/repos/a/b/languages".into(),
        }
    }

    #[test]
    fn kind_from_hostname_labels() {
        assert_eq!(ProviderKind::from_hostname("gitlab.corp.example"), Some(ProviderKind::GitLab));
        assert_eq!(ProviderKind::from_hostname("github.com"), Some(ProviderKind::GitHub));
        assert_eq!(ProviderKind::from_hostname("code.gitee.com"), Some(ProviderKind::Gitee));
        assert_eq!(ProviderKind::from_hostname("mygitlab.example"), None);
        assert_eq!(ProviderKind::from_hostname("git.corp.example"), None);
    }

    #[test]
    fn script_selection_order() {
        let mut config = ExtensionConfig::default();
        let corp = Origin::from_url("https://git.corp.example").unwrap();
        assert_eq!(provider_script_for(&corp, &config), DETECT_SCRIPT);

        let heuristic = Origin::from_url("https://gitlab.corp.example").unwrap();
        assert_eq!(provider_script_for(&heuristic, &config), "content/gitlab.js");

        config.self_hosted.push(SelfHostedProvider {
            origin: corp.clone(),
            kind: ProviderKind::Bitbucket,
        });
        assert_eq!(provider_script_for(&corp, &config), "content/bitbucket.js");
    }

    #[test]
    fn script_refs_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_script_ref(kind.script_ref()), Some(kind));
        }
        assert_eq!(ProviderKind::from_script_ref(DETECT_SCRIPT), None);
    }

    #[test]
    fn detect_by_page_signature() {
        let doc = Document::new("https://git.corp.example/group/project");
        doc.head().append_child(
            &doc.create_element("meta")
                .with_attr("property", "og:site_name")
                .with_attr("content", "GitLab"),
        );
        let provider = Provider::detect(&doc, Some(DETECT_SCRIPT), &ExtensionConfig::default()).unwrap();
        assert_eq!(provider.kind(), ProviderKind::GitLab);
    }

    #[test]
    fn detect_prefers_registered_script() {
        let doc = Document::new("https://code.corp.example/o/r");
        let provider =
            Provider::detect(&doc, Some("content/gitee.js"), &ExtensionConfig::default()).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Gitee);
    }

    #[test]
    fn detect_nothing_on_unknown_page() {
        let doc = Document::new("https://example.com/");
        assert!(Provider::detect(&doc, None, &ExtensionConfig::default()).is_none());
        let internal = Document::new("chrome://settings");
        assert!(Provider::detect(&internal, None, &ExtensionConfig::default()).is_none());
    }

    #[test]
    fn language_labels() {
        assert_eq!(parse_language_label("Java 80.5%"), Some(("Java".into(), 80.5)));
        assert_eq!(parse_language_label(" C++\n 3% "), Some(("C++".into(), 3.0)));
        assert_eq!(parse_language_label("Jupyter Notebook 12.0 %"), Some(("Jupyter Notebook".into(), 12.0)));
        assert_eq!(parse_language_label("Other"), None);
    }

    #[test]
    fn line_anchors() {
        assert_eq!(line_from_fragment("https://github.com/a/b/blob/main/x.rs#L42"), Some(42));
        assert_eq!(line_from_fragment("https://github.com/a/b/blob/main/x.rs#L10-L20"), Some(10));
        assert_eq!(line_from_fragment("https://bitbucket.org/w/r/src/main/x.rs#lines-7"), Some(7));
        assert_eq!(line_from_fragment("https://github.com/a/b/blob/main/x.rs"), None);
        assert_eq!(line_from_fragment("https://github.com/a/b/blob/main/x.rs#readme"), None);
    }

    #[test]
    fn segments_skip_empty_parts() {
        assert_eq!(path_segments("https://github.com/a//b/"), vec!["a", "b"]);
        assert!(path_segments("not a url").is_empty());
    }

    #[test]
    fn decoded_path_unescapes_segments() {
        let segments = path_segments("https://github.com/a/b/blob/main/docs/my%20file%23.md");
        assert_eq!(decoded_path(&segments[4..]), "docs/my file#.md");
        assert_eq!(decoded_path(&["caf%C3%A9".to_string(), "bad%FF".to_string()]), "café/bad%FF");
    }

    #[test]
    fn state_machine_happy_path() {
        let mut state = PageState::default();
        state.metadata_fetched(metadata()).unwrap();
        state.tools_resolved(vec![tool_by_tag("idea").unwrap()]).unwrap();
        state.ui_injected().unwrap();
        assert_eq!(state.name(), "UI_INJECTED");
        assert_eq!(state.tools().unwrap().len(), 1);
        state.ui_removed();
        assert_eq!(state.name(), "TOOLS_RESOLVED");
        assert_eq!(state.metadata().unwrap().repository, "b");
    }

    #[test]
    fn state_machine_guards() {
        let mut state = PageState::default();
        let err = state.tools_resolved(Vec::new()).unwrap_err();
        assert_eq!(err.from, "IDLE");
        assert_eq!(state, PageState::Idle);

        state.metadata_fetched(metadata()).unwrap();
        assert!(state.metadata_fetched(metadata()).is_err());
        state.unavailable(MetadataUnavailable::new("api down")).unwrap();
        assert!(state.ui_injected().is_err());
        assert_eq!(state.name(), "UNAVAILABLE");

        state.reset();
        assert_eq!(state, PageState::Idle);
    }

    #[test]
    fn clone_url_follows_protocol() {
        let m = metadata();
        assert_eq!(m.clone_url(Protocol::Https), "https://github.com/a/b.git");
        assert_eq!(m.clone_url(Protocol::Ssh), "git@github.com:a/b.git");
    }
}
