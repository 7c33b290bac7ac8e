//! Tool resolution: which IDEs are worth offering for a repository.
//!
//! A repository's language composition is filtered by relevance, mapped through
//! a static language → tool table, deduplicated by tag and sorted. The sort is
//! part of the contract: buttons must come out in the same order no matter how
//! the hosting service ordered its language statistics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Languages at or below this share of the repository contribute no tools.
pub const RELEVANCE_THRESHOLD: f64 = 5.0;

/// Language whose tools are offered when nothing else qualifies.
pub const DEFAULT_LANGUAGE: &str = "java";

/// A candidate IDE. Two tools are the same tool when their tags match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    /// Identifier used in `jetbrains://<tag>/...` URLs
    pub tag: String,
    pub icon: String,
}

impl PartialEq for Tool {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for Tool {}

/// One entry of a repository's language composition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub percentage: f64,
}

impl Language {
    pub fn new(name: impl Into<String>, percentage: f64) -> Self {
        Self {
            name: name.into(),
            percentage,
        }
    }

    pub fn is_relevant(&self) -> bool {
        self.percentage > RELEVANCE_THRESHOLD
    }
}

/// (tag, display name)
const TOOLS: &[(&str, &str)] = &[
    ("appcode", "AppCode"),
    ("aqua", "Aqua"),
    ("clion", "CLion"),
    ("datagrip", "DataGrip"),
    ("dataspell", "DataSpell"),
    ("goland", "GoLand"),
    ("idea", "IntelliJ IDEA"),
    ("php-storm", "PhpStorm"),
    ("pycharm", "PyCharm"),
    ("rd", "Rider"),
    ("rubymine", "RubyMine"),
    ("rustrover", "RustRover"),
    ("studio", "Android Studio"),
    ("web-storm", "WebStorm"),
];

/// Normalized language name → candidate tool tags, most specific first.
const LANGUAGE_TOOLS: &[(&str, &[&str])] = &[
    ("java", &["idea"]),
    ("kotlin", &["idea", "studio"]),
    ("groovy", &["idea"]),
    ("scala", &["idea"]),
    ("clojure", &["idea"]),
    ("javascript", &["web-storm", "php-storm", "idea"]),
    ("typescript", &["web-storm", "php-storm", "idea"]),
    ("coffeescript", &["web-storm", "php-storm", "idea"]),
    ("vue", &["web-storm", "idea"]),
    ("html", &["web-storm", "php-storm", "idea"]),
    ("css", &["web-storm", "php-storm", "idea"]),
    ("scss", &["web-storm", "php-storm", "idea"]),
    ("less", &["web-storm", "php-storm", "idea"]),
    ("python", &["pycharm", "idea"]),
    ("jupyter notebook", &["dataspell", "pycharm"]),
    ("r", &["dataspell"]),
    ("php", &["php-storm", "idea"]),
    ("c", &["clion"]),
    ("c++", &["clion"]),
    ("objective-c", &["appcode", "clion"]),
    ("objective-c++", &["appcode", "clion"]),
    ("swift", &["appcode"]),
    ("go", &["goland", "idea"]),
    ("ruby", &["rubymine", "idea"]),
    ("c#", &["rd"]),
    ("f#", &["rd"]),
    ("visual basic .net", &["rd"]),
    ("rust", &["rustrover", "clion"]),
    ("dart", &["studio", "idea"]),
    ("sql", &["datagrip"]),
    ("plsql", &["datagrip"]),
    ("tsql", &["datagrip"]),
    ("gherkin", &["aqua", "idea"]),
    ("robotframework", &["aqua"]),
];

fn normalize_language(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Tool tags mapped from a language; unknown languages map to nothing.
pub fn tool_tags_for(language: &str) -> &'static [&'static str] {
    let key = normalize_language(language);
    LANGUAGE_TOOLS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, tags)| *tags)
        .unwrap_or(&[])
}

/// Look a tool up by its tag.
pub fn tool_by_tag(tag: &str) -> Option<Tool> {
    TOOLS.iter().find(|(t, _)| *t == tag).map(|(t, name)| Tool {
        name: (*name).to_string(),
        tag: (*t).to_string(),
        icon: format!("icons/{t}.svg"),
    })
}

/// Resolve the tools to offer for a language composition.
///
/// Always returns at least the default language's tools. The result is
/// ordered by tag (byte-wise), independent of input order and locale.
pub fn resolve_tools(languages: &[Language]) -> Vec<Tool> {
    let mut tags: BTreeSet<&'static str> = languages
        .iter()
        .filter(|language| language.is_relevant())
        .flat_map(|language| tool_tags_for(&language.name).iter().copied())
        .collect();

    if tags.is_empty() {
        tags = tool_tags_for(DEFAULT_LANGUAGE).iter().copied().collect();
    }

    tags.into_iter().filter_map(tool_by_tag).collect()
}

/// Convert raw per-language amounts (bytes, lines or percentages) into
/// percentages of the total. Non-positive totals yield no languages.
pub fn languages_from_amounts<I, S>(amounts: I) -> Vec<Language>
where
    I: IntoIterator<Item = (S, f64)>,
    S: Into<String>,
{
    let entries: Vec<(String, f64)> = amounts
        .into_iter()
        .map(|(name, amount)| (name.into(), amount))
        .filter(|(_, amount)| amount.is_finite() && *amount > 0.0)
        .collect();
    let total: f64 = entries.iter().map(|(_, amount)| amount).sum();
    if total <= 0.0 {
        return Vec::new();
    }
    entries
        .into_iter()
        .map(|(name, amount)| Language::new(name, amount * 100.0 / total))
        .collect()
}
