use async_trait::async_trait;
use std::collections::HashMap;

use super::api::{RestClient, token_from_env};
use super::{
    FileLocation, MetadataUnavailable, ProviderAdapter, ProviderKind, RepositoryMetadata,
    decoded_path, line_from_fragment, meta_content, path_segments, scrape_language_labels,
};
use crate::dom::Document;
use crate::origin::Origin;
use crate::tools::{Language, languages_from_amounts};

const PUBLIC_HOST: &str = "github.com";
const PUBLIC_API: &str = "https://api.github.com";
const NWO_META: &str = "octolytics-dimension-repository_nwo";

pub struct GitHubAdapter {
    origin: Origin,
    api: RestClient,
}

impl GitHubAdapter {
    /// github.com talks to api.github.com; Enterprise hosts serve `/api/v3`.
    pub fn new(origin: &Origin, api_base: Option<&str>) -> Result<Self, String> {
        let base = match api_base {
            Some(base) => base.to_string(),
            None if origin.host() == PUBLIC_HOST => PUBLIC_API.to_string(),
            None => format!("{origin}/api/v3"),
        };
        Ok(Self {
            origin: origin.clone(),
            api: RestClient::new(&base)?.with_token(token_from_env(&["GH_TOKEN", "GITHUB_TOKEN"])),
        })
    }

    /// `(owner, repo)` of the repository the page belongs to.
    fn owner_repo(doc: &Document) -> Option<(String, String)> {
        let nwo = meta_content(doc, "name", NWO_META)?;
        let (owner, repo) = nwo.split_once('/')?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some((owner.to_string(), repo.to_string()))
    }

    fn languages_url(&self, owner: &str, repo: &str) -> String {
        self.api.url(&format!("/repos/{owner}/{repo}/languages"))
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for GitHubAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    fn recognizes(&self, doc: &Document) -> bool {
        meta_content(doc, "name", NWO_META).is_some()
            || meta_content(doc, "property", "og:site_name").as_deref() == Some("GitHub")
    }

    async fn fetch_metadata(&self, doc: &Document) -> Result<RepositoryMetadata, MetadataUnavailable> {
        let (owner, repo) =
            Self::owner_repo(doc).ok_or_else(|| MetadataUnavailable::new("not a repository page"))?;
        let segments = path_segments(&doc.url());
        let branch = match segments.get(2).map(String::as_str) {
            Some("tree" | "blob") => segments.get(3).cloned(),
            _ => None,
        }
        .unwrap_or_else(|| "HEAD".to_string());

        Ok(RepositoryMetadata {
            https_clone_url: format!("{}/{owner}/{repo}.git", self.origin),
            ssh_clone_url: format!("git@{}:{owner}/{repo}.git", self.origin.host()),
            languages_source: self.languages_url(&owner, &repo),
            user: Some(owner),
            repository: repo,
            branch,
        })
    }

    async fn fetch_languages(&self, source: &str) -> Result<Vec<Language>, String> {
        // Byte counts per language
        let bytes: HashMap<String, f64> = self.api.get_json(source).await?;
        Ok(languages_from_amounts(bytes))
    }

    fn scrape_languages(&self, doc: &Document) -> Vec<Language> {
        scrape_language_labels(doc, ".BorderGrid li.d-inline", |item| item.text_content())
    }

    fn languages_source_for_url(&self, page_url: &str) -> Option<String> {
        let segments = path_segments(page_url);
        let [owner, repo, ..] = segments.as_slice() else {
            return None;
        };
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        Some(self.languages_url(owner, repo))
    }

    fn clone_mount_selector(&self) -> &'static str {
        ".file-navigation"
    }

    fn file_mount_selector(&self) -> &'static str {
        ".react-blob-header-edit-and-raw-actions"
    }

    fn file_location(&self, page_url: &str) -> Option<FileLocation> {
        // /{owner}/{repo}/blob/{branch}/{path...}
        let segments = path_segments(page_url);
        if segments.len() < 5 || segments[2] != "blob" {
            return None;
        }
        Some(FileLocation {
            path: decoded_path(&segments[4..]),
            line: line_from_fragment(page_url),
        })
    }
}
