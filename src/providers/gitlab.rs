use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use super::api::{RestClient, token_from_env};
use super::{
    FileLocation, MetadataUnavailable, ProviderAdapter, ProviderKind, RepositoryMetadata,
    decoded_path, line_from_fragment, meta_content, path_segments, scrape_language_labels,
};
use crate::dom::{Document, Element};
use crate::origin::Origin;
use crate::tools::{Language, languages_from_amounts};

#[derive(Debug, Deserialize)]
struct Project {
    path: String,
    http_url_to_repo: String,
    ssh_url_to_repo: String,
    default_branch: Option<String>,
    namespace: Option<Namespace>,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    full_path: String,
}

pub struct GitLabAdapter {
    api: RestClient,
}

impl GitLabAdapter {
    /// Every GitLab instance serves its API under `/api/v4` of its own origin.
    pub fn new(origin: &Origin, api_base: Option<&str>) -> Result<Self, String> {
        let base = api_base.map(str::to_string).unwrap_or_else(|| origin.to_string());
        Ok(Self {
            api: RestClient::new(&base)?.with_token(token_from_env(&["GITLAB_TOKEN"])),
        })
    }

    fn project_id(doc: &Document) -> Option<String> {
        doc.body()
            .attr("data-project-id")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    /// `id` is either the numeric id or the URL-encoded full path.
    fn project_url(&self, id: &str) -> String {
        self.api.url(&format!("/api/v4/projects/{id}"))
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for GitLabAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    fn recognizes(&self, doc: &Document) -> bool {
        Self::project_id(doc).is_some()
            || meta_content(doc, "property", "og:site_name").as_deref() == Some("GitLab")
    }

    async fn fetch_metadata(&self, doc: &Document) -> Result<RepositoryMetadata, MetadataUnavailable> {
        let id = Self::project_id(doc).ok_or_else(|| MetadataUnavailable::new("no project id on page"))?;
        let project_url = self.project_url(&id);
        let project: Project = self
            .api
            .get_json(&project_url)
            .await
            .map_err(MetadataUnavailable::new)?;

        Ok(RepositoryMetadata {
            user: project.namespace.map(|ns| ns.full_path),
            repository: project.path,
            branch: project.default_branch.unwrap_or_else(|| "HEAD".to_string()),
            https_clone_url: project.http_url_to_repo,
            ssh_clone_url: project.ssh_url_to_repo,
            languages_source: format!("{project_url}/languages"),
        })
    }

    async fn fetch_languages(&self, source: &str) -> Result<Vec<Language>, String> {
        // Already percentages, renormalised in case they do not sum to 100
        let shares: HashMap<String, f64> = self.api.get_json(source).await?;
        Ok(languages_from_amounts(shares))
    }

    fn scrape_languages(&self, doc: &Document) -> Vec<Language> {
        let label = |bar: &Element| {
            bar.attr("title")
                .or_else(|| bar.attr("data-original-title"))
                .unwrap_or_else(|| bar.text_content())
        };
        scrape_language_labels(doc, ".repository-languages-bar .progress-bar", label)
    }

    fn languages_source_for_url(&self, page_url: &str) -> Option<String> {
        // Projects nest under groups; the path ends at the `-` separator.
        let segments = path_segments(page_url);
        let mut path: Vec<&str> = segments
            .iter()
            .map(String::as_str)
            .take_while(|s| *s != "-")
            .collect();
        if let Some(last) = path.last_mut() {
            let name = *last;
            *last = name.strip_suffix(".git").unwrap_or(name);
        }
        if path.len() < 2 {
            return None;
        }
        Some(format!("{}/languages", self.project_url(&path.join("%2F"))))
    }

    fn clone_mount_selector(&self) -> &'static str {
        ".project-clone-holder"
    }

    fn file_mount_selector(&self) -> &'static str {
        ".file-actions"
    }

    fn file_location(&self, page_url: &str) -> Option<FileLocation> {
        // /{group...}/{project}/-/blob/{branch}/{path...}
        let segments = path_segments(page_url);
        let dash = segments.iter().position(|s| s == "-")?;
        let rest = &segments[dash + 1..];
        if rest.len() < 3 || rest[0] != "blob" {
            return None;
        }
        Some(FileLocation {
            path: decoded_path(&rest[2..]),
            line: line_from_fragment(page_url),
        })
    }
}
