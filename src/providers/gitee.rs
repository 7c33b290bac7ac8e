use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use super::api::{RestClient, token_from_env};
use super::{
    FileLocation, MetadataUnavailable, ProviderAdapter, ProviderKind, RepositoryMetadata,
    decoded_path, line_from_fragment, meta_content, path_segments, scrape_language_labels,
};
use crate::dom::Document;
use crate::origin::Origin;
use crate::tools::{Language, languages_from_amounts};

#[derive(Debug, Deserialize)]
struct Repo {
    path: String,
    html_url: String,
    ssh_url: String,
    default_branch: Option<String>,
    namespace: Option<Namespace>,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    path: String,
}

pub struct GiteeAdapter {
    api: RestClient,
}

impl GiteeAdapter {
    pub fn new(origin: &Origin, api_base: Option<&str>) -> Result<Self, String> {
        let base = api_base.map(str::to_string).unwrap_or_else(|| origin.to_string());
        Ok(Self {
            api: RestClient::new(&base)?.with_token(token_from_env(&["GITEE_TOKEN"])),
        })
    }

    fn owner_repo(page_url: &str) -> Option<(String, String)> {
        let segments = path_segments(page_url);
        let [owner, repo, ..] = segments.as_slice() else {
            return None;
        };
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        Some((owner.clone(), repo.to_string()))
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        self.api.url(&format!("/api/v5/repos/{owner}/{repo}"))
    }
}

fn with_git_suffix(url: &str) -> String {
    if url.ends_with(".git") {
        url.to_string()
    } else {
        format!("{}.git", url.trim_end_matches('/'))
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for GiteeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitee
    }

    fn recognizes(&self, doc: &Document) -> bool {
        meta_content(doc, "property", "og:site_name").as_deref() == Some("Gitee")
    }

    async fn fetch_metadata(&self, doc: &Document) -> Result<RepositoryMetadata, MetadataUnavailable> {
        let (owner, repo) =
            Self::owner_repo(&doc.url()).ok_or_else(|| MetadataUnavailable::new("not a repository page"))?;
        let repo_url = self.repo_url(&owner, &repo);
        let info: Repo = self.api.get_json(&repo_url).await.map_err(MetadataUnavailable::new)?;

        Ok(RepositoryMetadata {
            user: Some(info.namespace.map(|ns| ns.path).unwrap_or(owner)),
            repository: info.path,
            branch: info.default_branch.unwrap_or_else(|| "master".to_string()),
            https_clone_url: with_git_suffix(&info.html_url),
            ssh_clone_url: info.ssh_url,
            languages_source: format!("{repo_url}/languages"),
        })
    }

    async fn fetch_languages(&self, source: &str) -> Result<Vec<Language>, String> {
        let amounts: HashMap<String, f64> = self.api.get_json(source).await?;
        Ok(languages_from_amounts(amounts))
    }

    fn scrape_languages(&self, doc: &Document) -> Vec<Language> {
        scrape_language_labels(doc, ".lang-list .lang-item", |item| item.text_content())
    }

    fn languages_source_for_url(&self, page_url: &str) -> Option<String> {
        let (owner, repo) = Self::owner_repo(page_url)?;
        Some(format!("{}/languages", self.repo_url(&owner, &repo)))
    }

    fn clone_mount_selector(&self) -> &'static str {
        ".git-project-download-panel"
    }

    fn file_mount_selector(&self) -> &'static str {
        ".file_title .options"
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

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::from_url("https://gitee.com").unwrap()
    }

    #[tokio::test]
    async fn metadata_and_languages() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v5/repos/mindspore/docs")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"path": "docs", "html_url": "https://gitee.com/mindspore/docs",
                    "ssh_url": "git@gitee.com:mindspore/docs.git", "default_branch": "master",
                    "namespace": {"path": "mindspore"}}"#,
            )
            .create_async()
            .await;
        let _mock = server
            .mock("GET", "/api/v5/repos/mindspore/docs/languages")
            .with_status(200)
            .with_body(r#"{"Python": 800, "C++": 200}"#)
            .create_async()
            .await;

        let adapter = GiteeAdapter::new(&origin(), Some(&server.url())).unwrap();
        let doc = Document::new("https://gitee.com/mindspore/docs");
        let metadata = adapter.fetch_metadata(&doc).await.unwrap();
        assert_eq!(metadata.https_clone_url, "https://gitee.com/mindspore/docs.git");
        assert_eq!(metadata.user.as_deref(), Some("mindspore"));

        let mut languages = adapter.fetch_languages(&metadata.languages_source).await.unwrap();
        languages.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(languages, vec![Language::new("C++", 20.0), Language::new("Python", 80.0)]);
    }

    #[tokio::test]
    async fn missing_repository_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v5/repos/nobody/nothing")
            .with_status(404)
            .create_async()
            .await;
        let adapter = GiteeAdapter::new(&origin(), Some(&server.url())).unwrap();
        let doc = Document::new("https://gitee.com/nobody/nothing");
        assert!(adapter.fetch_metadata(&doc).await.is_err());
    }

    #[test]
    fn git_suffix_added_once() {
        assert_eq!(with_git_suffix("https://gitee.com/a/b"), "https://gitee.com/a/b.git");
        assert_eq!(with_git_suffix("https://gitee.com/a/b/"), "https://gitee.com/a/b.git");
        assert_eq!(with_git_suffix("https://gitee.com/a/b.git"), "https://gitee.com/a/b.git");
    }

    #[test]
    fn file_location_decodes_escaped_names() {
        let adapter = GiteeAdapter::new(&origin(), None).unwrap();
        let location = adapter
            .file_location("https://gitee.com/a/b/blob/master/%E6%96%87%E6%A1%A3/read%20me.md#L5")
            .unwrap();
        assert_eq!(location.path, "文档/read me.md");
        assert_eq!(location.line, Some(5));
        assert!(adapter.file_location("https://gitee.com/a/b/tree/master").is_none());
    }

    #[test]
    fn recognizes_site_name() {
        let adapter = GiteeAdapter::new(&origin(), None).unwrap();
        let doc = Document::new("https://code.example/a/b");
        assert!(!adapter.recognizes(&doc));
        doc.head().append_child(
            &doc.create_element("meta")
                .with_attr("property", "og:site_name")
                .with_attr("content", "Gitee"),
        );
        assert!(adapter.recognizes(&doc));
    }
}
