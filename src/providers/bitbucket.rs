use async_trait::async_trait;
use serde::Deserialize;

use super::api::{RestClient, token_from_env};
use super::{
    FileLocation, MetadataUnavailable, ProviderAdapter, ProviderKind, RepositoryMetadata,
    decoded_path, line_from_fragment, meta_content, path_segments,
};
use crate::dom::Document;
use crate::origin::Origin;
use crate::tools::Language;

const PUBLIC_HOST: &str = "bitbucket.org";
const PUBLIC_API: &str = "https://api.bitbucket.org";

/// First path segments of bitbucket.org pages that are not workspaces.
const RESERVED: &[&str] = &["account", "dashboard", "product", "repo", "site", "snippets", "socialauth"];

#[derive(Debug, Deserialize)]
struct Repository {
    slug: String,
    #[serde(default)]
    language: String,
    mainbranch: Option<Branch>,
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Branch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(default)]
    clone: Vec<CloneLink>,
}

#[derive(Debug, Deserialize)]
struct CloneLink {
    name: String,
    href: String,
}

pub struct BitbucketAdapter {
    api: RestClient,
}

impl BitbucketAdapter {
    /// Bitbucket Cloud only; other hosts need an API base in the config.
    pub fn new(origin: &Origin, api_base: Option<&str>) -> Result<Self, String> {
        let base = match api_base {
            Some(base) => base.to_string(),
            None if origin.host() == PUBLIC_HOST => PUBLIC_API.to_string(),
            None => format!("{origin}/!api"),
        };
        Ok(Self {
            api: RestClient::new(&base)?.with_token(token_from_env(&["BITBUCKET_TOKEN"])),
        })
    }

    fn workspace_slug(page_url: &str) -> Option<(String, String)> {
        let segments = path_segments(page_url);
        let [workspace, slug, ..] = segments.as_slice() else {
            return None;
        };
        if RESERVED.contains(&workspace.as_str()) {
            return None;
        }
        let slug = slug.strip_suffix(".git").unwrap_or(slug);
        Some((workspace.clone(), slug.to_string()))
    }

    fn repository_url(&self, workspace: &str, slug: &str) -> String {
        self.api.url(&format!("/2.0/repositories/{workspace}/{slug}"))
    }
}

/// Drop the `user@` Bitbucket puts into HTTPS clone links.
fn strip_userinfo(href: &str) -> String {
    match url::Url::parse(href) {
        Ok(mut parsed) if parsed.scheme() == "https" => {
            // Only fails for cannot-be-a-base URLs, which https never is
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => href.to_string(),
    }
}

#[async_trait(?Send)]
impl ProviderAdapter for BitbucketAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bitbucket
    }

    fn recognizes(&self, doc: &Document) -> bool {
        meta_content(doc, "name", "application-name").as_deref() == Some("Bitbucket")
            || meta_content(doc, "property", "og:site_name").as_deref() == Some("Bitbucket")
    }

    async fn fetch_metadata(&self, doc: &Document) -> Result<RepositoryMetadata, MetadataUnavailable> {
        let (workspace, slug) = Self::workspace_slug(&doc.url())
            .ok_or_else(|| MetadataUnavailable::new("not a repository page"))?;
        let repository_url = self.repository_url(&workspace, &slug);
        let repository: Repository = self
            .api
            .get_json(&repository_url)
            .await
            .map_err(MetadataUnavailable::new)?;

        let link = |name: &str| {
            repository
                .links
                .clone
                .iter()
                .find(|l| l.name == name)
                .map(|l| l.href.clone())
        };
        let https = link("https").ok_or_else(|| MetadataUnavailable::new("no HTTPS clone link"))?;
        let ssh = link("ssh").ok_or_else(|| MetadataUnavailable::new("no SSH clone link"))?;

        Ok(RepositoryMetadata {
            user: Some(workspace),
            repository: repository.slug,
            branch: repository
                .mainbranch
                .map(|b| b.name)
                .unwrap_or_else(|| "HEAD".to_string()),
            https_clone_url: strip_userinfo(&https),
            ssh_clone_url: ssh,
            languages_source: repository_url,
        })
    }

    async fn fetch_languages(&self, source: &str) -> Result<Vec<Language>, String> {
        // Bitbucket only records one language per repository
        let repository: Repository = self.api.get_json(source).await?;
        if repository.language.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Language::new(repository.language, 100.0)])
    }

    fn scrape_languages(&self, _doc: &Document) -> Vec<Language> {
        Vec::new()
    }

    fn languages_source_for_url(&self, page_url: &str) -> Option<String> {
        let (workspace, slug) = Self::workspace_slug(page_url)?;
        Some(self.repository_url(&workspace, &slug))
    }

    fn clone_mount_selector(&self) -> &'static str {
        "[data-qa=\"page-header-wrapper\"]"
    }

    fn file_mount_selector(&self) -> &'static str {
        "[data-qa=\"bk-file__actions\"]"
    }

    fn file_location(&self, page_url: &str) -> Option<FileLocation> {
        // /{workspace}/{slug}/src/{commit-or-branch}/{path...}
        let segments = path_segments(page_url);
        if segments.len() < 5 || segments[2] != "src" {
            return None;
        }
        Some(FileLocation {
            path: decoded_path(&segments[4..]),
            line: line_from_fragment(page_url),
        })
    }
}
