//! REST access to hosting-service APIs.

use serde::de::DeserializeOwned;

const USER_AGENT: &str = concat!("toolbox-extension/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

/// First non-empty value among `vars`, read from the environment.
pub(crate) fn token_from_env(vars: &[&str]) -> Option<String> {
    vars.iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|token| token.trim().to_string())
        .find(|token| !token.is_empty())
}

impl RestClient {
    pub fn new(base: &str) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Absolute URL for an API path (`/repos/a/b`).
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// GET an absolute URL and decode its JSON body. Non-2xx is an error.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, String> {
        let mut request = self.http.get(url).header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| format!("Request to {url} failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("{url} returned HTTP {status}"));
        }

        response
            .json()
            .await
            .map_err(|e| format!("Failed to parse response from {url}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn url_joins_without_double_slashes() {
        let client = RestClient::new("https://api.github.com/").unwrap();
        assert_eq!(client.url("/repos/a/b"), "https://api.github.com/repos/a/b");
        assert_eq!(client.url("repos/a/b"), "https://api.github.com/repos/a/b");
    }

    #[tokio::test]
    async fn get_json_decodes_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/a/b/languages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"Rust": 1000, "Shell": 10}"#)
            .create_async()
            .await;

        let client = RestClient::new(&server.url()).unwrap();
        let langs: HashMap<String, f64> = client
            .get_json(&client.url("/repos/a/b/languages"))
            .await
            .unwrap();
        assert_eq!(langs["Rust"], 1000.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_is_sent_as_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/user")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let client = RestClient::new(&server.url())
            .unwrap()
            .with_token(Some("secret".into()));
        client
            .get_json::<serde_json::Value>(&client.url("/user"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    #[serial_test::serial]
    fn token_from_env_skips_empty_values() {
        // SAFETY: serialized with the other env-mutating tests
        unsafe {
            std::env::set_var("TOOLBOX_TEST_TOKEN_A", "  ");
            std::env::set_var("TOOLBOX_TEST_TOKEN_B", "abc");
        }
        assert_eq!(
            token_from_env(&["TOOLBOX_TEST_TOKEN_A", "TOOLBOX_TEST_TOKEN_B"]),
            Some("abc".to_string())
        );
        assert_eq!(token_from_env(&["TOOLBOX_TEST_TOKEN_MISSING"]), None);
        unsafe {
            std::env::remove_var("TOOLBOX_TEST_TOKEN_A");
            std::env::remove_var("TOOLBOX_TEST_TOKEN_B");
        }
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/private")
            .with_status(404)
            .create_async()
            .await;
        let client = RestClient::new(&server.url()).unwrap();
        let err = client
            .get_json::<serde_json::Value>(&client.url("/private"))
            .await
            .unwrap_err();
        assert!(err.contains("404"), "{err}");
    }
}
