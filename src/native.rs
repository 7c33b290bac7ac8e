//! Native channel to the companion application.
//!
//! Each call is a single request/response exchange with a freshly spawned
//! native host. Anything that prevents a well-formed response from arriving
//! is a communication error; a response with `status: "error"` is an
//! application error carrying the companion's payload.

use async_trait::async_trait;
use native_messaging::{HostManifest, find_host_manifest, load_host_manifest, manifest_dirs};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Native-messaging name of the companion application.
pub const COMPANION_HOST: &str = "com.jetbrains.toolbox";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NativeMethod {
    GetCapabilities,
    GetInstalledTools,
    Version,
    Tools,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeRequest {
    pub method: NativeMethod,
    pub arguments: Value,
    /// Correlation token; the channel is single-shot so nothing demultiplexes on it
    pub id: String,
}

impl NativeRequest {
    pub fn new(method: NativeMethod, arguments: Value) -> Self {
        Self {
            method,
            arguments,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum NativeResponse {
    Ok {
        #[serde(default)]
        result: Value,
    },
    Error {
        #[serde(default)]
        error: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeError {
    /// Companion unreachable, not installed, or it answered garbage
    Communication(String),
    /// Companion answered with `status: "error"`
    Application(Value),
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeError::Communication(msg) => write!(f, "Cannot reach companion application: {msg}"),
            NativeError::Application(err) => write!(f, "Companion application error: {err}"),
        }
    }
}

impl std::error::Error for NativeError {}

#[async_trait]
pub trait NativeTransport: Send + Sync {
    async fn round_trip(&self, request: &NativeRequest) -> Result<NativeResponse, NativeError>;
}

/// Spawns the companion's native host over stdio.
pub struct StdioTransport {
    manifest_path: Option<PathBuf>,
    search_dirs: Vec<PathBuf>,
    caller_origin: String,
}

impl StdioTransport {
    /// `manifest_path` pins the host manifest; otherwise the per-browser
    /// well-known directories are searched on every call.
    pub fn new(manifest_path: Option<PathBuf>, caller_origin: impl Into<String>) -> Self {
        Self {
            manifest_path,
            search_dirs: manifest_dirs(),
            caller_origin: caller_origin.into(),
        }
    }

    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    fn resolve_manifest(&self) -> Result<HostManifest, NativeError> {
        let manifest = match &self.manifest_path {
            Some(path) => load_host_manifest(path).map_err(NativeError::Communication)?,
            None => find_host_manifest(COMPANION_HOST, &self.search_dirs).ok_or_else(|| {
                NativeError::Communication(format!("No native host manifest for {COMPANION_HOST}"))
            })?,
        };
        if !manifest.allows(&self.caller_origin) {
            return Err(NativeError::Communication(format!(
                "Native host {} does not allow {}",
                manifest.name, self.caller_origin
            )));
        }
        Ok(manifest)
    }
}

#[async_trait]
impl NativeTransport for StdioTransport {
    async fn round_trip(&self, request: &NativeRequest) -> Result<NativeResponse, NativeError> {
        let manifest = self.resolve_manifest()?;
        native_messaging::exchange(&manifest, &self.caller_origin, request)
            .await
            .map_err(|e| NativeError::Communication(e.to_string()))
    }
}

pub struct NativeClient {
    transport: Arc<dyn NativeTransport>,
}

impl NativeClient {
    pub fn new(transport: Arc<dyn NativeTransport>) -> Self {
        Self { transport }
    }

    pub async fn call(&self, method: NativeMethod, arguments: Value) -> Result<Value, NativeError> {
        let request = NativeRequest::new(method, arguments);
        tracing::debug!(target: "native", "-> {:?} ({})", request.method, request.id);
        match self.transport.round_trip(&request).await? {
            NativeResponse::Ok { result } => Ok(result),
            NativeResponse::Error { error } => Err(NativeError::Application(error)),
        }
    }

    pub async fn get_capabilities(&self) -> Result<Value, NativeError> {
        self.call(NativeMethod::GetCapabilities, json!({})).await
    }

    pub async fn get_installed_tools(&self) -> Result<Value, NativeError> {
        self.call(NativeMethod::GetInstalledTools, json!({})).await
    }

    pub async fn version(&self) -> Result<Value, NativeError> {
        self.call(NativeMethod::Version, json!({})).await
    }

    /// Ask the companion to open `url` with the tool tagged `tool_tag`.
    pub async fn open_in_tool(&self, tool_tag: &str, url: &str) -> Result<Value, NativeError> {
        self.call(NativeMethod::Tools, json!({ "tool": tool_tag, "url": url }))
            .await
    }

    /// Installation state of the companion application.
    pub async fn probe(&self) -> ApplicationState {
        match self.get_capabilities().await {
            Ok(_) => ApplicationState::Installed,
            Err(NativeError::Application(error)) => ApplicationState::InstalledError(error),
            Err(NativeError::Communication(msg)) => {
                tracing::debug!(target: "native", "Companion probe failed: {msg}");
                ApplicationState::NotInstalled
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    NotInstalled,
    Installed,
    InstalledError(Value),
}

impl ApplicationState {
    pub fn label(&self) -> &'static str {
        match self {
            ApplicationState::NotInstalled => "NOT_INSTALLED",
            ApplicationState::Installed => "INSTALLED",
            ApplicationState::InstalledError(_) => "INSTALLED_ERROR",
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// Transport that answers every request with a canned result.
    pub struct FakeTransport {
        answer: Mutex<Result<NativeResponse, NativeError>>,
        requests: Mutex<Vec<NativeRequest>>,
    }

    impl FakeTransport {
        pub fn ok(result: Value) -> Self {
            Self::answering(Ok(NativeResponse::Ok { result }))
        }

        pub fn app_error(error: Value) -> Self {
            Self::answering(Ok(NativeResponse::Error { error }))
        }

        pub fn unreachable() -> Self {
            Self::answering(Err(NativeError::Communication("host not found".into())))
        }

        fn answering(answer: Result<NativeResponse, NativeError>) -> Self {
            Self {
                answer: Mutex::new(answer),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<NativeRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl NativeTransport for FakeTransport {
        async fn round_trip(&self, request: &NativeRequest) -> Result<NativeResponse, NativeError> {
            self.requests.lock().push(request.clone());
            self.answer.lock().clone()
        }
    }
}
