use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::origin::Origin;
use crate::providers::ProviderKind;

/// Get the config directory using platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/toolbox-extension/`
/// - Linux: `~/.config/toolbox-extension/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/toolbox-extension/`
///
/// Falls back to `~/.toolbox-extension/` if platform dir is unavailable.
pub(crate) fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("toolbox-extension"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".toolbox-extension")
        })
}

/// Load a JSON file from `dir`, returning Default if missing or corrupt.
/// Logs warnings/errors when the file exists but cannot be read or parsed,
/// so corrupt files are visible in logs instead of silently resetting state.
pub(crate) fn load_json_config<T: DeserializeOwned + Default>(dir: &Path, filename: &str) -> T {
    let path = dir.join(filename);
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "config", "Could not read config {}: {e}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(target: "config", "Corrupt config {}: {e}. Using defaults.", path.display());
            T::default()
        }
    }
}

/// Save a JSON file into `dir` atomically (temp file + rename).
/// Sets 0600 permissions on Unix.
pub(crate) fn save_json_config<T: Serialize>(dir: &Path, filename: &str, config: &T) -> Result<(), String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("Failed to create config directory: {e}"))?;

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;

    let target = dir.join(filename);
    let temp = dir.join(format!("{}.tmp.{}", filename, std::process::id()));

    std::fs::write(&temp, &json)
        .map_err(|e| format!("Failed to write temp config: {e}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp, perms)
            .map_err(|e| format!("Failed to set config permissions: {e}"))?;
    }

    // Either the old file or the new one exists, never a partial write
    std::fs::rename(&temp, &target)
        .map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            format!("Failed to commit config: {e}")
        })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// ExtensionConfig
// ---------------------------------------------------------------------------

/// An on-prem installation of a hosting service, e.g. a company GitLab.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelfHostedProvider {
    pub origin: Origin,
    pub kind: ProviderKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Explicit native host manifest; skips the well-known directory search
    #[serde(default)]
    pub native_host_manifest: Option<PathBuf>,
    /// Identity passed to the native host as the caller origin
    #[serde(default = "default_extension_origin")]
    pub extension_origin: String,
    /// Hosting services running on custom domains
    #[serde(default)]
    pub self_hosted: Vec<SelfHostedProvider>,
    /// REST API base overrides keyed by provider (`github`, `gitlab`, ...)
    #[serde(default)]
    pub api_base_overrides: HashMap<ProviderKind, String>,
}

fn default_extension_origin() -> String {
    "chrome-extension://offnedcbhjldheanlbojaefbfbllddna/".to_string()
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            native_host_manifest: None,
            extension_origin: default_extension_origin(),
            self_hosted: Vec::new(),
            api_base_overrides: HashMap::new(),
        }
    }
}

impl ExtensionConfig {
    /// Provider configured for an on-prem origin, if any.
    pub fn self_hosted_kind(&self, origin: &Origin) -> Option<ProviderKind> {
        self.self_hosted
            .iter()
            .find(|p| &p.origin == origin)
            .map(|p| p.kind)
    }

    pub fn api_base(&self, kind: ProviderKind) -> Option<&str> {
        self.api_base_overrides.get(&kind).map(String::as_str)
    }

    /// Record an on-prem installation. An origin already listed is re-kinded.
    pub fn add_self_hosted(&mut self, origin: Origin, kind: ProviderKind) {
        match self.self_hosted.iter_mut().find(|p| p.origin == origin) {
            Some(existing) => existing.kind = kind,
            None => self.self_hosted.push(SelfHostedProvider { origin, kind }),
        }
    }

    /// Override a provider's API base; `None` restores the public endpoint.
    pub fn set_api_base(&mut self, kind: ProviderKind, base: Option<String>) {
        match base {
            Some(base) => {
                self.api_base_overrides
                    .insert(kind, base.trim_end_matches('/').to_string());
            }
            None => {
                self.api_base_overrides.remove(&kind);
            }
        }
    }
}

const EXTENSION_CONFIG_FILE: &str = "config.json";

pub fn load_extension_config() -> ExtensionConfig {
    load_json_config(&config_dir(), EXTENSION_CONFIG_FILE)
}

pub fn save_extension_config(config: &ExtensionConfig) -> Result<(), String> {
    save_json_config(&config_dir(), EXTENSION_CONFIG_FILE, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config: ExtensionConfig = load_json_config(dir.path(), "config.json");
        assert!(config.native_host_manifest.is_none());
        assert!(config.self_hosted.is_empty());
        assert!(config.extension_origin.starts_with("chrome-extension://"));
    }

    #[test]
    fn load_corrupt_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ nope").unwrap();
        let config: ExtensionConfig = load_json_config(dir.path(), "config.json");
        assert!(config.self_hosted.is_empty());
    }

    #[test]
    fn save_then_load_keeps_self_hosted_providers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExtensionConfig::default();
        config.self_hosted.push(SelfHostedProvider {
            origin: Origin::from_url("https://git.corp.example").unwrap(),
            kind: ProviderKind::GitLab,
        });
        config
            .api_base_overrides
            .insert(ProviderKind::GitHub, "http://127.0.0.1:9999".into());
        save_json_config(dir.path(), "config.json", &config).unwrap();

        let loaded: ExtensionConfig = load_json_config(dir.path(), "config.json");
        let origin = Origin::from_url("https://git.corp.example/group/p").unwrap();
        assert_eq!(loaded.self_hosted_kind(&origin), Some(ProviderKind::GitLab));
        assert_eq!(loaded.api_base(ProviderKind::GitHub), Some("http://127.0.0.1:9999"));
        assert_eq!(loaded.api_base(ProviderKind::Gitee), None);
    }

    #[test]
    fn add_self_hosted_replaces_kind_for_known_origin() {
        let mut config = ExtensionConfig::default();
        let origin = Origin::from_url("https://git.corp.example").unwrap();
        config.add_self_hosted(origin.clone(), ProviderKind::GitLab);
        config.add_self_hosted(origin.clone(), ProviderKind::Gitee);
        assert_eq!(config.self_hosted.len(), 1);
        assert_eq!(config.self_hosted_kind(&origin), Some(ProviderKind::Gitee));
    }

    #[test]
    fn set_api_base_overrides_and_clears() {
        let mut config = ExtensionConfig::default();
        config.set_api_base(ProviderKind::GitLab, Some("https://git.corp.example/api/v4/".into()));
        assert_eq!(config.api_base(ProviderKind::GitLab), Some("https://git.corp.example/api/v4"));

        let dir = tempfile::tempdir().unwrap();
        save_json_config(dir.path(), EXTENSION_CONFIG_FILE, &config).unwrap();
        let mut loaded: ExtensionConfig = load_json_config(dir.path(), EXTENSION_CONFIG_FILE);
        assert_eq!(loaded.api_base(ProviderKind::GitLab), Some("https://git.corp.example/api/v4"));

        loaded.set_api_base(ProviderKind::GitLab, None);
        assert_eq!(loaded.api_base(ProviderKind::GitLab), None);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        save_json_config(dir.path(), "state.json", &serde_json::json!({"a": 1})).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        save_json_config(dir.path(), "state.json", &serde_json::json!({})).unwrap();
        let mode = std::fs::metadata(dir.path().join("state.json")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
