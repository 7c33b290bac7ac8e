//! Native-messaging host manifests.
//!
//! Browsers locate a native host through a JSON manifest named `<host>.json`
//! placed in a browser-specific directory. Those directories are not on any
//! search path the extension controls, so we probe the well-known locations
//! for the common browsers, user directories first.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Host manifest as written by the companion application's installer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Host executable. Relative paths are resolved against the manifest's directory.
    pub path: PathBuf,
    /// Transport type; browsers only support `stdio`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Chromium-family allow list (`chrome-extension://<id>/`)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Firefox allow list (extension ids)
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
}

impl HostManifest {
    /// Whether a caller identified by `origin` (or Firefox extension id) may use this host.
    /// An empty allow list on both sides is treated as unrestricted.
    pub fn allows(&self, origin: &str) -> bool {
        if self.allowed_origins.is_empty() && self.allowed_extensions.is_empty() {
            return true;
        }
        self.allowed_origins.iter().any(|o| o == origin)
            || self.allowed_extensions.iter().any(|e| e == origin)
    }
}

/// Host names are dot-separated segments of lowercase alphanumerics and `_`.
pub fn is_valid_host_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

/// Directories that may hold native-messaging host manifests, in lookup order.
pub fn manifest_dirs() -> Vec<PathBuf> {
    #[allow(unused_mut)]
    let mut found = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if let Some(config) = dirs::config_dir() {
            for browser in [
                "google-chrome",
                "google-chrome-beta",
                "chromium",
                "microsoft-edge",
                "BraveSoftware/Brave-Browser",
                "vivaldi",
            ] {
                found.push(config.join(browser).join("NativeMessagingHosts"));
            }
        }
        if let Some(home) = dirs::home_dir() {
            found.push(home.join(".mozilla").join("native-messaging-hosts"));
        }
        found.extend([
            PathBuf::from("/etc/opt/chrome/native-messaging-hosts"),
            PathBuf::from("/etc/chromium/native-messaging-hosts"),
            PathBuf::from("/usr/lib/mozilla/native-messaging-hosts"),
            PathBuf::from("/usr/lib64/mozilla/native-messaging-hosts"),
        ]);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            let support = home.join("Library").join("Application Support");
            for browser in [
                "Google/Chrome",
                "Google/Chrome Beta",
                "Chromium",
                "Microsoft Edge",
                "BraveSoftware/Brave-Browser",
                "Vivaldi",
            ] {
                found.push(support.join(browser).join("NativeMessagingHosts"));
            }
            found.push(support.join("Mozilla").join("NativeMessagingHosts"));
        }
        found.extend([
            PathBuf::from("/Library/Google/Chrome/NativeMessagingHosts"),
            PathBuf::from("/Library/Application Support/Chromium/NativeMessagingHosts"),
            PathBuf::from("/Library/Application Support/Mozilla/NativeMessagingHosts"),
        ]);
    }

    // Windows registers manifests in the registry; callers pass an explicit path there.

    found
}

/// Read and validate a manifest file, resolving a relative host path.
pub fn load_host_manifest(path: &Path) -> Result<HostManifest, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read host manifest {}: {e}", path.display()))?;
    let mut manifest: HostManifest = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid host manifest {}: {e}", path.display()))?;

    if !is_valid_host_name(&manifest.name) {
        return Err(format!("Invalid host name \"{}\"", manifest.name));
    }
    if manifest.kind != "stdio" {
        return Err(format!("Unsupported host type \"{}\"", manifest.kind));
    }
    if manifest.path.is_relative()
        && let Some(dir) = path.parent()
    {
        manifest.path = dir.join(&manifest.path);
    }
    Ok(manifest)
}

/// Look up `<name>.json` in `dirs`, returning the first manifest that loads.
/// Unreadable or invalid candidates are skipped.
pub fn find_host_manifest(name: &str, dirs: &[PathBuf]) -> Option<HostManifest> {
    if !is_valid_host_name(name) {
        return None;
    }
    let filename = format!("{name}.json");
    dirs.iter()
        .map(|dir| dir.join(&filename))
        .filter(|candidate| candidate.is_file())
        .find_map(|candidate| load_host_manifest(&candidate).ok())
        .filter(|manifest| manifest.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("{name}.json"));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn host_name_validation() {
        assert!(is_valid_host_name("com.jetbrains.toolbox"));
        assert!(is_valid_host_name("my_host"));
        assert!(!is_valid_host_name(""));
        assert!(!is_valid_host_name("Com.Example"));
        assert!(!is_valid_host_name("com..example"));
        assert!(!is_valid_host_name("com.example-host"));
    }

    #[test]
    fn load_resolves_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "com.example.host",
            r#"{"name":"com.example.host","path":"bin/host","type":"stdio","allowed_origins":["chrome-extension://abc/"]}"#,
        );
        let manifest = load_host_manifest(&path).unwrap();
        assert_eq!(manifest.path, dir.path().join("bin/host"));
        assert!(manifest.allows("chrome-extension://abc/"));
        assert!(!manifest.allows("chrome-extension://evil/"));
    }

    #[test]
    fn load_rejects_non_stdio() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            "com.example.host",
            r#"{"name":"com.example.host","path":"/bin/host","type":"socket"}"#,
        );
        assert!(load_host_manifest(&path).unwrap_err().contains("Unsupported host type"));
    }

    #[test]
    fn find_skips_missing_and_invalid_dirs() {
        let empty = tempfile::tempdir().unwrap();
        let broken = tempfile::tempdir().unwrap();
        let good = tempfile::tempdir().unwrap();
        write_manifest(broken.path(), "com.example.host", "{ not json");
        write_manifest(
            good.path(),
            "com.example.host",
            r#"{"name":"com.example.host","path":"/opt/host","type":"stdio"}"#,
        );

        let dirs = vec![
            empty.path().to_path_buf(),
            broken.path().to_path_buf(),
            good.path().to_path_buf(),
        ];
        let manifest = find_host_manifest("com.example.host", &dirs).unwrap();
        assert_eq!(manifest.path, PathBuf::from("/opt/host"));
        assert!(manifest.allows("anything"));
    }

    #[test]
    fn find_rejects_name_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "com.example.host",
            r#"{"name":"com.example.other","path":"/opt/host","type":"stdio"}"#,
        );
        assert!(find_host_manifest("com.example.host", &[dir.path().to_path_buf()]).is_none());
    }
}
