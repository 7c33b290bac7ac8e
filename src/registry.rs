//! Dynamic content-script registrations, one per granted origin.
//!
//! The registration id is the origin's match pattern, so re-registering an
//! origin replaces its script instead of adding a second one, and removal
//! never needs a lookup table. The browser's own registration list is the
//! source of truth; the local map only mirrors what this context registered.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::host::{BrowserHost, ContentScriptDescriptor};
use crate::origin::Origin;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentScriptRegistration {
    pub origin_match_pattern: String,
    pub script_id: String,
    pub provider_script_ref: String,
}

impl ContentScriptRegistration {
    pub fn new(origin: &Origin, provider_script_ref: &str) -> Self {
        let pattern = origin.match_pattern();
        Self {
            origin_match_pattern: pattern.clone(),
            script_id: pattern,
            provider_script_ref: provider_script_ref.to_string(),
        }
    }

    fn descriptor(&self) -> ContentScriptDescriptor {
        ContentScriptDescriptor {
            id: self.script_id.clone(),
            matches: vec![self.origin_match_pattern.clone()],
            js: vec![self.provider_script_ref.clone()],
        }
    }
}

pub struct ContentScriptRegistry {
    host: Arc<dyn BrowserHost>,
    registrations: DashMap<Origin, ContentScriptRegistration>,
}

impl ContentScriptRegistry {
    pub fn new(host: Arc<dyn BrowserHost>) -> Self {
        Self {
            host,
            registrations: DashMap::new(),
        }
    }

    async fn registered_in_browser(&self, script_id: &str) -> Result<Option<ContentScriptDescriptor>, String> {
        let scripts = self
            .host
            .registered_content_scripts()
            .await
            .map_err(|e| format!("Failed to list content scripts: {e}"))?;
        Ok(scripts.into_iter().find(|s| s.id == script_id))
    }

    /// Register `provider_script_ref` for `origin`. Registering the same script
    /// again is a no-op; a different script replaces the existing one.
    pub async fn register(&self, origin: &Origin, provider_script_ref: &str) -> Result<(), String> {
        let registration = ContentScriptRegistration::new(origin, provider_script_ref);
        let descriptor = registration.descriptor();

        match self.registered_in_browser(&registration.script_id).await? {
            Some(existing) if existing == descriptor => {
                self.registrations.insert(origin.clone(), registration);
                return Ok(());
            }
            Some(_) => {
                self.host
                    .unregister_content_scripts(std::slice::from_ref(&registration.script_id))
                    .await
                    .map_err(|e| format!("Failed to replace content script for {origin}: {e}"))?;
            }
            None => {}
        }

        self.host
            .register_content_scripts(std::slice::from_ref(&descriptor))
            .await
            .map_err(|e| format!("Failed to register content script for {origin}: {e}"))?;

        tracing::info!(target: "registry", "Registered {} for {origin}", registration.provider_script_ref);
        self.registrations.insert(origin.clone(), registration);
        Ok(())
    }

    /// Remove the origin's registration. Returns whether one existed.
    pub async fn unregister(&self, origin: &Origin) -> Result<bool, String> {
        let script_id = origin.match_pattern();
        if self.registered_in_browser(&script_id).await?.is_none() {
            self.registrations.remove(origin);
            return Ok(false);
        }
        // The local entry goes only once the browser has dropped the script
        self.host
            .unregister_content_scripts(std::slice::from_ref(&script_id))
            .await
            .map_err(|e| format!("Failed to unregister content script for {origin}: {e}"))?;
        self.registrations.remove(origin);

        tracing::info!(target: "registry", "Unregistered content script for {origin}");
        Ok(true)
    }

    /// Re-establish registrations from persisted mappings after the browser
    /// dropped them. Returns the origins that failed, with their errors.
    pub async fn restore(&self, mappings: &BTreeMap<Origin, String>) -> Vec<(Origin, String)> {
        let mut failures = Vec::new();
        for (origin, script) in mappings {
            if let Err(e) = self.register(origin, script).await {
                tracing::warn!(target: "registry", "{e}");
                failures.push((origin.clone(), e));
            }
        }
        failures
    }

    pub fn registration(&self, origin: &Origin) -> Option<ContentScriptRegistration> {
        self.registrations.get(origin).map(|r| r.value().clone())
    }

    pub fn registrations(&self) -> Vec<ContentScriptRegistration> {
        let mut all: Vec<_> = self.registrations.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.script_id.cmp(&b.script_id));
        all
    }
}
