//! Per-origin capability grants.
//!
//! A user grant, its content-script registration and its persisted mapping
//! are created together by `request_grant` and destroyed together by
//! `revoke_grant`. Both operations hold the origin's lock for their whole
//! duration, so two tabs toggling the same origin apply their effects one
//! after the other; different origins never wait on each other.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::action_menu::{ActionMenu, MenuState};
use crate::config::ExtensionConfig;
use crate::host::{BrowserHost, PermissionDescriptor};
use crate::logger::Logger;
use crate::origin::{GrantState, Origin};
use crate::providers::provider_script_for;
use crate::registry::ContentScriptRegistry;
use crate::storage::Storage;

const SOURCE: &str = "permissions";

pub struct PermissionController {
    host: Arc<dyn BrowserHost>,
    registry: Arc<ContentScriptRegistry>,
    storage: Arc<Storage>,
    menu: Arc<ActionMenu>,
    config: Arc<ExtensionConfig>,
    logger: Arc<Logger>,
    origin_locks: DashMap<Origin, Arc<Mutex<()>>>,
}

/// Whether a manifest match pattern covers every page of `origin`.
/// Understands `*` schemes (http and https) and `*.` host wildcards.
fn pattern_covers(pattern: &str, origin: &Origin) -> bool {
    if pattern == "<all_urls>" {
        return true;
    }
    let Some((scheme, rest)) = pattern.split_once("://") else {
        return false;
    };
    let Some(host) = rest.strip_suffix("/*") else {
        return false;
    };
    let scheme_ok = scheme == "*" || scheme == origin.scheme();
    let host_ok = match host.strip_prefix("*.") {
        Some(suffix) => origin.host() == suffix || origin.host().ends_with(&format!(".{suffix}")),
        None => host == "*" || host == origin.host(),
    };
    scheme_ok && host_ok
}

impl PermissionController {
    pub fn new(
        host: Arc<dyn BrowserHost>,
        registry: Arc<ContentScriptRegistry>,
        storage: Arc<Storage>,
        menu: Arc<ActionMenu>,
        config: Arc<ExtensionConfig>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            host,
            registry,
            storage,
            menu,
            config,
            logger,
            origin_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, origin: &Origin) -> Arc<Mutex<()>> {
        self.origin_locks
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn is_granted_by_manifest(&self, origin: &Origin) -> bool {
        self.host
            .manifest_origins()
            .iter()
            .any(|pattern| pattern_covers(pattern, origin))
    }

    pub async fn is_granted_by_user(&self, origin: &Origin) -> bool {
        if self.is_granted_by_manifest(origin) {
            return false;
        }
        let permission = PermissionDescriptor::for_pattern(origin.match_pattern());
        match self.host.contains_permission(&permission).await {
            Ok(granted) => granted,
            Err(e) => {
                self.logger.warn(SOURCE, format!("permissions.contains failed for {origin}: {e}"));
                false
            }
        }
    }

    pub async fn grant_state(&self, origin: &Origin) -> GrantState {
        if self.is_granted_by_manifest(origin) {
            GrantState::Manifest
        } else if self.is_granted_by_user(origin).await {
            GrantState::User
        } else {
            GrantState::None
        }
    }

    async fn reload_active_tab(&self) {
        match self.host.active_tab().await {
            Ok(Some(tab)) => {
                if let Err(e) = self.host.reload_tab(tab.id).await {
                    self.logger.warn(SOURCE, format!("Failed to reload tab {}: {e}", tab.id));
                }
            }
            Ok(None) => {}
            Err(e) => self.logger.warn(SOURCE, format!("Failed to query active tab: {e}")),
        }
    }

    /// Ask the user for capability over `origin`. On acceptance the mapping is
    /// persisted and the provider script registered before the active tab is
    /// reloaded. Any failure after consent rolls the grant back.
    pub async fn request_grant(&self, origin: &Origin) -> bool {
        let lock = self.lock_for(origin);
        let _guard = lock.lock().await;

        if self.is_granted_by_manifest(origin) {
            self.menu.render(MenuState::ManifestGranted).await;
            return true;
        }

        let permission = PermissionDescriptor::for_pattern(origin.match_pattern());
        let accepted = match self.host.request_permission(&permission).await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.logger.warn(SOURCE, format!("Permission request for {origin} failed: {e}"));
                false
            }
        };
        if !accepted {
            self.menu.render(MenuState::NotGranted).await;
            return false;
        }

        let script = provider_script_for(origin, &self.config);
        if let Err(e) = self.storage.update(|s| {
            s.provider_scripts.insert(origin.clone(), script.clone());
        }) {
            self.logger.error(SOURCE, format!("Failed to persist mapping for {origin}: {e}"));
            self.roll_back_permission(origin, &permission).await;
            self.menu.render(MenuState::NotGranted).await;
            return false;
        }

        if let Err(e) = self.registry.register(origin, &script).await {
            self.logger.error(SOURCE, e);
            if let Err(e) = self.storage.update(|s| {
                s.provider_scripts.remove(origin);
            }) {
                self.logger.error(SOURCE, format!("Failed to drop mapping for {origin}: {e}"));
            }
            self.roll_back_permission(origin, &permission).await;
            self.menu.render(MenuState::NotGranted).await;
            return false;
        }

        self.logger.info(SOURCE, format!("Granted {origin} ({script})"));
        self.reload_active_tab().await;
        self.menu.render(MenuState::UserGranted).await;
        true
    }

    async fn roll_back_permission(&self, origin: &Origin, permission: &PermissionDescriptor) {
        match self.host.remove_permission(permission).await {
            Ok(_) => self.logger.warn(SOURCE, format!("Rolled back grant for {origin}")),
            Err(e) => self
                .logger
                .error(SOURCE, format!("Rollback of grant for {origin} failed: {e}")),
        }
    }

    /// Drop the user's grant for `origin` along with its registration and
    /// mapping. Manifest grants cannot be revoked.
    pub async fn revoke_grant(&self, origin: &Origin) -> bool {
        let lock = self.lock_for(origin);
        let _guard = lock.lock().await;

        if self.is_granted_by_manifest(origin) {
            self.logger.warn(SOURCE, format!("{origin} is granted by the manifest; not revoking"));
            self.menu.render(MenuState::ManifestGranted).await;
            return false;
        }

        let permission = PermissionDescriptor::for_pattern(origin.match_pattern());
        let removed = match self.host.remove_permission(&permission).await {
            Ok(removed) => removed,
            Err(e) => {
                self.logger.warn(SOURCE, format!("Permission removal for {origin} failed: {e}"));
                false
            }
        };
        if !removed {
            self.menu.render(MenuState::UserGranted).await;
            return false;
        }

        if !self.unregister_with_retry(origin).await {
            // Mapping stays so startup cleanup drops the orphaned script
            let state = self.grant_state(origin).await;
            self.menu.render(MenuState::from(state)).await;
            return false;
        }
        if let Err(e) = self.storage.update(|s| {
            s.provider_scripts.remove(origin);
        }) {
            self.logger.error(SOURCE, format!("Failed to drop mapping for {origin}: {e}"));
        }

        self.logger.info(SOURCE, format!("Revoked {origin}"));
        self.reload_active_tab().await;
        self.menu.render(MenuState::NotGranted).await;
        true
    }

    async fn unregister_with_retry(&self, origin: &Origin) -> bool {
        if let Err(e) = self.registry.unregister(origin).await {
            self.logger.warn(SOURCE, format!("{e}; retrying"));
            if let Err(e) = self.registry.unregister(origin).await {
                self.logger.error(SOURCE, e);
                return false;
            }
        }
        true
    }

    /// Startup: re-register scripts for persisted mappings. Mappings whose
    /// permission was revoked outside the extension are dropped instead.
    pub async fn restore_registrations(&self) {
        let mappings = self.storage.provider_scripts();
        let mut live = mappings.clone();

        for origin in mappings.keys() {
            let lock = self.lock_for(origin);
            let _guard = lock.lock().await;
            if !self.is_granted_by_user(origin).await {
                self.logger
                    .info(SOURCE, format!("Permission for {origin} was revoked; dropping mapping"));
                live.remove(origin);
                if let Err(e) = self.storage.update(|s| {
                    s.provider_scripts.remove(origin);
                }) {
                    self.logger.error(SOURCE, format!("Failed to drop mapping for {origin}: {e}"));
                }
                if let Err(e) = self.registry.unregister(origin).await {
                    self.logger.warn(SOURCE, e);
                }
            }
        }

        for (origin, e) in self.registry.restore(&live).await {
            self.logger.error(SOURCE, format!("Could not restore {origin}: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_menu::{MENU_ID, MenuClick, MenuProps, ToggleHandler};
    use futures_util::future::BoxFuture;
    use crate::host::memory::{HostCall, MemoryHost};
    use crate::storage::MemoryStore;

    struct Fixture {
        host: Arc<MemoryHost>,
        store: Arc<MemoryStore>,
        storage: Arc<Storage>,
        registry: Arc<ContentScriptRegistry>,
        controller: Arc<PermissionController>,
    }

    async fn fixture() -> Fixture {
        let host = Arc::new(MemoryHost::new(&["https://github.com/*", "https://*.gitlab.com/*"]));
        host.open_tab(1, "https://git.corp.example/group/project");
        host.activate(1);
        let store = Arc::new(MemoryStore::default());
        let storage = Arc::new(Storage::open(store.clone()).unwrap());
        let registry = Arc::new(ContentScriptRegistry::new(host.clone()));
        let menu = Arc::new(ActionMenu::new(host.clone()));
        let noop: ToggleHandler = Arc::new(|_click: MenuClick| -> BoxFuture<'static, ()> { Box::pin(async {}) });
        menu.create(noop).await.unwrap();
        let controller = Arc::new(PermissionController::new(
            host.clone(),
            registry.clone(),
            storage.clone(),
            menu,
            Arc::new(ExtensionConfig::default()),
            Arc::new(Logger::default()),
        ));
        Fixture {
            host,
            store,
            storage,
            registry,
            controller,
        }
    }

    fn origin(url: &str) -> Origin {
        Origin::from_url(url).unwrap()
    }

    fn menu_props(f: &Fixture) -> MenuProps {
        f.host.menu(MENU_ID).unwrap()
    }

    #[test]
    fn manifest_pattern_matching() {
        let o = origin("https://gitlab.com/a");
        assert!(pattern_covers("https://*.gitlab.com/*", &o));
        assert!(pattern_covers("*://gitlab.com/*", &o));
        assert!(!pattern_covers("http://gitlab.com/*", &o));
        assert!(!pattern_covers("https://gitlab.com/", &o));
        assert!(pattern_covers("https://*.gitlab.com/*", &origin("https://salsa.gitlab.com")));
        assert!(!pattern_covers("https://*.gitlab.com/*", &origin("https://evilgitlab.com")));
    }

    #[tokio::test]
    async fn grant_states() {
        let f = fixture().await;
        assert_eq!(f.controller.grant_state(&origin("https://github.com/x")).await, GrantState::Manifest);
        assert_eq!(f.controller.grant_state(&origin("https://git.corp.example")).await, GrantState::None);
        f.host.grant("https://git.corp.example/*");
        assert_eq!(f.controller.grant_state(&origin("https://git.corp.example")).await, GrantState::User);
    }

    #[tokio::test]
    async fn accepted_grant_creates_registration_and_mapping_then_reloads() {
        let f = fixture().await;
        let o = origin("https://git.corp.example");
        assert!(f.controller.request_grant(&o).await);

        assert_eq!(f.registry.registrations().len(), 1);
        assert_eq!(f.host.scripts().len(), 1);
        assert_eq!(f.storage.provider_scripts().len(), 1);
        assert!(f.store.stored().provider_scripts.contains_key(&o));
        assert_eq!(menu_props(&f), MenuProps { enabled: true, checked: true });

        let calls = f.host.calls();
        let register = calls
            .iter()
            .position(|c| matches!(c, HostCall::RegisterScript(_)))
            .unwrap();
        let reload = calls.iter().position(|c| *c == HostCall::ReloadTab(1)).unwrap();
        assert!(register < reload);
    }

    #[tokio::test]
    async fn denied_grant_has_no_side_effects() {
        let f = fixture().await;
        f.host.accept_prompts(false);
        f.host.clear_calls();
        let o = origin("https://git.corp.example");
        assert!(!f.controller.request_grant(&o).await);

        assert!(f.host.scripts().is_empty());
        assert!(f.storage.provider_scripts().is_empty());
        assert!(!f.host.calls().contains(&HostCall::ReloadTab(1)));
        assert_eq!(menu_props(&f), MenuProps { enabled: true, checked: false });
    }

    #[tokio::test]
    async fn registration_failure_rolls_back() {
        let f = fixture().await;
        f.host.fail_register(true);
        let o = origin("https://git.corp.example");
        assert!(!f.controller.request_grant(&o).await);

        assert!(f.host.granted_patterns().is_empty());
        assert!(f.storage.provider_scripts().is_empty());
        assert!(f.registry.registration(&o).is_none());
        assert_eq!(menu_props(&f), MenuProps { enabled: true, checked: false });
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_permission() {
        let f = fixture().await;
        f.store.fail_saves(true);
        let o = origin("https://git.corp.example");
        assert!(!f.controller.request_grant(&o).await);
        assert!(f.host.granted_patterns().is_empty());
        assert!(f.host.scripts().is_empty());
    }

    #[tokio::test]
    async fn revoke_removes_only_that_origin() {
        let f = fixture().await;
        let a = origin("https://a.example");
        let b = origin("https://b.example");
        assert!(f.controller.request_grant(&a).await);
        assert!(f.controller.request_grant(&b).await);

        assert!(f.controller.revoke_grant(&a).await);
        let scripts = f.host.scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].id, "https://b.example/*");
        assert!(f.storage.provider_script(&a).is_none());
        assert!(f.storage.provider_script(&b).is_some());
        assert_eq!(menu_props(&f), MenuProps { enabled: true, checked: false });
    }

    #[tokio::test]
    async fn failed_revoke_reverts_menu_to_checked() {
        let f = fixture().await;
        let o = origin("https://git.corp.example");
        assert!(f.controller.request_grant(&o).await);
        f.host.fail_remove(true);

        assert!(!f.controller.revoke_grant(&o).await);
        assert_eq!(f.host.scripts().len(), 1);
        assert!(f.storage.provider_script(&o).is_some());
        assert_eq!(menu_props(&f), MenuProps { enabled: true, checked: true });
    }

    #[tokio::test]
    async fn failed_unregister_reports_revoke_failure() {
        let f = fixture().await;
        let o = origin("https://git.corp.example");
        assert!(f.controller.request_grant(&o).await);
        f.host.fail_unregister(true);
        f.host.clear_calls();

        assert!(!f.controller.revoke_grant(&o).await);
        let unregisters = f
            .host
            .calls()
            .into_iter()
            .filter(|c| matches!(c, HostCall::UnregisterScript(_)))
            .count();
        assert_eq!(unregisters, 2);
        assert!(!f.host.calls().contains(&HostCall::ReloadTab(1)));
        // Permission is gone, so the menu shows the real state
        assert_eq!(menu_props(&f), MenuProps { enabled: true, checked: false });
        assert!(f.storage.provider_script(&o).is_some());
        assert!(f.registry.registration(&o).is_some());

        // Next startup removes the orphaned script and its mapping
        f.host.fail_unregister(false);
        f.controller.restore_registrations().await;
        assert!(f.host.scripts().is_empty());
        assert!(f.storage.provider_script(&o).is_none());
        assert!(f.registry.registration(&o).is_none());
    }

    #[tokio::test]
    async fn manifest_origin_cannot_be_revoked() {
        let f = fixture().await;
        f.host.clear_calls();
        assert!(!f.controller.revoke_grant(&origin("https://github.com")).await);
        assert!(!f
            .host
            .calls()
            .iter()
            .any(|c| matches!(c, HostCall::RemovePermission(_))));
        assert_eq!(menu_props(&f), MenuProps { enabled: false, checked: true });
    }

    #[tokio::test]
    async fn self_hosted_heuristic_picks_provider_script() {
        let f = fixture().await;
        let o = origin("https://gitlab.corp.example");
        assert!(f.controller.request_grant(&o).await);
        assert_eq!(f.storage.provider_script(&o).as_deref(), Some("content/gitlab.js"));
    }

    #[tokio::test]
    async fn concurrent_toggles_on_same_origin_are_serialized() {
        let f = fixture().await;
        f.host.set_prompt_delay(std::time::Duration::from_millis(20));
        let o = origin("https://git.corp.example");

        let grant = {
            let controller = f.controller.clone();
            let o = o.clone();
            tokio::spawn(async move { controller.request_grant(&o).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let revoke = {
            let controller = f.controller.clone();
            let o = o.clone();
            tokio::spawn(async move { controller.revoke_grant(&o).await })
        };

        assert!(grant.await.unwrap());
        assert!(revoke.await.unwrap());
        // Revoke ran strictly after the grant completed
        assert!(f.host.scripts().is_empty());
        assert!(f.storage.provider_scripts().is_empty());
        assert!(f.host.granted_patterns().is_empty());
    }

    #[tokio::test]
    async fn restore_drops_mappings_revoked_out_of_band() {
        let f = fixture().await;
        let kept = origin("https://kept.example");
        let revoked = origin("https://revoked.example");
        assert!(f.controller.request_grant(&kept).await);
        assert!(f.controller.request_grant(&revoked).await);

        // Browser restart: dynamic scripts gone, one permission revoked in settings
        f.host.drop_scripts();
        f.host.revoke("https://revoked.example/*");
        f.controller.restore_registrations().await;

        let scripts = f.host.scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].id, "https://kept.example/*");
        assert!(f.storage.provider_script(&revoked).is_none());
        assert!(f.storage.provider_script(&kept).is_some());
    }
}
