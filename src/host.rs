//! Seam between the extension core and the browser it runs in.
//!
//! Everything the background controller asks of the browser (permission
//! prompts, dynamic content-script registration, tabs, the context menu and
//! the page action) goes through `BrowserHost`. A real browser bridge
//! implements it in the embedding; `memory::MemoryHost` backs the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::action_menu::MenuProps;
use crate::messaging::Message;

pub type TabId = i64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub url: String,
}

/// `{origins: [pattern]}` as passed to the permissions API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDescriptor {
    pub origins: Vec<String>,
}

impl PermissionDescriptor {
    pub fn for_pattern(pattern: impl Into<String>) -> Self {
        Self {
            origins: vec![pattern.into()],
        }
    }
}

/// `{id, matches, js}` as passed to the scripting API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScriptDescriptor {
    pub id: String,
    pub matches: Vec<String>,
    pub js: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub title: String,
    pub contexts: Vec<String>,
    pub props: MenuProps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The browser API rejected the call
    Rejected(String),
    /// The tab is gone or never existed
    NoSuchTab(TabId),
    /// The receiving end has no listener (no content script in the tab)
    NoReceiver(TabId),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Rejected(msg) => write!(f, "Browser rejected the call: {msg}"),
            HostError::NoSuchTab(id) => write!(f, "No tab with id {id}"),
            HostError::NoReceiver(id) => write!(f, "No message receiver in tab {id}"),
        }
    }
}

impl std::error::Error for HostError {}

#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// Match patterns declared in the extension manifest (install-time grants).
    fn manifest_origins(&self) -> Vec<String>;

    /// Prompt the user. `Ok(false)` means the user declined.
    async fn request_permission(&self, permission: &PermissionDescriptor) -> Result<bool, HostError>;
    async fn remove_permission(&self, permission: &PermissionDescriptor) -> Result<bool, HostError>;
    async fn contains_permission(&self, permission: &PermissionDescriptor) -> Result<bool, HostError>;

    async fn register_content_scripts(&self, scripts: &[ContentScriptDescriptor]) -> Result<(), HostError>;
    async fn unregister_content_scripts(&self, ids: &[String]) -> Result<(), HostError>;
    async fn registered_content_scripts(&self) -> Result<Vec<ContentScriptDescriptor>, HostError>;

    async fn active_tab(&self) -> Result<Option<Tab>, HostError>;
    async fn get_tab(&self, id: TabId) -> Result<Tab, HostError>;
    async fn query_tabs(&self) -> Result<Vec<Tab>, HostError>;
    async fn reload_tab(&self, id: TabId) -> Result<(), HostError>;
    async fn create_tab(&self, url: &str) -> Result<(), HostError>;
    async fn send_to_tab(&self, id: TabId, message: &Message) -> Result<(), HostError>;

    async fn create_menu(&self, item: &MenuItem) -> Result<(), HostError>;
    async fn update_menu(&self, id: &str, props: MenuProps) -> Result<(), HostError>;

    async fn set_page_action(&self, tab: TabId, enabled: bool) -> Result<(), HostError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Every side-effecting call the in-memory browser received, in order.
    #[derive(Clone, Debug, PartialEq)]
    pub enum HostCall {
        RequestPermission(String),
        RemovePermission(String),
        RegisterScript(String),
        UnregisterScript(String),
        ReloadTab(TabId),
        CreateTab(String),
        SendToTab(TabId, Message),
        CreateMenu(String),
        UpdateMenu(String, MenuProps),
        SetPageAction(TabId, bool),
    }

    /// Browser double. Permission prompts are answered by `accept_prompts`;
    /// failures can be switched on per API.
    pub struct MemoryHost {
        manifest: Vec<String>,
        granted: Mutex<BTreeSet<String>>,
        scripts: Mutex<BTreeMap<String, ContentScriptDescriptor>>,
        tabs: Mutex<BTreeMap<TabId, Tab>>,
        active: Mutex<Option<TabId>>,
        menus: Mutex<BTreeMap<String, MenuProps>>,
        page_actions: Mutex<HashMap<TabId, bool>>,
        calls: Mutex<Vec<HostCall>>,
        accept_prompts: AtomicBool,
        fail_register: AtomicBool,
        fail_unregister: AtomicBool,
        fail_remove: AtomicBool,
        prompt_delay: Mutex<Option<Duration>>,
        menu_delay: Mutex<Option<Duration>>,
    }

    impl MemoryHost {
        pub fn new(manifest_origins: &[&str]) -> Self {
            Self {
                manifest: manifest_origins.iter().map(|s| s.to_string()).collect(),
                granted: Mutex::new(BTreeSet::new()),
                scripts: Mutex::new(BTreeMap::new()),
                tabs: Mutex::new(BTreeMap::new()),
                active: Mutex::new(None),
                menus: Mutex::new(BTreeMap::new()),
                page_actions: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                accept_prompts: AtomicBool::new(true),
                fail_register: AtomicBool::new(false),
                fail_unregister: AtomicBool::new(false),
                fail_remove: AtomicBool::new(false),
                prompt_delay: Mutex::new(None),
                menu_delay: Mutex::new(None),
            }
        }

        pub fn accept_prompts(&self, accept: bool) {
            self.accept_prompts.store(accept, Ordering::SeqCst);
        }

        pub fn fail_register(&self, fail: bool) {
            self.fail_register.store(fail, Ordering::SeqCst);
        }

        pub fn fail_unregister(&self, fail: bool) {
            self.fail_unregister.store(fail, Ordering::SeqCst);
        }

        pub fn fail_remove(&self, fail: bool) {
            self.fail_remove.store(fail, Ordering::SeqCst);
        }

        /// Make permission prompts take this long to answer.
        pub fn set_prompt_delay(&self, delay: Duration) {
            *self.prompt_delay.lock() = Some(delay);
        }

        /// Make menu creation take this long to complete.
        pub fn set_menu_delay(&self, delay: Duration) {
            *self.menu_delay.lock() = Some(delay);
        }

        /// Grant a pattern behind the extension's back (e.g. a previous session).
        pub fn grant(&self, pattern: &str) {
            self.granted.lock().insert(pattern.to_string());
        }

        /// Revoke a pattern out-of-band, like the user doing it in browser settings.
        pub fn revoke(&self, pattern: &str) {
            self.granted.lock().remove(pattern);
        }

        /// Forget dynamic scripts, like a browser restart.
        pub fn drop_scripts(&self) {
            self.scripts.lock().clear();
        }

        pub fn open_tab(&self, id: TabId, url: &str) {
            self.tabs.lock().insert(
                id,
                Tab {
                    id,
                    url: url.to_string(),
                },
            );
        }

        pub fn activate(&self, id: TabId) {
            *self.active.lock() = Some(id);
        }

        pub fn granted_patterns(&self) -> Vec<String> {
            self.granted.lock().iter().cloned().collect()
        }

        pub fn scripts(&self) -> Vec<ContentScriptDescriptor> {
            self.scripts.lock().values().cloned().collect()
        }

        pub fn menu(&self, id: &str) -> Option<MenuProps> {
            self.menus.lock().get(id).copied()
        }

        pub fn page_action(&self, tab: TabId) -> Option<bool> {
            self.page_actions.lock().get(&tab).copied()
        }

        pub fn calls(&self) -> Vec<HostCall> {
            self.calls.lock().clone()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().clear();
        }

        fn record(&self, call: HostCall) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl BrowserHost for MemoryHost {
        fn manifest_origins(&self) -> Vec<String> {
            self.manifest.clone()
        }

        async fn request_permission(&self, permission: &PermissionDescriptor) -> Result<bool, HostError> {
            for pattern in &permission.origins {
                self.record(HostCall::RequestPermission(pattern.clone()));
            }
            let delay = *self.prompt_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if !self.accept_prompts.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut granted = self.granted.lock();
            for pattern in &permission.origins {
                granted.insert(pattern.clone());
            }
            Ok(true)
        }

        async fn remove_permission(&self, permission: &PermissionDescriptor) -> Result<bool, HostError> {
            for pattern in &permission.origins {
                self.record(HostCall::RemovePermission(pattern.clone()));
            }
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(HostError::Rejected("permissions.remove failed".into()));
            }
            let mut granted = self.granted.lock();
            let mut removed = false;
            for pattern in &permission.origins {
                removed |= granted.remove(pattern);
            }
            Ok(removed)
        }

        async fn contains_permission(&self, permission: &PermissionDescriptor) -> Result<bool, HostError> {
            let granted = self.granted.lock();
            Ok(permission
                .origins
                .iter()
                .all(|p| granted.contains(p) || self.manifest.contains(p)))
        }

        async fn register_content_scripts(&self, scripts: &[ContentScriptDescriptor]) -> Result<(), HostError> {
            for script in scripts {
                self.record(HostCall::RegisterScript(script.id.clone()));
            }
            if self.fail_register.load(Ordering::SeqCst) {
                return Err(HostError::Rejected("scripting.registerContentScripts failed".into()));
            }
            let mut registered = self.scripts.lock();
            if let Some(dup) = scripts.iter().find(|s| registered.contains_key(&s.id)) {
                return Err(HostError::Rejected(format!("Duplicate script ID '{}'", dup.id)));
            }
            for script in scripts {
                registered.insert(script.id.clone(), script.clone());
            }
            Ok(())
        }

        async fn unregister_content_scripts(&self, ids: &[String]) -> Result<(), HostError> {
            for id in ids {
                self.record(HostCall::UnregisterScript(id.clone()));
            }
            if self.fail_unregister.load(Ordering::SeqCst) {
                return Err(HostError::Rejected("scripting.unregisterContentScripts failed".into()));
            }
            let mut registered = self.scripts.lock();
            if let Some(missing) = ids.iter().find(|id| !registered.contains_key(*id)) {
                return Err(HostError::Rejected(format!("Nonexistent script ID '{missing}'")));
            }
            for id in ids {
                registered.remove(id);
            }
            Ok(())
        }

        async fn registered_content_scripts(&self) -> Result<Vec<ContentScriptDescriptor>, HostError> {
            Ok(self.scripts())
        }

        async fn active_tab(&self) -> Result<Option<Tab>, HostError> {
            let active = *self.active.lock();
            Ok(active.and_then(|id| self.tabs.lock().get(&id).cloned()))
        }

        async fn get_tab(&self, id: TabId) -> Result<Tab, HostError> {
            self.tabs.lock().get(&id).cloned().ok_or(HostError::NoSuchTab(id))
        }

        async fn query_tabs(&self) -> Result<Vec<Tab>, HostError> {
            Ok(self.tabs.lock().values().cloned().collect())
        }

        async fn reload_tab(&self, id: TabId) -> Result<(), HostError> {
            self.record(HostCall::ReloadTab(id));
            if self.tabs.lock().contains_key(&id) {
                Ok(())
            } else {
                Err(HostError::NoSuchTab(id))
            }
        }

        async fn create_tab(&self, url: &str) -> Result<(), HostError> {
            self.record(HostCall::CreateTab(url.to_string()));
            Ok(())
        }

        async fn send_to_tab(&self, id: TabId, message: &Message) -> Result<(), HostError> {
            if !self.tabs.lock().contains_key(&id) {
                return Err(HostError::NoSuchTab(id));
            }
            self.record(HostCall::SendToTab(id, message.clone()));
            Ok(())
        }

        async fn create_menu(&self, item: &MenuItem) -> Result<(), HostError> {
            self.record(HostCall::CreateMenu(item.id.clone()));
            let delay = *self.menu_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut menus = self.menus.lock();
            if menus.contains_key(&item.id) {
                return Err(HostError::Rejected(format!("Cannot create item with duplicate id {}", item.id)));
            }
            menus.insert(item.id.clone(), item.props);
            Ok(())
        }

        async fn update_menu(&self, id: &str, props: MenuProps) -> Result<(), HostError> {
            self.record(HostCall::UpdateMenu(id.to_string(), props));
            match self.menus.lock().get_mut(id) {
                Some(current) => {
                    *current = props;
                    Ok(())
                }
                None => Err(HostError::Rejected(format!("Cannot find menu item with id {id}"))),
            }
        }

        async fn set_page_action(&self, tab: TabId, enabled: bool) -> Result<(), HostError> {
            self.record(HostCall::SetPageAction(tab, enabled));
            self.page_actions.lock().insert(tab, enabled);
            Ok(())
        }
    }
}
