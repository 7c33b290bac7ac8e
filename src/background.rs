//! Background controller: the extension's single long-lived context.
//!
//! Owns the capability lifecycle (menu, permissions, registrations), the
//! persisted preferences and the relay from injected buttons to the
//! companion application.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::action_menu::{ActionMenu, MenuClick, MenuState, ToggleHandler};
use crate::config::ExtensionConfig;
use crate::content::BackgroundChannel;
use crate::host::{BrowserHost, HostError, Tab, TabId};
use crate::logger::Logger;
use crate::messaging::{Message, PerformAction, Reply};
use crate::native::{ApplicationState, NativeClient, NativeError, NativeTransport};
use crate::origin::Origin;
use crate::permissions::PermissionController;
use crate::registry::ContentScriptRegistry;
use crate::storage::{PersistedState, StateStore, Storage};

const SOURCE: &str = "background";

/// Opened on install when the companion application is missing.
pub const INSTALL_URL: &str = "https://www.jetbrains.com/toolbox-app/";

/// Repository a tab's page action points at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PageAction {
    pub project: String,
    pub https: String,
    pub ssh: String,
}

pub struct Background {
    host: Arc<dyn BrowserHost>,
    storage: Arc<Storage>,
    registry: Arc<ContentScriptRegistry>,
    menu: Arc<ActionMenu>,
    permissions: Arc<PermissionController>,
    native: NativeClient,
    logger: Arc<Logger>,
    page_actions: DashMap<TabId, PageAction>,
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

impl Background {
    pub fn new(
        host: Arc<dyn BrowserHost>,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn NativeTransport>,
        config: Arc<ExtensionConfig>,
    ) -> Result<Arc<Self>, String> {
        let storage = Arc::new(Storage::open(store)?);
        let logger = Arc::new(Logger::new(storage.logging()));
        let registry = Arc::new(ContentScriptRegistry::new(host.clone()));
        let menu = Arc::new(ActionMenu::new(host.clone()));
        let permissions = Arc::new(PermissionController::new(
            host.clone(),
            registry.clone(),
            storage.clone(),
            menu.clone(),
            config,
            logger.clone(),
        ));
        Ok(Arc::new(Self {
            host,
            storage,
            registry,
            menu,
            permissions,
            native: NativeClient::new(transport),
            logger,
            page_actions: DashMap::new(),
        }))
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn permissions(&self) -> &Arc<PermissionController> {
        &self.permissions
    }

    pub fn registry(&self) -> &Arc<ContentScriptRegistry> {
        &self.registry
    }

    pub fn page_action(&self, tab: TabId) -> Option<PageAction> {
        self.page_actions.get(&tab).map(|entry| entry.value().clone())
    }

    /// Startup. Re-registers scripts the browser may have forgotten, creates
    /// the menu and renders it for the active tab.
    pub async fn init(self: &Arc<Self>) -> Result<(), String> {
        self.permissions.restore_registrations().await;

        let weak = Arc::downgrade(self);
        let on_toggle: ToggleHandler = Arc::new(move |click: MenuClick| -> BoxFuture<'static, ()> {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(background) = weak.upgrade() {
                    background.on_menu_click(click).await;
                }
            })
        });
        self.menu
            .create(on_toggle)
            .await
            .map_err(|e| format!("Failed to create menu: {e}"))?;

        self.refresh_menu().await;
        self.logger.info(SOURCE, "Background initialised");
        Ok(())
    }

    /// First install: point the user at the companion if it is missing.
    pub async fn on_installed(&self) -> ApplicationState {
        let state = self.native.probe().await;
        match &state {
            ApplicationState::NotInstalled => {
                self.logger.info(SOURCE, "Companion application not installed");
                if let Err(e) = self.host.create_tab(INSTALL_URL).await {
                    self.logger.warn(SOURCE, format!("Failed to open install page: {e}"));
                }
            }
            ApplicationState::InstalledError(error) => {
                self.logger.warn(SOURCE, format!("Companion application reported {error}"));
            }
            ApplicationState::Installed => {}
        }
        state
    }

    async fn render_for_url(&self, url: &str) {
        let state = match Origin::from_url(url) {
            Some(origin) => MenuState::from(self.permissions.grant_state(&origin).await),
            None => MenuState::InternalPage,
        };
        self.menu.render(state).await;
    }

    async fn refresh_menu(&self) {
        match self.host.active_tab().await {
            Ok(Some(tab)) => {
                self.remember_active_tab(Some(tab.id));
                self.render_for_url(&tab.url).await;
            }
            Ok(None) => {
                self.remember_active_tab(None);
                self.menu.render(MenuState::InternalPage).await;
            }
            Err(e) => self.logger.warn(SOURCE, format!("Failed to query active tab: {e}")),
        }
    }

    fn remember_active_tab(&self, tab_id: Option<TabId>) {
        if let Err(e) = self.storage.update(|s| s.active_tab_id = tab_id) {
            self.logger.warn(SOURCE, format!("Failed to persist active tab: {e}"));
        }
    }

    pub async fn on_tab_activated(&self, tab_id: TabId) {
        self.menu.render(MenuState::Undetermined).await;
        self.remember_active_tab(Some(tab_id));

        match self.host.get_tab(tab_id).await {
            Ok(tab) => self.render_for_url(&tab.url).await,
            Err(e) => {
                self.logger.warn(SOURCE, format!("Activated tab vanished: {e}"));
                self.menu.render(MenuState::InternalPage).await;
            }
        }
    }

    /// A navigation in `tab` completed.
    pub async fn on_tab_updated(&self, tab: &Tab) {
        if self.storage.snapshot().active_tab_id == Some(tab.id) {
            self.render_for_url(&tab.url).await;
        }
    }

    pub fn on_tab_removed(&self, tab_id: TabId) {
        self.page_actions.remove(&tab_id);
    }

    /// The menu checkbox was toggled; `checked` is its new value.
    pub async fn on_menu_click(&self, click: MenuClick) {
        let Some(origin) = click.page_url.as_deref().and_then(Origin::from_url) else {
            self.menu.render(MenuState::InternalPage).await;
            return;
        };
        if click.checked {
            self.permissions.request_grant(&origin).await;
        } else {
            self.permissions.revoke_grant(&origin).await;
        }
    }

    async fn broadcast(&self, message: Message) {
        let tabs = match self.host.query_tabs().await {
            Ok(tabs) => tabs,
            Err(e) => {
                self.logger.warn(SOURCE, format!("Failed to list tabs: {e}"));
                return;
            }
        };
        for tab in tabs {
            match self.host.send_to_tab(tab.id, &message).await {
                Ok(()) => {}
                // Tabs without a content script simply do not listen
                Err(HostError::NoReceiver(_)) => {}
                Err(e) => self.logger.debug(SOURCE, format!("Broadcast to tab {} failed: {e}", tab.id)),
            }
        }
    }

    fn persist(&self, what: &str, change: impl FnOnce(&mut PersistedState)) -> bool {
        match self.storage.update(change) {
            Ok(()) => true,
            Err(e) => {
                self.logger.error(SOURCE, format!("Failed to save {what}: {e}"));
                false
            }
        }
    }

    /// Handle a message from a content script (`sender` is its tab) or the
    /// popup (`sender` is `None`).
    pub async fn handle_message(self: &Arc<Self>, message: Message, sender: Option<TabId>) -> Reply {
        match message {
            Message::GetProtocol => Reply::Now(to_json(&self.storage.protocol())),
            Message::SaveProtocol { protocol } => {
                if self.persist("protocol", |s| s.protocol = protocol) {
                    self.broadcast(Message::ProtocolChanged { new_value: protocol }).await;
                }
                Reply::None
            }
            Message::GetModifyPages => Reply::Now(json!(self.storage.modify_pages())),
            Message::SaveModifyPages { allow } => {
                if self.persist("modify-pages", |s| s.modify_pages = allow) {
                    self.broadcast(Message::ModifyPagesChanged { new_value: allow }).await;
                }
                Reply::None
            }
            Message::GetLogging => Reply::Now(json!(self.storage.logging())),
            Message::SaveLogging { value } => {
                if self.persist("logging", |s| s.logging = value) {
                    self.logger.set_enabled(value);
                }
                Reply::None
            }
            Message::EnablePageAction { project, https, ssh } => {
                if let Some(tab) = sender {
                    self.page_actions.insert(tab, PageAction { project, https, ssh });
                    self.set_page_action(tab, true).await;
                }
                Reply::None
            }
            Message::DisablePageAction => {
                if let Some(tab) = sender {
                    self.page_actions.remove(&tab);
                    self.set_page_action(tab, false).await;
                }
                Reply::None
            }
            Message::PerformAction(action) => self.perform_action(action),
            Message::GetTools | Message::ProtocolChanged { .. } | Message::ModifyPagesChanged { .. } => {
                tracing::debug!(target: "background", "Ignoring tab-bound message");
                Reply::None
            }
        }
    }

    async fn set_page_action(&self, tab: TabId, enabled: bool) {
        if let Err(e) = self.host.set_page_action(tab, enabled).await {
            self.logger.warn(SOURCE, format!("Failed to update page action for tab {tab}: {e}"));
        }
    }

    /// Relay to the companion as `tools {tool, url}`. Answers later with the
    /// same pair, or `{error}` when the companion rejects it. An unreachable
    /// companion gets no answer.
    fn perform_action(self: &Arc<Self>, action: PerformAction) -> Reply {
        let (tx, reply) = Reply::later();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let tool = action.tool_tag().to_string();
            let url = action.toolbox_url();
            match this.native.open_in_tool(&tool, &url).await {
                Ok(_) => {
                    this.logger.info(SOURCE, format!("Opened {url} in {tool}"));
                    let _ = tx.send(json!({ "tool": tool, "url": url }));
                }
                Err(NativeError::Application(error)) => {
                    this.logger.error(SOURCE, format!("{tool} rejected {url}: {error}"));
                    let _ = tx.send(json!({ "error": error }));
                }
                Err(e @ NativeError::Communication(_)) => {
                    this.logger.warn(SOURCE, e.to_string());
                }
            }
        });
        reply
    }
}

/// In-process route from one tab's content script to the background.
pub struct TabChannel {
    background: Arc<Background>,
    tab: TabId,
}

impl TabChannel {
    pub fn new(background: Arc<Background>, tab: TabId) -> Self {
        Self { background, tab }
    }
}

#[async_trait(?Send)]
impl BackgroundChannel for TabChannel {
    async fn send(&self, message: Message) -> Option<Value> {
        self.background
            .handle_message(message, Some(self.tab))
            .await
            .resolve()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_menu::{MENU_ID, MenuProps};
    use crate::content::ContentScript;
    use crate::dom::Document;
    use crate::host::memory::{HostCall, MemoryHost};
    use crate::messaging::CloneAction;
    use crate::native::NativeMethod;
    use crate::native::fake::FakeTransport;
    use crate::storage::{MemoryStore, Protocol};
    use std::collections::BTreeMap;
    use std::rc::Rc;

    struct Fixture {
        host: Arc<MemoryHost>,
        store: Arc<MemoryStore>,
        transport: Arc<FakeTransport>,
        background: Arc<Background>,
    }

    fn fixture_with(state: PersistedState, transport: FakeTransport) -> Fixture {
        let host = Arc::new(MemoryHost::new(&["https://github.com/*"]));
        host.open_tab(1, "https://github.com/a/b");
        host.open_tab(2, "https://git.corp.example/team/tool");
        host.activate(1);
        let store = Arc::new(MemoryStore::with_state(state));
        let transport = Arc::new(transport);
        let background = Background::new(
            host.clone(),
            store.clone(),
            transport.clone(),
            Arc::new(ExtensionConfig::default()),
        )
        .unwrap();
        Fixture {
            host,
            store,
            transport,
            background,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PersistedState::default(), FakeTransport::ok(json!({})))
    }

    fn corp() -> Origin {
        Origin::from_url("https://git.corp.example").unwrap()
    }

    fn clone_action() -> PerformAction {
        PerformAction::Clone(CloneAction {
            tool_tag: "idea".into(),
            clone_url: "https://github.com/a/b.git".into(),
        })
    }

    #[tokio::test]
    async fn init_restores_registrations_and_renders_menu() {
        let mut state = PersistedState::default();
        state.provider_scripts = BTreeMap::from([(corp(), "content/gitlab.js".to_string())]);
        let f = fixture_with(state, FakeTransport::ok(json!({})));
        f.host.grant("https://git.corp.example/*");
        f.host.activate(2);

        f.background.init().await.unwrap();

        let scripts = f.host.scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].id, "https://git.corp.example/*");
        assert_eq!(scripts[0].js, vec!["content/gitlab.js".to_string()]);
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: true, checked: true }));
    }

    #[tokio::test]
    async fn init_twice_creates_one_menu() {
        let f = fixture();
        f.background.init().await.unwrap();
        f.background.init().await.unwrap();
        let creates = f
            .host
            .calls()
            .into_iter()
            .filter(|c| matches!(c, HostCall::CreateMenu(_)))
            .count();
        assert_eq!(creates, 1);
        // Active tab is on a manifest origin
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: false, checked: true }));
    }

    #[tokio::test]
    async fn missing_companion_opens_install_page() {
        let f = fixture_with(PersistedState::default(), FakeTransport::unreachable());
        assert_eq!(f.background.on_installed().await, ApplicationState::NotInstalled);
        assert!(f.host.calls().contains(&HostCall::CreateTab(INSTALL_URL.to_string())));

        let installed = fixture();
        assert_eq!(installed.background.on_installed().await, ApplicationState::Installed);
        assert!(!installed.host.calls().iter().any(|c| matches!(c, HostCall::CreateTab(_))));
    }

    #[tokio::test]
    async fn menu_click_grants_through_registered_handler() {
        let f = fixture();
        f.background.init().await.unwrap();
        f.host.activate(2);

        f.background
            .menu
            .dispatch_click(MenuClick {
                checked: true,
                page_url: Some("https://git.corp.example/team/tool".into()),
            })
            .await;

        assert!(f.background.registry().registration(&corp()).is_some());
        assert_eq!(f.background.storage().provider_script(&corp()).as_deref(), Some("content/detect.js"));
        assert!(f.host.calls().contains(&HostCall::ReloadTab(2)));
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: true, checked: true }));

        f.background
            .on_menu_click(MenuClick {
                checked: false,
                page_url: Some("https://git.corp.example/".into()),
            })
            .await;
        assert!(f.background.registry().registration(&corp()).is_none());
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: true, checked: false }));
    }

    #[tokio::test]
    async fn tab_activation_tracks_state() {
        let f = fixture();
        f.background.init().await.unwrap();
        f.host.open_tab(3, "chrome://extensions");

        f.background.on_tab_activated(3).await;
        assert_eq!(f.store.stored().active_tab_id, Some(3));
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: false, checked: false }));

        f.background.on_tab_activated(2).await;
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: true, checked: false }));

        // Updates in background tabs do not touch the menu
        f.host.clear_calls();
        f.background
            .on_tab_updated(&Tab { id: 1, url: "https://github.com/x/y".into() })
            .await;
        assert!(f.host.calls().is_empty());
    }

    #[tokio::test]
    async fn navigation_in_initial_tab_updates_menu() {
        let f = fixture();
        f.background.init().await.unwrap();
        assert_eq!(f.store.stored().active_tab_id, Some(1));
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: false, checked: true }));

        f.background
            .on_tab_updated(&Tab { id: 1, url: "chrome://settings".into() })
            .await;
        assert_eq!(f.host.menu(MENU_ID), Some(MenuProps { enabled: false, checked: false }));
    }

    #[tokio::test]
    async fn save_protocol_persists_and_broadcasts() {
        let f = fixture();
        let reply = f
            .background
            .handle_message(Message::SaveProtocol { protocol: Protocol::Ssh }, None)
            .await;
        assert!(matches!(reply, Reply::None));
        assert_eq!(f.store.stored().protocol, Protocol::Ssh);

        let changed = Message::ProtocolChanged { new_value: Protocol::Ssh };
        let calls = f.host.calls();
        assert!(calls.contains(&HostCall::SendToTab(1, changed.clone())));
        assert!(calls.contains(&HostCall::SendToTab(2, changed)));

        let protocol = f.background.handle_message(Message::GetProtocol, None).await;
        assert_eq!(protocol.resolve().await, Some(json!("SSH")));
    }

    #[tokio::test]
    async fn failed_save_does_not_broadcast() {
        let f = fixture();
        f.store.fail_saves(true);
        f.background
            .handle_message(Message::SaveModifyPages { allow: false }, None)
            .await;
        assert!(f.background.storage().modify_pages());
        assert!(!f.host.calls().iter().any(|c| matches!(c, HostCall::SendToTab(..))));
    }

    #[tokio::test]
    async fn logging_switch_reaches_logger() {
        let f = fixture();
        assert!(!f.background.logger().is_enabled());
        f.background
            .handle_message(Message::SaveLogging { value: true }, None)
            .await;
        assert!(f.background.logger().is_enabled());
        let reply = f.background.handle_message(Message::GetLogging, None).await;
        assert_eq!(reply.resolve().await, Some(json!(true)));
    }

    #[tokio::test]
    async fn page_action_follows_sender_tab() {
        let f = fixture();
        f.background
            .handle_message(
                Message::EnablePageAction {
                    project: "b".into(),
                    https: "https://github.com/a/b.git".into(),
                    ssh: "git@github.com:a/b.git".into(),
                },
                Some(1),
            )
            .await;
        assert_eq!(f.host.page_action(1), Some(true));
        assert_eq!(f.background.page_action(1).unwrap().project, "b");

        f.background.handle_message(Message::DisablePageAction, Some(1)).await;
        assert_eq!(f.host.page_action(1), Some(false));
        assert!(f.background.page_action(1).is_none());
    }

    #[tokio::test]
    async fn perform_action_relays_tools_call() {
        let f = fixture();
        let reply = f
            .background
            .handle_message(Message::PerformAction(clone_action()), Some(1))
            .await;
        assert!(matches!(reply, Reply::Later(_)));

        let url = clone_action().toolbox_url();
        assert_eq!(reply.resolve().await, Some(json!({"tool": "idea", "url": url})));
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, NativeMethod::Tools);
        assert_eq!(requests[0].arguments, json!({"tool": "idea", "url": url}));
    }

    #[tokio::test]
    async fn application_error_is_answered_and_logged() {
        let state = PersistedState {
            logging: true,
            ..PersistedState::default()
        };
        let f = fixture_with(state, FakeTransport::app_error(json!("tool not installed")));
        let reply = f
            .background
            .handle_message(Message::PerformAction(clone_action()), Some(1))
            .await;
        assert_eq!(reply.resolve().await, Some(json!({"error": "tool not installed"})));
        assert!(
            f.background
                .logger()
                .entries(10)
                .iter()
                .any(|e| e.message.contains("tool not installed"))
        );
    }

    #[tokio::test]
    async fn unreachable_companion_gets_no_answer() {
        let f = fixture_with(PersistedState::default(), FakeTransport::unreachable());
        let reply = f
            .background
            .handle_message(Message::PerformAction(clone_action()), Some(1))
            .await;
        assert_eq!(reply.resolve().await, None);
    }

    #[tokio::test]
    async fn content_script_talks_to_background_in_process() {
        let f = fixture();
        f.host.open_tab(5, "https://example.com/");
        let channel = Rc::new(TabChannel::new(f.background.clone(), 5));
        let script = ContentScript::new(
            Document::new("https://example.com/"),
            channel,
            Arc::new(ExtensionConfig::default()),
            Arc::new(Logger::default()),
            None,
        );

        script.boot().await;

        assert_eq!(script.protocol(), Protocol::Https);
        assert_eq!(f.host.page_action(5), Some(false));
    }
}
