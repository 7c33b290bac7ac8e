//! Toolbar checkbox ("Enable on this site").
//!
//! The menu never holds state of its own: every render is derived from the
//! grant state of the active tab's origin.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::host::{BrowserHost, HostError, MenuItem};
use crate::origin::GrantState;

pub const MENU_ID: &str = "toolbox-enable-on-site";
const MENU_TITLE: &str = "Enable on this site";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuProps {
    pub enabled: bool,
    pub checked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuState {
    /// Grant state not resolved yet (tab switch in flight)
    Undetermined,
    ManifestGranted,
    UserGranted,
    NotGranted,
    /// Browser-internal or otherwise non-http page
    InternalPage,
}

impl MenuState {
    pub fn props(self) -> MenuProps {
        let (enabled, checked) = match self {
            MenuState::Undetermined => (false, false),
            MenuState::ManifestGranted => (false, true),
            MenuState::UserGranted => (true, true),
            MenuState::NotGranted => (true, false),
            MenuState::InternalPage => (false, false),
        };
        MenuProps { enabled, checked }
    }
}

impl From<GrantState> for MenuState {
    fn from(grant: GrantState) -> Self {
        match grant {
            GrantState::Manifest => MenuState::ManifestGranted,
            GrantState::User => MenuState::UserGranted,
            GrantState::None => MenuState::NotGranted,
        }
    }
}

/// What the browser reports when the checkbox is clicked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MenuClick {
    pub checked: bool,
    pub page_url: Option<String>,
}

pub type ToggleHandler = Arc<dyn Fn(MenuClick) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ActionMenu {
    host: Arc<dyn BrowserHost>,
    handler: Mutex<Option<ToggleHandler>>,
    created: AtomicBool,
}

impl ActionMenu {
    pub fn new(host: Arc<dyn BrowserHost>) -> Self {
        Self {
            host,
            handler: Mutex::new(None),
            created: AtomicBool::new(false),
        }
    }

    /// True once the browser has accepted the menu item.
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    /// Create the menu item and install the click handler. A second call is a
    /// no-op, so the handler can never be registered twice. Renders issued
    /// while creation is pending are dropped.
    pub async fn create(&self, on_toggle: ToggleHandler) -> Result<(), HostError> {
        {
            let mut handler = self.handler.lock();
            if handler.is_some() {
                return Ok(());
            }
            *handler = Some(on_toggle);
        }

        let item = MenuItem {
            id: MENU_ID.to_string(),
            title: MENU_TITLE.to_string(),
            contexts: vec!["action".to_string()],
            props: MenuState::Undetermined.props(),
        };
        if let Err(e) = self.host.create_menu(&item).await {
            *self.handler.lock() = None;
            return Err(e);
        }
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Push new props to the browser. Does nothing before `create`.
    pub async fn update(&self, props: MenuProps) {
        if !self.is_created() {
            return;
        }
        if let Err(e) = self.host.update_menu(MENU_ID, props).await {
            tracing::warn!(target: "action_menu", "Failed to update menu: {e}");
        }
    }

    pub async fn render(&self, state: MenuState) {
        self.update(state.props()).await;
    }

    /// Deliver a browser click to the installed handler.
    pub async fn dispatch_click(&self, click: MenuClick) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(click).await,
            None => tracing::debug!(target: "action_menu", "Click before menu creation ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{HostCall, MemoryHost};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_handler(count: Arc<AtomicUsize>) -> ToggleHandler {
        Arc::new(move |_click: MenuClick| -> BoxFuture<'static, ()> {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn state_table() {
        assert_eq!(MenuState::ManifestGranted.props(), MenuProps { enabled: false, checked: true });
        assert_eq!(MenuState::UserGranted.props(), MenuProps { enabled: true, checked: true });
        assert_eq!(MenuState::NotGranted.props(), MenuProps { enabled: true, checked: false });
        assert_eq!(MenuState::InternalPage.props(), MenuProps { enabled: false, checked: false });
        assert_eq!(MenuState::Undetermined.props(), MenuProps { enabled: false, checked: false });
    }

    #[test]
    fn manifest_grant_renders_disabled_checked() {
        let props = MenuState::from(GrantState::Manifest).props();
        assert!(!props.enabled);
        assert!(props.checked);
    }

    #[tokio::test]
    async fn update_before_create_is_noop() {
        let host = Arc::new(MemoryHost::new(&[]));
        let menu = ActionMenu::new(host.clone());
        menu.render(MenuState::UserGranted).await;
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn create_twice_registers_one_handler() {
        let host = Arc::new(MemoryHost::new(&[]));
        let menu = ActionMenu::new(host.clone());
        let count = Arc::new(AtomicUsize::new(0));

        menu.create(counting_handler(count.clone())).await.unwrap();
        menu.create(counting_handler(count.clone())).await.unwrap();
        assert_eq!(host.calls(), vec![HostCall::CreateMenu(MENU_ID.into())]);

        menu.dispatch_click(MenuClick {
            checked: true,
            page_url: None,
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn render_after_create_reaches_host() {
        let host = Arc::new(MemoryHost::new(&[]));
        let menu = ActionMenu::new(host.clone());
        menu.create(counting_handler(Arc::new(AtomicUsize::new(0)))).await.unwrap();
        menu.render(MenuState::NotGranted).await;
        assert_eq!(host.menu(MENU_ID), Some(MenuProps { enabled: true, checked: false }));
    }

    #[tokio::test]
    async fn render_while_create_pending_is_dropped() {
        let host = Arc::new(MemoryHost::new(&[]));
        host.set_menu_delay(Duration::from_millis(50));
        let menu = Arc::new(ActionMenu::new(host.clone()));

        let creating = {
            let menu = menu.clone();
            tokio::spawn(async move { menu.create(counting_handler(Arc::new(AtomicUsize::new(0)))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!menu.is_created());
        menu.render(MenuState::UserGranted).await;
        assert!(!host.calls().iter().any(|c| matches!(c, HostCall::UpdateMenu(..))));

        creating.await.unwrap().unwrap();
        assert!(menu.is_created());
        menu.render(MenuState::NotGranted).await;
        assert_eq!(host.menu(MENU_ID), Some(MenuProps { enabled: true, checked: false }));
    }

    #[tokio::test]
    async fn click_before_create_is_ignored() {
        let host = Arc::new(MemoryHost::new(&[]));
        let menu = ActionMenu::new(host);
        menu.dispatch_click(MenuClick {
            checked: true,
            page_url: Some("https://x".into()),
        })
        .await;
        assert!(!menu.is_created());
    }
}
