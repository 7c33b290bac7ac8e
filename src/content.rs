//! Content-script context: one per tab, living as long as the page.
//!
//! Boots the provider pipeline (metadata, tools, injection), keeps injected
//! buttons alive across re-renders through `DomObserver`s, re-runs the
//! pipeline on client-side navigation and reacts to preference broadcasts.
//! Single-threaded: the page document is `Rc`-based, so nothing here is `Send`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::ExtensionConfig;
use crate::dom::{Document, DomObserver, Element};
use crate::logger::Logger;
use crate::messaging::{Message, PerformAction, Reply};
use crate::providers::inject::{ActionSink, inject_clone_buttons, inject_file_buttons, remove_injected};
use crate::providers::{MetadataUnavailable, PageState, Provider, RepositoryMetadata, fetch_tools};
use crate::storage::Protocol;
use crate::tools::Tool;

const SOURCE: &str = "content";

/// Route to the background controller.
#[async_trait(?Send)]
pub trait BackgroundChannel {
    /// Send a message and wait for its answer, if the handler gives one.
    async fn send(&self, message: Message) -> Option<Value>;
}

struct Page {
    provider: Option<Rc<Provider>>,
    state: PageState,
    protocol: Protocol,
    modify_pages: bool,
    observers: Vec<DomObserver<Document>>,
    tool_waiters: Vec<oneshot::Sender<Value>>,
    /// Bumped whenever the pipeline restarts; stale runs drop their results.
    generation: u64,
}

pub struct ContentScript {
    doc: Document,
    channel: Rc<dyn BackgroundChannel>,
    config: Arc<ExtensionConfig>,
    logger: Arc<Logger>,
    script_ref: Option<String>,
    page: RefCell<Page>,
    outbox: mpsc::UnboundedSender<PerformAction>,
    inbox: RefCell<mpsc::UnboundedReceiver<PerformAction>>,
}

fn tools_json(tools: &[Tool]) -> Value {
    serde_json::to_value(tools).unwrap_or_default()
}

impl ContentScript {
    /// `script_ref` is the provider script the background registered for
    /// this origin; it hints which adapter to boot.
    pub fn new(
        doc: Document,
        channel: Rc<dyn BackgroundChannel>,
        config: Arc<ExtensionConfig>,
        logger: Arc<Logger>,
        script_ref: Option<String>,
    ) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            doc,
            channel,
            config,
            logger,
            script_ref,
            page: RefCell::new(Page {
                provider: None,
                state: PageState::Idle,
                protocol: Protocol::default(),
                modify_pages: true,
                observers: Vec::new(),
                tool_waiters: Vec::new(),
                generation: 0,
            }),
            outbox,
            inbox: RefCell::new(inbox),
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn state(&self) -> PageState {
        self.page.borrow().state.clone()
    }

    pub fn protocol(&self) -> Protocol {
        self.page.borrow().protocol
    }

    fn provider(&self) -> Option<Rc<Provider>> {
        self.page.borrow().provider.clone()
    }

    fn generation(&self) -> u64 {
        self.page.borrow().generation
    }

    async fn ask<T: DeserializeOwned>(&self, message: Message) -> Option<T> {
        let value = self.channel.send(message).await?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(target: "content", "Unexpected reply from background: {e}");
                None
            }
        }
    }

    /// Run the pipeline for the page as loaded.
    pub async fn boot(&self) {
        let protocol = self.ask::<Protocol>(Message::GetProtocol).await.unwrap_or_default();
        let modify_pages = self.ask::<bool>(Message::GetModifyPages).await.unwrap_or(true);
        let logging = self.ask::<bool>(Message::GetLogging).await.unwrap_or(false);
        self.logger.set_enabled(logging);
        {
            let mut page = self.page.borrow_mut();
            page.protocol = protocol;
            page.modify_pages = modify_pages;
        }

        let Some(provider) = self.detect_provider() else {
            self.unavailable(MetadataUnavailable::new("no provider recognizes this page"))
                .await;
            return;
        };
        let generation = self.generation();
        let result = provider.adapter().fetch_metadata(&self.doc).await;
        if self.generation() == generation {
            self.apply_metadata(provider, result, generation).await;
        }
    }

    fn detect_provider(&self) -> Option<Rc<Provider>> {
        if let Some(provider) = self.provider() {
            return Some(provider);
        }
        let provider = Rc::new(Provider::detect(
            &self.doc,
            self.script_ref.as_deref(),
            &self.config,
        )?);
        self.logger.debug(SOURCE, format!("Using {} adapter", provider.kind()));
        self.page.borrow_mut().provider = Some(Rc::clone(&provider));
        Some(provider)
    }

    async fn apply_metadata(
        &self,
        provider: Rc<Provider>,
        result: Result<RepositoryMetadata, MetadataUnavailable>,
        generation: u64,
    ) {
        let metadata = match result {
            Ok(metadata) => metadata,
            Err(reason) => {
                self.unavailable(reason).await;
                return;
            }
        };

        let fetched = self.page.borrow_mut().state.metadata_fetched(metadata.clone());
        if let Err(e) = fetched {
            tracing::warn!(target: "content", "{e}");
            return;
        }
        self.channel
            .send(Message::EnablePageAction {
                project: metadata.repository.clone(),
                https: metadata.https_clone_url.clone(),
                ssh: metadata.ssh_clone_url.clone(),
            })
            .await;

        let tools = fetch_tools(provider.adapter(), &metadata, &self.doc, &self.logger).await;
        if self.generation() != generation {
            return;
        }

        let (waiters, modify_pages) = {
            let mut page = self.page.borrow_mut();
            if let Err(e) = page.state.tools_resolved(tools.clone()) {
                tracing::warn!(target: "content", "{e}");
                return;
            }
            (std::mem::take(&mut page.tool_waiters), page.modify_pages)
        };
        let reply = tools_json(&tools);
        for waiter in waiters {
            let _ = waiter.send(reply.clone());
        }
        if modify_pages {
            self.inject();
        }
    }

    /// Leave the DOM untouched and have the background disable the page action.
    async fn unavailable(&self, reason: MetadataUnavailable) {
        self.logger.info(SOURCE, reason.to_string());
        let waiters = {
            let mut page = self.page.borrow_mut();
            if let Err(e) = page.state.unavailable(reason) {
                tracing::warn!(target: "content", "{e}");
            }
            std::mem::take(&mut page.tool_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Value::Array(Vec::new()));
        }
        self.channel.send(Message::DisablePageAction).await;
    }

    fn sink(&self) -> ActionSink {
        let outbox = self.outbox.clone();
        Rc::new(move |action| {
            if outbox.send(action).is_err() {
                tracing::debug!(target: "content", "Action dropped; content script gone");
            }
        })
    }

    /// Start mount-point observers that (re)insert buttons wherever the
    /// site renders a mount point. A mount point that never appears is fine.
    fn inject(&self) {
        let (provider, metadata, tools, protocol) = {
            let page = self.page.borrow();
            let (Some(provider), Some(metadata), Some(tools)) =
                (page.provider.clone(), page.state.metadata(), page.state.tools())
            else {
                return;
            };
            (provider, metadata.clone(), tools.to_vec(), page.protocol)
        };
        let adapter = provider.adapter();
        let mut observers = Vec::new();

        match DomObserver::new(self.doc.clone(), adapter.clone_mount_selector()) {
            Ok(observer) => {
                let tools = tools.clone();
                let clone_url = metadata.clone_url(protocol).to_string();
                let sink = self.sink();
                observer.start(
                    move |mount: &Element| {
                        inject_clone_buttons(mount, &tools, &clone_url, &sink);
                    },
                    None,
                );
                observers.push(observer);
            }
            Err(e) => self.logger.warn(SOURCE, e.to_string()),
        }

        if let Some(location) = adapter.file_location(&self.doc.url()) {
            match DomObserver::new(self.doc.clone(), adapter.file_mount_selector()) {
                Ok(observer) => {
                    let project = metadata.repository.clone();
                    let sink = self.sink();
                    observer.start(
                        move |mount: &Element| {
                            inject_file_buttons(mount, &tools, &project, &location, &sink);
                        },
                        None,
                    );
                    observers.push(observer);
                }
                Err(e) => self.logger.warn(SOURCE, e.to_string()),
            }
        }

        let mut page = self.page.borrow_mut();
        page.observers = observers;
        if let Err(e) = page.state.ui_injected() {
            tracing::warn!(target: "content", "{e}");
        }
    }

    /// Stop observers and remove every injected node.
    fn remove_ui(&self) {
        let observers = std::mem::take(&mut self.page.borrow_mut().observers);
        drop(observers);
        let removed = remove_injected(&self.doc, None);
        if removed > 0 {
            self.logger.debug(SOURCE, format!("Removed {removed} injected containers"));
        }
        self.page.borrow_mut().state.ui_removed();
    }

    /// The page URL changed without a reload. A different repository
    /// restarts the pipeline; the same one only re-renders.
    pub async fn handle_navigation(&self, url: &str) {
        if self.doc.url() == url {
            return;
        }
        self.doc.set_url(url);
        let Some(provider) = self.detect_provider() else {
            return;
        };

        let generation = self.generation();
        let result = provider.adapter().fetch_metadata(&self.doc).await;
        if self.generation() != generation {
            return;
        }

        let same_repository = {
            let page = self.page.borrow();
            match (page.state.metadata(), &result) {
                (Some(current), Ok(next)) => current.same_repository(next),
                _ => false,
            }
        };
        if same_repository {
            let injected = matches!(self.page.borrow().state, PageState::UiInjected { .. });
            if injected {
                self.remove_ui();
                self.inject();
            }
            return;
        }

        self.logger.info(SOURCE, format!("Repository changed; restarting at {url}"));
        self.remove_ui();
        let generation = {
            let mut page = self.page.borrow_mut();
            page.state.reset();
            page.generation += 1;
            page.generation
        };
        self.apply_metadata(provider, result, generation).await;
    }

    /// Messages the background or popup send to this tab.
    pub fn handle_message(&self, message: Message) -> Reply {
        match message {
            Message::GetTools => {
                let mut page = self.page.borrow_mut();
                if let Some(tools) = page.state.tools() {
                    return Reply::Now(tools_json(tools));
                }
                if let PageState::Unavailable(_) = page.state {
                    return Reply::Now(Value::Array(Vec::new()));
                }
                let (tx, reply) = Reply::later();
                page.tool_waiters.push(tx);
                reply
            }
            Message::ProtocolChanged { new_value } => {
                let rerender = {
                    let mut page = self.page.borrow_mut();
                    let changed = page.protocol != new_value;
                    page.protocol = new_value;
                    changed && matches!(page.state, PageState::UiInjected { .. })
                };
                if rerender {
                    self.remove_ui();
                    self.inject();
                }
                Reply::None
            }
            Message::ModifyPagesChanged { new_value } => {
                let resolved = {
                    let mut page = self.page.borrow_mut();
                    page.modify_pages = new_value;
                    matches!(page.state, PageState::ToolsResolved { .. })
                };
                if !new_value {
                    self.remove_ui();
                } else if resolved {
                    self.inject();
                }
                Reply::None
            }
            _ => Reply::None,
        }
    }

    /// Relay clicked actions to the background, returning its answers.
    pub async fn flush_actions(&self) -> Vec<Option<Value>> {
        let actions: Vec<PerformAction> = {
            let mut inbox = self.inbox.borrow_mut();
            std::iter::from_fn(|| inbox.try_recv().ok()).collect()
        };
        let mut replies = Vec::with_capacity(actions.len());
        for action in actions {
            replies.push(self.channel.send(Message::PerformAction(action)).await);
        }
        replies
    }

    /// Page unload: stop observing and drop injected UI.
    pub fn teardown(&self) {
        self.remove_ui();
        let mut page = self.page.borrow_mut();
        page.state.reset();
        page.generation += 1;
    }
}
