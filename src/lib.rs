//! Core of a browser extension that opens repositories and files from
//! code-hosting pages in JetBrains IDEs through the Toolbox App.
//!
//! The background side (`background`, `permissions`, `registry`,
//! `action_menu`, `native`) is `Send` and talks to the browser through
//! `host::BrowserHost`. The page side (`content`, `dom`, `providers`) lives on
//! a single thread, like a content script does.

pub mod action_menu;
pub mod background;
pub mod config;
pub mod content;
pub mod dom;
pub mod host;
pub mod logger;
pub mod messaging;
pub mod native;
pub mod origin;
pub mod permissions;
pub mod providers;
pub mod registry;
pub mod storage;
pub mod toolbox_url;
pub mod tools;

pub use background::{Background, TabChannel};
pub use content::{BackgroundChannel, ContentScript};
pub use messaging::{Message, PerformAction, Reply};
pub use origin::Origin;
