//! Persisted local state.
//!
//! The background context is the only writer. Every change goes through
//! `Storage::update`, which serializes the load-modify-save cycle behind one
//! lock and only commits the in-memory copy once the backing store accepted it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{config_dir, load_json_config, save_json_config};
use crate::host::TabId;
use crate::origin::Origin;

/// Clone URL flavour used by injected clone buttons.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Https,
    Ssh,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PersistedState {
    #[serde(default)]
    pub protocol: Protocol,
    /// Whether content scripts may inject UI into pages
    #[serde(default = "default_true")]
    pub modify_pages: bool,
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub active_tab_id: Option<TabId>,
    /// Origin → provider script, for origins the user granted at runtime
    #[serde(default)]
    pub provider_scripts: BTreeMap<Origin, String>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            modify_pages: true,
            logging: false,
            active_tab_id: None,
            provider_scripts: BTreeMap::new(),
        }
    }
}

/// Durable backing for `PersistedState`.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, String>;
    fn save(&self, state: &PersistedState) -> Result<(), String>;
}

const STATE_FILE: &str = "state.json";

/// JSON file in the extension's config directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn in_config_dir() -> Self {
        Self::new(config_dir())
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<PersistedState, String> {
        Ok(load_json_config(&self.dir, STATE_FILE))
    }

    fn save(&self, state: &PersistedState) -> Result<(), String> {
        save_json_config(&self.dir, STATE_FILE, state)
    }
}

/// Cached view over a `StateStore`.
pub struct Storage {
    store: Arc<dyn StateStore>,
    state: Mutex<PersistedState>,
}

impl Storage {
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self, String> {
        let state = store.load()?;
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().clone()
    }

    pub fn protocol(&self) -> Protocol {
        self.state.lock().protocol
    }

    pub fn modify_pages(&self) -> bool {
        self.state.lock().modify_pages
    }

    pub fn logging(&self) -> bool {
        self.state.lock().logging
    }

    pub fn provider_script(&self, origin: &Origin) -> Option<String> {
        self.state.lock().provider_scripts.get(origin).cloned()
    }

    pub fn provider_scripts(&self) -> BTreeMap<Origin, String> {
        self.state.lock().provider_scripts.clone()
    }

    /// Apply `change` and persist the result. On a failed save the cached
    /// state is left as it was.
    pub fn update<R>(&self, change: impl FnOnce(&mut PersistedState) -> R) -> Result<R, String> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        let result = change(&mut next);
        if next != *guard {
            self.store.save(&next)?;
            *guard = next;
        }
        Ok(result)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use memory::MemoryStore;

#[cfg(any(test, feature = "test-support"))]
mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-process store that can be told to fail its next saves.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<PersistedState>,
        fail_saves: AtomicBool,
        saves: AtomicUsize,
    }

    impl MemoryStore {
        pub fn with_state(state: PersistedState) -> Self {
            Self {
                state: Mutex::new(state),
                ..Self::default()
            }
        }

        pub fn fail_saves(&self, fail: bool) {
            self.fail_saves.store(fail, Ordering::SeqCst);
        }

        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub fn stored(&self) -> PersistedState {
            self.state.lock().clone()
        }
    }

    impl StateStore for MemoryStore {
        fn load(&self) -> Result<PersistedState, String> {
            Ok(self.state.lock().clone())
        }

        fn save(&self, state: &PersistedState) -> Result<(), String> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err("storage quota exceeded".to_string());
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = state.clone();
            Ok(())
        }
    }
}
