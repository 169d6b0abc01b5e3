use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// Per-session gateway configuration. Lives only in process memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub selected_instance_key: Option<String>,
}

impl SessionConfig {
    /// The selected key, or an empty string when nothing is selected.
    pub fn instance_key_or_empty(&self) -> &str {
        self.selected_instance_key.as_deref().unwrap_or("")
    }
}

/// A change an action makes to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Config { api_key: String, base_url: String },
    Select(String),
}

impl SessionUpdate {
    /// Touches only the fields the action owns, leaving the rest as they are.
    pub fn apply(self, config: &mut SessionConfig) {
        match self {
            Self::Config { api_key, base_url } => {
                config.api_key = Some(api_key);
                config.base_url = Some(base_url);
            }
            Self::Select(key) => config.selected_instance_key = Some(key),
        }
    }
}

struct Entry {
    config: SessionConfig,
    touched: Instant,
}

/// Sessions keyed by the id carried in the session cookie.
pub struct SessionStore {
    ttl: Duration,
    inner: Mutex<HashMap<String, Entry>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, inner: Mutex::new(HashMap::new()) }
    }

    /// Returns the session id to use and a copy of its config. Unknown or
    /// expired ids get a fresh, empty session.
    pub fn checkout(&self, id: Option<&str>) -> (String, SessionConfig, bool) {
        let now = Instant::now();
        let mut map = self.lock();
        let ttl = self.ttl;
        map.retain(|_, e| now.duration_since(e.touched) < ttl);

        if let Some(id) = id {
            if let Some(entry) = map.get_mut(id) {
                entry.touched = now;
                return (id.to_string(), entry.config.clone(), false);
            }
        }
        let id = Uuid::new_v4().simple().to_string();
        map.insert(id.clone(), Entry { config: SessionConfig::default(), touched: now });
        log::debug!("opened session {}", id);
        (id, SessionConfig::default(), true)
    }

    /// Applies `update` to the session as it is now, not as it was at
    /// checkout, so concurrent requests on one session keep each other's
    /// changes. A session that expired meanwhile is recreated.
    pub fn update(&self, id: &str, update: SessionUpdate) {
        let now = Instant::now();
        let mut map = self.lock();
        let entry = map
            .entry(id.to_string())
            .or_insert_with(|| Entry { config: SessionConfig::default(), touched: now });
        entry.touched = now;
        update.apply(&mut entry.config);
    }

    /// Current config for `id`, if the session is live.
    pub fn get(&self, id: &str) -> Option<SessionConfig> {
        self.lock().get(id).map(|e| e.config.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map still holds valid configs; keep serving them.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
