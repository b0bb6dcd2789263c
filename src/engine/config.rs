use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Notification published after every `set`.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub name: String,
    pub value: Value,
    /// Full configuration as of this change.
    pub config: Value,
}

/// Key/value configuration of one engine instance.
///
/// Clones share the same store. Every `set` is broadcast to subscribers so the
/// session layer can push `config update` events to clients.
#[derive(Clone)]
pub struct EngineConfig {
    values: Arc<RwLock<Map<String, Value>>>,
    changes: broadcast::Sender<ConfigChange>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("keys", &self.values.read().len())
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn new(seed: Map<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: Arc::new(RwLock::new(seed)),
            changes,
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    /// String value of `name`, if present and a string.
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name).and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Snapshot of the whole configuration as a JSON object.
    pub fn get_all(&self) -> Value {
        Value::Object(self.values.read().clone())
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let config = {
            let mut values = self.values.write();
            values.insert(name.clone(), value.clone());
            Value::Object(values.clone())
        };
        let _ = self.changes.send(ConfigChange {
            name,
            value,
            config,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    /// The configured home directory with any trailing separator removed.
    pub fn user_home(&self) -> String {
        let home = self
            .get_str("userHome")
            .or_else(|| dirs::home_dir().map(|p| p.to_string_lossy().into_owned()))
            .unwrap_or_default();
        home.trim_end_matches(['/', '\\']).to_string()
    }
}
