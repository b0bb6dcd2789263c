//! Per-user favorites and settings persisted as pretty-printed JSON files.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine::Console;

#[derive(Error, Debug)]
pub enum PrefsError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode preferences: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Favorites,
    Settings,
}

impl Kind {
    fn empty(self) -> Value {
        match self {
            Kind::Favorites => Value::Array(Vec::new()),
            Kind::Settings => Value::Object(Map::new()),
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Kind::Favorites => value.is_array(),
            Kind::Settings => value.is_object(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Kind::Favorites => "favorites",
            Kind::Settings => "settings",
        }
    }
}

/// In-memory favorites (a list) and settings (a map) of one session, backed
/// by files. Paths are optional; without one the value lives in memory only.
#[derive(Debug)]
pub struct UserPrefs {
    favorites_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    favorites: Mutex<Vec<Value>>,
    settings: Mutex<Map<String, Value>>,
}

impl UserPrefs {
    /// Read both files. A missing file yields an empty value. A file that
    /// does not parse as the expected shape is reset to empty on disk.
    pub async fn load(
        favorites_path: Option<PathBuf>,
        settings_path: Option<PathBuf>,
        console: &Console,
    ) -> Self {
        let favorites = match read_or_reset(favorites_path.as_deref(), Kind::Favorites, console).await
        {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        let settings = match read_or_reset(settings_path.as_deref(), Kind::Settings, console).await {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            favorites_path,
            settings_path,
            favorites: Mutex::new(favorites),
            settings: Mutex::new(settings),
        }
    }

    pub fn favorites(&self) -> Value {
        Value::Array(self.favorites.lock().clone())
    }

    pub fn settings(&self) -> Value {
        Value::Object(self.settings.lock().clone())
    }

    /// Replace the favorites list and persist it.
    pub async fn save_favorites(&self, favorites: Vec<Value>) -> Result<(), PrefsError> {
        let encoded = serde_json::to_string_pretty(&favorites)?;
        *self.favorites.lock() = favorites;
        persist(self.favorites_path.as_deref(), encoded).await
    }

    /// Merge `updates` into the settings map and persist the result.
    pub async fn save_settings(&self, updates: Map<String, Value>) -> Result<(), PrefsError> {
        let encoded = {
            let mut settings = self.settings.lock();
            settings.extend(updates);
            serde_json::to_string_pretty(&*settings)?
        };
        persist(self.settings_path.as_deref(), encoded).await
    }
}

async fn read_or_reset(path: Option<&Path>, kind: Kind, console: &Console) -> Value {
    let Some(path) = path else {
        return kind.empty();
    };
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(_) => return kind.empty(),
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) if kind.accepts(&value) => value,
        _ => {
            tracing::error!(path = %path.display(), "user {} file is corrupt, resetting it", kind.label());
            console.error(format!(
                "The user {} file was corrupt and has been reset.",
                kind.label()
            ));
            let empty = kind.empty();
            if let Err(e) = persist(Some(path), empty.to_string()).await {
                tracing::error!(error = %e, "failed to reset user {} file", kind.label());
            }
            empty
        }
    }
}

async fn persist(path: Option<&Path>, contents: String) -> Result<(), PrefsError> {
    let Some(path) = path else {
        return Ok(());
    };
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| PrefsError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_files_yield_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = UserPrefs::load(
            Some(dir.path().join("fav.json")),
            Some(dir.path().join("settings.json")),
            &Console::new(),
        )
        .await;
        assert_eq!(prefs.favorites(), json!([]));
        assert_eq!(prefs.settings(), json!({}));
    }

    #[tokio::test]
    async fn corrupt_favorites_are_reset_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fav.json");
        std::fs::write(&path, "{not json").unwrap();

        let console = Console::new();
        let mut logs = console.subscribe();
        let prefs = UserPrefs::load(Some(path.clone()), None, &console).await;

        assert_eq!(prefs.favorites(), json!([]));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert_eq!(logs.recv().await.unwrap().level, crate::engine::Level::Error);
    }

    #[tokio::test]
    async fn wrong_shape_counts_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let prefs = UserPrefs::load(None, Some(path.clone()), &Console::new()).await;
        assert_eq!(prefs.settings(), json!({}));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn save_favorites_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fav.json");
        let prefs = UserPrefs::load(Some(path.clone()), None, &Console::new()).await;

        prefs
            .save_favorites(vec![json!({"action": "tap"})])
            .await
            .unwrap();
        assert_eq!(prefs.favorites(), json!([{"action": "tap"}]));
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains('\n'));
        let parsed: Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed, json!([{"action": "tap"}]));
    }

    #[tokio::test]
    async fn save_settings_merges_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"theme": "dark", "zoom": 1}"#).unwrap();
        let prefs = UserPrefs::load(None, Some(path.clone()), &Console::new()).await;

        let mut updates = Map::new();
        updates.insert("zoom".into(), json!(2));
        prefs.save_settings(updates).await.unwrap();

        assert_eq!(prefs.settings(), json!({"theme": "dark", "zoom": 2}));
        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, json!({"theme": "dark", "zoom": 2}));
    }
}
