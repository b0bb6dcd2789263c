use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::engine::{AssetCollection, ElementTree, ProcessHandle};
use crate::events::Subscription;

/// Last tree fetched for a session.
#[derive(Clone)]
pub struct TreeSnapshot {
    pub tree: Arc<dyn ElementTree>,
    /// Per-session sequence number.
    pub number: u64,
    pub hash: String,
    /// Unix time in milliseconds.
    pub generated: u64,
}

impl TreeSnapshot {
    pub fn to_json(&self) -> Value {
        json!({
            "generated": self.generated,
            "contents": self.tree.contents(),
            "treeNumber": self.number,
            "hash": self.hash,
        })
    }
}

impl std::fmt::Debug for TreeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeSnapshot")
            .field("number", &self.number)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// A loaded asset collection and its "asset load" listener.
pub struct AssetEntry {
    pub collection: Arc<dyn AssetCollection>,
    pub listener: Subscription,
}

/// A framework process and its "framework died" listener.
pub struct ProcessEntry {
    pub handle: ProcessHandle,
    pub listener: Option<Subscription>,
}

/// A value that can be stored in a [`ResourceRegistry`].
pub enum Resource {
    Assets(AssetEntry),
    Process(ProcessEntry),
    Tree(TreeSnapshot),
}

impl Resource {
    fn field(&self) -> &'static str {
        match self {
            Self::Assets(_) => "assets",
            Self::Process(_) => "process",
            Self::Tree(_) => "tree",
        }
    }
}

#[derive(Default)]
struct Entries {
    assets: Option<AssetEntry>,
    process: Option<ProcessEntry>,
    tree: Option<TreeSnapshot>,
}

/// Per-session store of ancillary handles.
///
/// Each field holds at most one value; registering again replaces (and
/// unsubscribes) the previous one. Once [`clear`](Self::clear) has run the
/// registry refuses further registrations, which is how late callbacks of a
/// torn-down session become no-ops.
pub struct ResourceRegistry {
    connection_id: String,
    entries: Mutex<Option<Entries>>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("connection_id", &self.connection_id)
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            entries: Mutex::new(Some(Entries::default())),
        }
    }

    /// Store `resource`. Returns `false` (dropping the resource and its
    /// listener) if the registry has already been cleared.
    pub fn register(&self, resource: Resource) -> bool {
        let field = resource.field();
        // Replaced values are dropped outside the lock.
        let _previous = {
            let mut guard = self.entries.lock();
            let Some(entries) = guard.as_mut() else {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    field,
                    "registry cleared, dropping late registration"
                );
                return false;
            };
            match resource {
                Resource::Assets(entry) => entries.assets.replace(entry).map(Resource::Assets),
                Resource::Process(entry) => entries.process.replace(entry).map(Resource::Process),
                Resource::Tree(snapshot) => entries.tree.replace(snapshot).map(Resource::Tree),
            }
        };
        true
    }

    pub fn assets(&self) -> Option<Arc<dyn AssetCollection>> {
        self.entries
            .lock()
            .as_ref()
            .and_then(|e| e.assets.as_ref().map(|a| Arc::clone(&a.collection)))
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.entries
            .lock()
            .as_ref()
            .and_then(|e| e.process.as_ref().map(|p| p.handle.clone()))
    }

    pub fn tree(&self) -> Option<TreeSnapshot> {
        self.entries.lock().as_ref().and_then(|e| e.tree.clone())
    }

    /// Unsubscribe the process termination listener, keeping the handle.
    /// Returns whether a listener was attached.
    pub fn detach_process_listener(&self) -> bool {
        let listener = self
            .entries
            .lock()
            .as_mut()
            .and_then(|e| e.process.as_mut())
            .and_then(|p| p.listener.take());
        match listener {
            Some(sub) => {
                sub.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Remove every entry, running its cleanup. Returns `false` if the
    /// registry was already cleared.
    pub fn clear(&self) -> bool {
        let Some(entries) = self.entries.lock().take() else {
            return false;
        };
        if let Some(assets) = entries.assets {
            assets.listener.unsubscribe();
        }
        if let Some(process) = entries.process {
            if let Some(listener) = process.listener {
                listener.unsubscribe();
            }
        }
        drop(entries.tree);
        tracing::debug!(connection_id = %self.connection_id, "resource registry cleared");
        true
    }

    pub fn is_cleared(&self) -> bool {
        self.entries.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAssets, MockTree};
    use std::time::Duration;

    fn snapshot(number: u64) -> TreeSnapshot {
        TreeSnapshot {
            tree: Arc::new(MockTree::new(json!({"n": number}))),
            number,
            hash: format!("h{number}"),
            generated: 0,
        }
    }

    fn pending_listener() -> Subscription {
        Subscription::spawn(std::future::pending())
    }

    #[test]
    fn tree_snapshot_is_overwritten() {
        let registry = ResourceRegistry::new("c1");
        assert!(registry.tree().is_none());
        assert!(registry.register(Resource::Tree(snapshot(1))));
        assert!(registry.register(Resource::Tree(snapshot(2))));
        let tree = registry.tree().unwrap();
        assert_eq!(tree.number, 2);
        assert_eq!(tree.to_json()["contents"], json!({"n": 2}));
        assert_eq!(tree.to_json()["treeNumber"], 2);
    }

    #[tokio::test]
    async fn clear_is_idempotent_and_unsubscribes() {
        let registry = ResourceRegistry::new("c1");
        let (handle, _exit) = ProcessHandle::new(Some(7));
        let assets_listener = pending_listener();
        let process_listener = pending_listener();

        registry.register(Resource::Assets(AssetEntry {
            collection: Arc::new(MockAssets::default()),
            listener: assets_listener,
        }));
        registry.register(Resource::Process(ProcessEntry {
            handle,
            listener: Some(process_listener),
        }));
        assert_eq!(registry.process().unwrap().pid(), Some(7));
        assert!(registry.assets().is_some());

        assert!(registry.clear());
        assert!(!registry.clear());
        assert!(registry.is_cleared());
        assert!(registry.assets().is_none());
        assert!(registry.process().is_none());
    }

    #[tokio::test]
    async fn registration_after_clear_is_refused() {
        let registry = ResourceRegistry::new("c1");
        registry.clear();
        assert!(!registry.register(Resource::Tree(snapshot(1))));
        assert!(registry.tree().is_none());
    }

    #[tokio::test]
    async fn detach_process_listener_keeps_handle() {
        let registry = ResourceRegistry::new("c1");
        let (handle, _exit) = ProcessHandle::new(Some(1));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let listener = Subscription::spawn(async move {
            let _keep = tx;
            std::future::pending::<()>().await;
        });
        registry.register(Resource::Process(ProcessEntry {
            handle,
            listener: Some(listener),
        }));

        assert!(registry.detach_process_listener());
        assert!(!registry.detach_process_listener());
        // The aborted listener drops its sender.
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap_err();
        assert!(registry.process().is_some());
    }
}
