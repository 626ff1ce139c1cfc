//! Persistence for flows and settings.
//!
//! The engine never touches storage itself; callers load a [`FlowDocument`]
//! through a [`FlowRepository`], run its graph and save it back.
//!
//! [`FlowDocument`]: crate::flow::FlowDocument

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;

mod crypto;
mod file;
mod repository;

pub use crypto::SettingsCipher;
pub use file::FileStore;
pub use repository::{FlowRepository, Setting};

/// Independent key spaces of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Settings,
    Flows,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Settings, Namespace::Flows];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Settings => "settings",
            Namespace::Flows => "flows",
        }
    }
}

/// Key/value persistence for opaque JSON documents.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, namespace: Namespace, key: &str, value: Value) -> Result<(), StoreError>;

    /// Returns whether an entry was removed.
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError>;

    /// All values in `namespace`, ordered by key.
    async fn list(&self, namespace: Namespace) -> Result<Vec<Value>, StoreError>;

    /// Removes every entry in `namespace` and returns how many there were.
    async fn clear(&self, namespace: Namespace) -> Result<usize, StoreError>;
}

/// Process-local store, mostly for tests and ephemeral servers.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<Namespace, BTreeMap<String, Value>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&namespace)
            .and_then(|space| space.get(key))
            .cloned())
    }

    async fn put(&self, namespace: Namespace, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(namespace)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .get_mut(&namespace)
            .map(|space| space.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<Value>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&namespace)
            .map(|space| space.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: Namespace) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(&namespace).map(|space| space.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = MemoryStore::new();

        store.put(Namespace::Settings, "k", json!("settings")).await.unwrap();
        store.put(Namespace::Flows, "k", json!("flows")).await.unwrap();

        assert_eq!(store.get(Namespace::Settings, "k").await.unwrap(), Some(json!("settings")));
        assert_eq!(store.get(Namespace::Flows, "k").await.unwrap(), Some(json!("flows")));

        assert_eq!(store.clear(Namespace::Settings).await.unwrap(), 1);
        assert_eq!(store.get(Namespace::Settings, "k").await.unwrap(), None);
        assert_eq!(store.list(Namespace::Flows).await.unwrap(), vec![json!("flows")]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryStore::new();
        store.put(Namespace::Flows, "a", json!(1)).await.unwrap();

        assert!(store.delete(Namespace::Flows, "a").await.unwrap());
        assert!(!store.delete(Namespace::Flows, "a").await.unwrap());
        assert!(!store.delete(Namespace::Settings, "a").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_ordered_by_key() {
        let store = MemoryStore::new();
        store.put(Namespace::Flows, "b", json!("second")).await.unwrap();
        store.put(Namespace::Flows, "a", json!("first")).await.unwrap();

        assert_eq!(
            store.list(Namespace::Flows).await.unwrap(),
            vec![json!("first"), json!("second")]
        );
    }
}
