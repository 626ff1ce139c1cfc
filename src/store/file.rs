use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use crate::error::StoreError;

use super::{Namespace, Store};

/// One pretty-printed JSON file per entry under `<root>/<namespace>/<key>.json`.
///
/// The store is usable between [`FileStore::open`] and [`FileStore::shutdown`];
/// afterwards every operation fails with [`StoreError::NotOpen`].
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    open: AtomicBool,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for namespace in Namespace::ALL {
            fs::create_dir_all(root.join(namespace.as_str())).await?;
        }
        tracing::debug!(root = %root.display(), "opened file store");

        Ok(Self {
            root,
            open: AtomicBool::new(true),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(root = %self.root.display(), "file store shut down");
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::NotOpen)
        }
    }

    fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    fn entry_path(&self, namespace: Namespace, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains(['/', '\\'])
            && !key.contains("..");
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        Ok(self.namespace_dir(namespace).join(format!("{key}.json")))
    }

    async fn json_files(&self, namespace: Namespace) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = fs::read_dir(self.namespace_dir(namespace)).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        let path = self.entry_path(namespace, key)?;

        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn put(&self, namespace: Namespace, key: &str, value: Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        let path = self.entry_path(namespace, key)?;
        let staging = path.with_extension("json.tmp");

        fs::write(&staging, serde_json::to_vec_pretty(&value)?).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let path = self.entry_path(namespace, key)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<Value>, StoreError> {
        self.ensure_open()?;

        let mut values = Vec::new();
        for path in self.json_files(namespace).await? {
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(value) => values.push(value),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable entry");
                }
            }
        }
        Ok(values)
    }

    async fn clear(&self, namespace: Namespace) -> Result<usize, StoreError> {
        self.ensure_open()?;

        let paths = self.json_files(namespace).await?;
        for path in &paths {
            fs::remove_file(path).await?;
        }
        Ok(paths.len())
    }
}
