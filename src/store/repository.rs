use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::flow::FlowDocument;

use super::{Namespace, SettingsCipher, Store};

/// A stored setting. When `encrypted` is set, `value` holds the sealed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub encrypted: bool,
}

/// Typed access to saved flows and settings on top of any [`Store`].
#[derive(Clone)]
pub struct FlowRepository {
    store: Arc<dyn Store>,
    cipher: SettingsCipher,
}

impl FlowRepository {
    /// Uses a cipher derived from the default passphrase for encrypted settings.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cipher: SettingsCipher::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: SettingsCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Saves `flow`, keeping the creation time of an existing entry with the
    /// same id and stamping `updatedAt` with the current time.
    pub async fn save_flow(&self, mut flow: FlowDocument) -> Result<FlowDocument, StoreError> {
        let now = Utc::now().timestamp_millis();
        flow.created_at = match self.get_flow(&flow.id).await? {
            Some(existing) => existing.created_at,
            None => now,
        };
        flow.updated_at = now;

        self.store
            .put(Namespace::Flows, &flow.id, serde_json::to_value(&flow)?)
            .await?;
        tracing::debug!(flow = %flow.id, "saved flow");
        Ok(flow)
    }

    pub async fn get_flow(&self, id: &str) -> Result<Option<FlowDocument>, StoreError> {
        match self.store.get(Namespace::Flows, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn list_flows(&self) -> Result<Vec<FlowDocument>, StoreError> {
        self.store
            .list(Namespace::Flows)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    pub async fn delete_flow(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(Namespace::Flows, id).await
    }

    /// Stores `value` under `key`, sealed with the repository cipher when
    /// `encrypted` is set.
    pub async fn save_setting(
        &self,
        key: &str,
        value: &str,
        encrypted: bool,
    ) -> Result<(), StoreError> {
        let value = if encrypted {
            self.cipher.seal(value).map_err(|source| StoreError::Crypto {
                key: key.to_string(),
                source,
            })?
        } else {
            value.to_string()
        };

        let setting = Setting {
            key: key.to_string(),
            value,
            encrypted,
        };
        self.store
            .put(Namespace::Settings, key, serde_json::to_value(setting)?)
            .await
    }

    /// Returns the plain value of `key`, opening it if it was stored encrypted.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(value) = self.store.get(Namespace::Settings, key).await? else {
            return Ok(None);
        };

        let setting: Setting = serde_json::from_value(value)?;
        if !setting.encrypted {
            return Ok(Some(setting.value));
        }

        self.cipher
            .open(&setting.value)
            .map(Some)
            .map_err(|source| StoreError::Crypto {
                key: key.to_string(),
                source,
            })
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool, StoreError> {
        self.store.delete(Namespace::Settings, key).await
    }

    /// Wipes every flow and setting.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        for namespace in Namespace::ALL {
            self.store.clear(namespace).await?;
        }
        Ok(())
    }
}
