//! Explicit application context shared by sync components.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use storekeep_common::{Error, Result, SettingsDocument};
use storekeep_storage::{keys, StateStore, TableStore};

use crate::config::SyncConfig;
use crate::state::SyncState;

/// Settings, persisted bookkeeping and observable sync state.
///
/// Built once at startup and handed to every component that needs it.
pub struct SyncContext {
    config: SyncConfig,
    store: Arc<dyn StateStore>,
    tables: Arc<dyn TableStore>,
    state: watch::Sender<SyncState>,
}

impl SyncContext {
    /// Create a context, restoring `dirty` and `last_synced` from the store.
    pub async fn load(
        config: SyncConfig,
        store: Arc<dyn StateStore>,
        tables: Arc<dyn TableStore>,
    ) -> Result<Self> {
        let mut initial = SyncState::new();
        initial.dirty = matches!(store.get(keys::SETTINGS_DIRTY).await?.as_deref(), Some("true"));
        initial.last_synced = read_timestamp(store.as_ref()).await?;

        let (state, _) = watch::channel(initial);
        Ok(Self {
            config,
            store,
            tables,
            state,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn tables(&self) -> &Arc<dyn TableStore> {
        &self.tables
    }

    /// Stored settings, or defaults on first run.
    pub async fn load_settings(&self) -> Result<SettingsDocument> {
        match self.store.get(keys::SETTINGS).await? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::Serialization(format!("Stored settings are corrupt: {}", e))),
            None => Ok(SettingsDocument::default()),
        }
    }

    pub async fn save_settings(&self, doc: &SettingsDocument) -> Result<()> {
        let json = serde_json::to_string(doc)?;
        self.store.set(keys::SETTINGS, &json).await
    }

    /// Persist the dirty flag, then publish it.
    pub async fn set_dirty(&self, dirty: bool) -> Result<()> {
        let value = if dirty { "true" } else { "false" };
        self.store.set(keys::SETTINGS_DIRTY, value).await?;
        self.update_state(|s| s.dirty = dirty);
        Ok(())
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        Ok(matches!(
            self.store.get(keys::SETTINGS_DIRTY).await?.as_deref(),
            Some("true")
        ))
    }

    pub async fn last_synced(&self) -> Result<Option<DateTime<Utc>>> {
        read_timestamp(self.store.as_ref()).await
    }

    pub async fn set_last_synced(&self, at: DateTime<Utc>) -> Result<()> {
        self.store
            .set(keys::LAST_SYNCED_TIMESTAMP, &at.to_rfc3339())
            .await?;
        self.update_state(|s| s.last_synced = Some(at));
        Ok(())
    }

    pub async fn clear_last_synced(&self) -> Result<()> {
        self.store.remove(keys::LAST_SYNCED_TIMESTAMP).await?;
        self.update_state(|s| s.last_synced = None);
        Ok(())
    }

    /// Whether a user session token is stored.
    pub async fn has_session(&self) -> Result<bool> {
        Ok(self
            .store
            .get(keys::AUTH_TOKEN)
            .await?
            .is_some_and(|t| !t.is_empty()))
    }

    /// Current sync state.
    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn update_state(&self, f: impl FnOnce(&mut SyncState)) {
        self.state.send_modify(f);
    }
}

async fn read_timestamp(store: &dyn StateStore) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = store.get(keys::LAST_SYNCED_TIMESTAMP).await? else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(at) => Ok(Some(at.with_timezone(&Utc))),
        Err(e) => {
            warn!(value = %raw, "Ignoring unparsable last sync timestamp: {}", e);
            Ok(None)
        }
    }
}
