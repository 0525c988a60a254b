//! Persisted device records behind a get/set/erase key-value capability.
//!
//! Everything lives under one versioned namespace so a factory reset can
//! erase it in a single call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::envelope::{PeerParseError, PeerSet};
use crate::game::GameConfig;
use crate::identity::DeviceIdentity;

/// Namespace holding every persisted record.
pub const NAMESPACE: &str = "phaser_v1";

pub const KEY_IDENTITY: &str = "identity";
pub const KEY_PEERS: &str = "peers";
pub const KEY_CONFIG: &str = "config";

#[derive(Debug)]
pub enum StorageError {
    Io(String),
    Corrupt { key: String, reason: String },
    Serialize(String),
    Peers(PeerParseError),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "storage I/O error: {e}"),
            Self::Corrupt { key, reason } => write!(f, "corrupt record {key:?}: {reason}"),
            Self::Serialize(e) => write!(f, "serialize error: {e}"),
            Self::Peers(e) => write!(f, "invalid peer list: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<PeerParseError> for StorageError {
    fn from(e: PeerParseError) -> Self {
        Self::Peers(e)
    }
}

/// Minimal persistent key-value capability.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError>;
    /// Remove every key in `namespace`.
    fn erase(&self, namespace: &str) -> Result<(), StorageError>;
}

/// In-memory store for tests and diskless hosts.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn erase(&self, namespace: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

/// Typed access to the device records.
#[derive(Clone)]
pub struct PersistedState {
    store: Arc<dyn KeyValueStore>,
}

impl PersistedState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.store.get(NAMESPACE, key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw =
            serde_json::to_string(value).map_err(|e| StorageError::Serialize(e.to_string()))?;
        self.store.set(NAMESPACE, key, &raw)
    }

    pub fn load_identity(&self) -> Result<Option<DeviceIdentity>, StorageError> {
        self.get_json(KEY_IDENTITY)
    }

    pub fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        self.set_json(KEY_IDENTITY, identity)
    }

    pub fn load_config(&self) -> Result<Option<GameConfig>, StorageError> {
        self.get_json(KEY_CONFIG)
    }

    pub fn save_config(&self, config: &GameConfig) -> Result<(), StorageError> {
        self.set_json(KEY_CONFIG, config)
    }

    /// `None` when no peer list was ever provisioned.
    pub fn load_peers(&self) -> Result<Option<PeerSet>, StorageError> {
        match self.store.get(NAMESPACE, KEY_PEERS)? {
            Some(csv) => Ok(Some(PeerSet::from_csv(&csv)?)),
            None => Ok(None),
        }
    }

    pub fn save_peers(&self, peers: &PeerSet) -> Result<(), StorageError> {
        self.store.set(NAMESPACE, KEY_PEERS, &peers.to_csv())
    }

    /// Erase identity, peers, and config.
    pub fn factory_reset(&self) -> Result<(), StorageError> {
        self.store.erase(NAMESPACE)
    }
}
