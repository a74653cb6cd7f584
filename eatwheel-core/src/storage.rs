//! Device-local key-value persistence.
//!
//! Two fixed keys, mirroring what a browser keeps in local storage:
//! - [`CONNECTIONS_KEY`] — JSON array of every joined room
//! - [`PEER_ID_KEY`]     — the device's persistent network identity
//!
//! Backends only move bytes. Encoding lives in [`StorageExt`] so every backend
//! shares one layout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use crate::model::{Connection, PeerId};

pub const CONNECTIONS_KEY: &str = "connections";
pub const PEER_ID_KEY: &str = "peer-id";

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage is read-only")]
    ReadOnly,
}

/// Raw byte storage keyed by string.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// Typed accessors for the persisted layout.
pub trait StorageExt: Storage {
    /// Load every joined room. A missing key is an empty list.
    fn load_connections(&self) -> Result<Vec<Connection>, StoreError> {
        match self.get(CONNECTIONS_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn save_connections(&self, connections: &[Connection]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(connections)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(CONNECTIONS_KEY, &bytes)
    }

    fn load_peer_id(&self) -> Result<Option<PeerId>, StoreError> {
        match self.get(PEER_ID_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn save_peer_id(&self, peer_id: &str) -> Result<(), StoreError> {
        self.put(PEER_ID_KEY, peer_id.as_bytes())
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

/// In-memory storage, shared by reference between sessions of one device.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::ReadOnly);
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
