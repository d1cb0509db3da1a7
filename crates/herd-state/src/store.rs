//! StateStore — redb-backed persistence for the herd.
//!
//! Provides typed operations over images, MDB entries and settings. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use herd_core::{Image, MdbEntry};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::Record;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

fn encode<T: Serialize>(record: Record, key: &str, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Encode {
        record,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(record: Record, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        record,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(StateError::database)?;
        for record in Record::ALL {
            txn.open_table(record.table()).map_err(StateError::database)?;
        }
        txn.commit().map_err(StateError::database)
    }

    fn put<T: Serialize>(&self, record: Record, key: &str, value: &T) -> StateResult<()> {
        let value = encode(record, key, value)?;
        let txn = self.db.begin_write().map_err(StateError::database)?;
        {
            let mut table = txn.open_table(record.table()).map_err(StateError::database)?;
            table
                .insert(key, value.as_slice())
                .map_err(StateError::database)?;
        }
        txn.commit().map_err(StateError::database)
    }

    fn get<T: DeserializeOwned>(&self, record: Record, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(StateError::database)?;
        let table = txn.open_table(record.table()).map_err(StateError::database)?;
        match table.get(key).map_err(StateError::database)? {
            Some(guard) => Ok(Some(decode(record, key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, record: Record) -> StateResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(StateError::database)?;
        let table = txn.open_table(record.table()).map_err(StateError::database)?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(StateError::database)? {
            let (key, value) = entry.map_err(StateError::database)?;
            let key = key.value().to_string();
            let value = decode(record, &key, value.value())?;
            results.push((key, value));
        }
        Ok(results)
    }

    fn keys(&self, record: Record) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(StateError::database)?;
        let table = txn.open_table(record.table()).map_err(StateError::database)?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(StateError::database)? {
            let (key, _) = entry.map_err(StateError::database)?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn delete(&self, record: Record, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::database)?;
        let existed = {
            let mut table = txn.open_table(record.table()).map_err(StateError::database)?;
            table.remove(key).map_err(StateError::database)?.is_some()
        };
        txn.commit().map_err(StateError::database)?;
        Ok(existed)
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Store a new image. Images are immutable, so an existing name is an error.
    pub fn add_image(&self, name: &str, image: &Image) -> StateResult<()> {
        let value = encode(Record::Image, name, image)?;
        let txn = self.db.begin_write().map_err(StateError::database)?;
        {
            let mut table = txn
                .open_table(Record::Image.table())
                .map_err(StateError::database)?;
            if table.get(name).map_err(StateError::database)?.is_some() {
                return Err(StateError::ImageExists(name.to_string()));
            }
            table
                .insert(name, value.as_slice())
                .map_err(StateError::database)?;
        }
        txn.commit().map_err(StateError::database)?;
        debug!(image = %name, "image stored");
        Ok(())
    }

    pub fn get_image(&self, name: &str) -> StateResult<Option<Image>> {
        self.get(Record::Image, name)
    }

    /// Names of all stored images, sorted.
    pub fn list_image_names(&self) -> StateResult<Vec<String>> {
        self.keys(Record::Image)
    }

    pub fn delete_image(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(Record::Image, name)?;
        debug!(image = %name, existed, "image deleted");
        Ok(existed)
    }

    // ── MDB ────────────────────────────────────────────────────────

    pub fn put_mdb_entry(&self, entry: &MdbEntry) -> StateResult<()> {
        self.put(Record::MdbEntry, &entry.hostname, entry)?;
        debug!(sub = %entry.hostname, "mdb entry stored");
        Ok(())
    }

    pub fn get_mdb_entry(&self, hostname: &str) -> StateResult<Option<MdbEntry>> {
        self.get(Record::MdbEntry, hostname)
    }

    pub fn list_mdb(&self) -> StateResult<Vec<MdbEntry>> {
        Ok(self
            .list::<MdbEntry>(Record::MdbEntry)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    pub fn delete_mdb_entry(&self, hostname: &str) -> StateResult<bool> {
        self.delete(Record::MdbEntry, hostname)
    }

    /// Replace the whole MDB with `entries` in one transaction.
    pub fn replace_mdb(&self, entries: &[MdbEntry]) -> StateResult<()> {
        let encoded = entries
            .iter()
            .map(|entry| Ok((entry.hostname.as_str(), encode(Record::MdbEntry, &entry.hostname, entry)?)))
            .collect::<StateResult<Vec<_>>>()?;
        let stale = self.keys(Record::MdbEntry)?;
        let txn = self.db.begin_write().map_err(StateError::database)?;
        {
            let mut table = txn
                .open_table(Record::MdbEntry.table())
                .map_err(StateError::database)?;
            for key in &stale {
                table.remove(key.as_str()).map_err(StateError::database)?;
            }
            for (hostname, value) in &encoded {
                table
                    .insert(*hostname, value.as_slice())
                    .map_err(StateError::database)?;
            }
        }
        txn.commit().map_err(StateError::database)?;
        debug!(count = entries.len(), removed = stale.len(), "mdb replaced");
        Ok(())
    }

    // ── Settings ───────────────────────────────────────────────────

    pub fn get_settings(&self) -> StateResult<HerdSettings> {
        Ok(self.get(Record::Settings, SETTINGS_KEY)?.unwrap_or_default())
    }

    pub fn put_settings(&self, settings: &HerdSettings) -> StateResult<()> {
        self.put(Record::Settings, SETTINGS_KEY, settings)
    }
}
