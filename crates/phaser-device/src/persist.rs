//! File-backed key-value storage for host builds.
//!
//! The whole store is one TOML document with a table per namespace. Every
//! write rewrites the document through a temp file and a rename, so a crash
//! leaves either the old or the new contents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use phaser_core::storage::{KeyValueStore, StorageError};

type Document = BTreeMap<String, BTreeMap<String, String>>;

pub struct FileStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|e| StorageError::Corrupt {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::new(),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        tracing::debug!(path = %path.display(), "opened state file");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, doc: &Document) -> Result<(), StorageError> {
        let content = toml::to_string(doc).map_err(|e| StorageError::Serialize(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::Io(e.to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(doc.get(namespace).and_then(|table| table.get(key)).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = doc.clone();
        next.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.flush(&next)?;
        *doc = next;
        Ok(())
    }

    fn erase(&self, namespace: &str) -> Result<(), StorageError> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        if !doc.contains_key(namespace) {
            return Ok(());
        }
        let mut next = doc.clone();
        next.remove(namespace);
        self.flush(&next)?;
        *doc = next;
        Ok(())
    }
}
