//! Durable connection registry
//!
//! Every live connection is recorded in a single JSON document so a restarted
//! process can find tunnels and leases left behind by a crash. Writers are
//! serialized by an in-process mutex and an advisory lock on a sibling
//! `.lock` file, which also covers several processes sharing one document.

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use wgpool_proto::{ConnectionRecord, InventoryError, LinkInventory, WorkerId};

/// Default registry document location
pub const DEFAULT_STATE_FILE: &str = "/var/lib/wgpool/connections.json";

const DOCUMENT_VERSION: u32 = 1;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize registry document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("Registry writer lock poisoned")]
    Poisoned,
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    connections: BTreeMap<String, ConnectionRecord>,
}

impl Document {
    fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            connections: BTreeMap::new(),
        }
    }
}

/// Records cross-referenced against the live interfaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Records whose interface is live
    pub active: Vec<ConnectionRecord>,
    /// Records whose interface is gone
    pub orphaned: Vec<ConnectionRecord>,
    /// Live interfaces nothing records
    pub untracked: Vec<String>,
}

/// Counts of a [`Reconciliation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconciliationSummary {
    pub active: usize,
    pub orphaned: usize,
    pub untracked: usize,
}

impl Reconciliation {
    pub fn summary(&self) -> ReconciliationSummary {
        ReconciliationSummary {
            active: self.active.len(),
            orphaned: self.orphaned.len(),
            untracked: self.untracked.len(),
        }
    }
}

/// Persistent registry of live connections
pub struct ConnectionRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    inventory: Arc<dyn LinkInventory>,
    writer: Mutex<()>,
}

impl ConnectionRegistry {
    /// Open the registry at `path`, creating its directory if needed
    ///
    /// The document itself is created by the first write.
    pub fn open(
        path: impl Into<PathBuf>,
        inventory: Arc<dyn LinkInventory>,
    ) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = sibling(&path, ".lock");
        debug!(path = ?path, "Opened connection registry");

        Ok(Self {
            path,
            lock_path,
            inventory,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a connection, replacing any record for the same worker
    pub fn register(
        &self,
        record: ConnectionRecord,
    ) -> Result<Option<ConnectionRecord>, RegistryError> {
        let worker_id = record.worker_id.clone();
        let interface = record.interface_name.clone();

        let previous = self.update(|doc| doc.connections.insert(worker_id.to_string(), record))?;

        if previous.is_some() {
            info!(worker_id = %worker_id, interface = %interface, "Replaced connection record");
        } else {
            info!(worker_id = %worker_id, interface = %interface, "Registered connection");
        }
        Ok(previous)
    }

    /// Remove a worker's record, returning it if there was one
    pub fn unregister(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<ConnectionRecord>, RegistryError> {
        let removed = self.update(|doc| doc.connections.remove(worker_id.as_str()))?;
        if removed.is_some() {
            info!(worker_id = %worker_id, "Unregistered connection");
        }
        Ok(removed)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Result<Option<ConnectionRecord>, RegistryError> {
        let lock = self.acquire(false)?;
        let mut doc = self.read_document()?;
        drop(lock);
        Ok(doc.connections.remove(worker_id.as_str()))
    }

    /// All records, ordered by worker id
    pub fn records(&self) -> Result<Vec<ConnectionRecord>, RegistryError> {
        let lock = self.acquire(false)?;
        let doc = self.read_document()?;
        drop(lock);
        Ok(doc.connections.into_values().collect())
    }

    /// Cross-reference the records with the interfaces the kernel reports
    pub async fn reconcile(&self) -> Result<Reconciliation, RegistryError> {
        let live = self.inventory.live_interfaces().await?;
        let records = self.records()?;

        let tracked: BTreeSet<&str> = records.iter().map(|r| r.interface_name.as_str()).collect();
        let untracked = live
            .iter()
            .filter(|name| !tracked.contains(name.as_str()))
            .cloned()
            .collect();

        let (active, orphaned) = records
            .into_iter()
            .partition(|r| live.contains(&r.interface_name));

        Ok(Reconciliation {
            active,
            orphaned,
            untracked,
        })
    }

    pub async fn list_active(&self) -> Result<Vec<ConnectionRecord>, RegistryError> {
        Ok(self.reconcile().await?.active)
    }

    pub async fn list_orphaned(&self) -> Result<Vec<ConnectionRecord>, RegistryError> {
        Ok(self.reconcile().await?.orphaned)
    }

    pub async fn list_untracked(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.reconcile().await?.untracked)
    }

    /// Remove every record whose interface is gone, returning how many
    ///
    /// Records registered after the live interfaces were listed are kept.
    /// Untracked interfaces are left alone.
    pub async fn cleanup_orphaned(&self) -> Result<usize, RegistryError> {
        let snapshot_at = Utc::now();
        let live = self.inventory.live_interfaces().await?;

        let removed = self.update(|doc| {
            let mut removed = Vec::new();
            doc.connections.retain(|worker, record| {
                let orphaned =
                    record.registered_at <= snapshot_at && !live.contains(&record.interface_name);
                if orphaned {
                    removed.push((worker.clone(), record.interface_name.clone()));
                }
                !orphaned
            });
            removed
        })?;

        for (worker, interface) in &removed {
            info!(
                worker_id = %worker,
                interface = %interface,
                "Removed orphaned connection record"
            );
        }
        Ok(removed.len())
    }

    /// Read-modify-write the document under both writer locks
    fn update<T>(&self, mutate: impl FnOnce(&mut Document) -> T) -> Result<T, RegistryError> {
        let _guard = self.writer.lock().map_err(|_| RegistryError::Poisoned)?;
        let lock = self.acquire(true)?;

        let mut doc = self.read_document()?;
        let result = mutate(&mut doc);
        doc.version = DOCUMENT_VERSION;
        self.write_document(&doc)?;

        drop(lock);
        Ok(result)
    }

    /// Take the advisory file lock, released when the returned file is dropped
    fn acquire(&self, exclusive: bool) -> Result<File, RegistryError> {
        let io_error = |source: io::Error| RegistryError::Io {
            path: self.lock_path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(io_error)?;

        if exclusive {
            FileExt::lock_exclusive(&file).map_err(io_error)?;
        } else {
            FileExt::lock_shared(&file).map_err(io_error)?;
        }
        Ok(file)
    }

    fn read_document(&self) -> Result<Document, RegistryError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::empty()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_str::<Document>(&contents) {
            Ok(doc) if doc.version == DOCUMENT_VERSION => Ok(doc),
            Ok(doc) => {
                warn!(
                    path = ?self.path,
                    version = doc.version,
                    "Unsupported registry document version, treating as empty"
                );
                Ok(Document::empty())
            }
            Err(e) => {
                warn!(
                    path = ?self.path,
                    error = %e,
                    "Registry document is corrupt, treating as empty"
                );
                Ok(Document::empty())
            }
        }
    }

    /// Write to a temporary sibling, fsync, then rename over the document
    fn write_document(&self, doc: &Document) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(doc)?;
        let tmp_path = sibling(&self.path, ".tmp");
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| RegistryError::Io { path, source }
        };

        let mut file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        file.write_all(json.as_bytes())
            .map_err(io_error(&tmp_path))?;
        file.sync_all().map_err(io_error(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(io_error(&self.path))?;

        // Persist the rename itself
        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

/// `<path><suffix>`, e.g. `connections.json.lock`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_paths() {
        let path = Path::new("/var/lib/wgpool/connections.json");
        assert_eq!(
            sibling(path, ".lock"),
            PathBuf::from("/var/lib/wgpool/connections.json.lock")
        );
        assert_eq!(
            sibling(path, ".tmp"),
            PathBuf::from("/var/lib/wgpool/connections.json.tmp")
        );
    }

    #[test]
    fn test_document_layout() {
        let doc = Document::empty();
        let json: serde_json::Value = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["connections"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_missing_connections_field() {
        let doc: Document = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert!(doc.connections.is_empty());
    }
}
