use super::health::{fragmentation_ratio, TableHealth, TableStatus};
use crate::bus::{Event, EventBus};
use crate::{HubError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

pub type Record = HashMap<String, serde_json::Value>;

/// A single named table. Wraps a `sled::Tree` behind an `RwLock` so that
/// compaction and restore — which both replace the tree's contents wholesale
/// — can briefly exclude readers/writers without tearing down the whole
/// engine — a reader must never observe a half-applied state.
pub struct Table {
    pub name: String,
    inner: Arc<RwLock<sled::Tree>>,
    /// Count of records ever written, used to compute fragmentation even
    /// though sled reclaims space on delete/overwrite automatically.
    ever_written: Arc<AtomicU64>,
    bus: EventBus,
}

impl Clone for Table {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
            ever_written: self.ever_written.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl Table {
    pub fn new(name: String, tree: sled::Tree, bus: EventBus) -> Self {
        let ever_written = tree.len() as u64;
        Self {
            name,
            inner: Arc::new(RwLock::new(tree)),
            ever_written: Arc::new(AtomicU64::new(ever_written)),
            bus,
        }
    }

    /// Maps a raw `sled::Error` into this table's `Result`, escalating a
    /// `Corruption` variant into `HubError::TableCorrupted` and publishing
    /// `corruption_detected` so the storage engine's recovery watcher and
    /// the Hub FSM's healing transition both observe it: any write or read
    /// that returns a "table corrupted" error triggers a corruption event.
    fn map_err(&self, err: sled::Error) -> HubError {
        if matches!(err, sled::Error::Corruption { .. }) {
            error!("table {} reported corruption: {}", self.name, err);
            self.bus.publish(Event::CorruptionDetected { table: self.name.clone() });
            HubError::TableCorrupted { table: self.name.clone() }
        } else {
            HubError::Storage(err)
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        let tree = self.inner.read().await;
        match tree.get(key.as_bytes()).map_err(|e| self.map_err(e))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &Record) -> Result<()> {
        let tree = self.inner.read().await;
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key.as_bytes(), bytes).map_err(|e| self.map_err(e))?;
        self.ever_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let tree = self.inner.read().await;
        tree.remove(key.as_bytes()).map_err(|e| self.map_err(e))?;
        Ok(())
    }

    /// Eagerly materialized scan — tables in this engine are small enough
    /// (thousands, not millions, of tasks/agents/endpoints) that a `Vec` is
    /// simpler than a true lazy iterator over an `RwLockReadGuard`.
    pub async fn scan(&self) -> Result<Vec<(String, Record)>> {
        let tree = self.inner.read().await;
        let mut out = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (k, v) = entry.map_err(|e| self.map_err(e))?;
            let key = String::from_utf8_lossy(&k).to_string();
            let value: Record = serde_json::from_slice(&v)?;
            out.push((key, value));
        }
        Ok(out)
    }

    pub async fn sync(&self) -> Result<()> {
        let tree = self.inner.read().await;
        tree.flush_async().await.map_err(|e| self.map_err(e))?;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Rewrites the table in place: reads every live record, clears the
    /// tree, reinserts them. Readers/writers are excluded for the duration
    /// by the write lock, and since the records are held in memory before
    /// the clear, no committed record can be lost by a mid-compaction crash
    /// recovering into the last `sync`ed state.
    pub async fn compact(&self) -> Result<()> {
        let tree = self.inner.write().await;
        let mut all = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (k, v) = entry.map_err(|e| self.map_err(e))?;
            all.push((k, v));
        }
        tree.clear().map_err(|e| self.map_err(e))?;
        for (k, v) in &all {
            tree.insert(k, v.clone()).map_err(|e| self.map_err(e))?;
        }
        tree.flush_async().await.map_err(|e| self.map_err(e))?;
        self.ever_written.store(all.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn health(&self) -> Result<TableHealth> {
        let tree = self.inner.read().await;
        let record_count = tree.len() as u64;
        let ever_written = self.ever_written.load(Ordering::Relaxed).max(record_count);
        Ok(TableHealth {
            record_count,
            file_size_bytes: 0,
            fragmentation_ratio: fragmentation_ratio(record_count, ever_written),
            status: TableStatus::Healthy,
        })
    }

    /// Replaces this table's entire contents, used by `restore`. Returns the
    /// number of records installed, or an error if any entry fails to decode
    /// (treated by the caller as restore-verification failure).
    pub async fn replace_all(&self, records: Vec<(String, Record)>) -> Result<usize> {
        let tree = self.inner.write().await;
        tree.clear().map_err(|e| self.map_err(e))?;
        for (k, v) in &records {
            let bytes = serde_json::to_vec(v).map_err(HubError::from)?;
            tree.insert(k.as_bytes(), bytes).map_err(|e| self.map_err(e))?;
        }
        tree.flush_async().await.map_err(|e| self.map_err(e))?;
        self.ever_written.store(records.len() as u64, Ordering::Relaxed);
        Ok(tree.len())
    }

    /// Drops every record, leaving an empty-but-open table (degraded mode).
    pub async fn clear_degraded(&self) -> Result<()> {
        let tree = self.inner.write().await;
        tree.clear().map_err(|e| self.map_err(e))?;
        self.ever_written.store(0, Ordering::Relaxed);
        Ok(())
    }
}
