//! Rolling-window invocation cost ledger. Every `Hub FSM` cycle
//! (executing/improving/contemplating) records one `InvocationRecord` here
//! before it runs, and the Hub FSM consults `check_budget` to decide
//! whether a cycle is allowed to start at all.

use crate::config::RuntimeConfig;
use crate::models::{InvocationCategory, InvocationRecord};
use crate::storage::StorageTable;
use crate::{HubError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LedgerStats {
    pub hourly: HashMap<InvocationCategory, u64>,
    pub daily: HashMap<InvocationCategory, u64>,
    pub session: HashMap<InvocationCategory, u64>,
}

/// Durable-appends to the `ledger` table; keeps a bounded in-memory window
/// (24h) replayed from the table at startup, the same "replay the durable
/// log to rebuild in-memory state" idiom the priority index and endpoint
/// circuit-breaker counters use. Session counts are derived from the same
/// window, filtered to records newer than `session_started_at`, rather than
/// a separate counter, so a restart always starts a fresh session without
/// needing its own reset timer.
pub struct CostLedger {
    table: StorageTable,
    config: RuntimeConfig,
    records: RwLock<VecDeque<InvocationRecord>>,
    session_started_at: DateTime<Utc>,
}

impl CostLedger {
    pub async fn new(table: StorageTable, config: RuntimeConfig) -> Result<Self> {
        let cutoff = Utc::now() - Duration::days(1);
        let mut records = VecDeque::new();
        for (_, record) in table.scan().await? {
            if let Ok(entry) = decode_record(record) {
                if entry.timestamp >= cutoff {
                    records.push_back(entry);
                }
            }
        }
        Ok(Self {
            table,
            config,
            records: RwLock::new(records),
            session_started_at: Utc::now(),
        })
    }

    pub async fn record(&self, entry: InvocationRecord) -> Result<()> {
        let key = crate::models::new_id();
        self.table.put(&key, &encode_record(&entry)?).await?;
        self.records.write().await.push_back(entry);
        Ok(())
    }

    /// Drops any entry older than the 24h window and returns a snapshot of
    /// what remains.
    async fn snapshot(&self) -> Vec<InvocationRecord> {
        let cutoff = Utc::now() - Duration::days(1);
        let mut records = self.records.write().await;
        while records.front().map(|r| r.timestamp < cutoff).unwrap_or(false) {
            records.pop_front();
        }
        records.iter().cloned().collect()
    }

    pub async fn stats(&self) -> LedgerStats {
        let snapshot = self.snapshot().await;
        let hour_cutoff = Utc::now() - Duration::hours(1);
        let mut stats = LedgerStats::default();
        for entry in &snapshot {
            *stats.daily.entry(entry.category).or_insert(0) += 1;
            if entry.timestamp >= hour_cutoff {
                *stats.hourly.entry(entry.category).or_insert(0) += 1;
            }
            if entry.timestamp >= self.session_started_at {
                *stats.session.entry(entry.category).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Returns `Err(BudgetExhausted)` if `category` has already met or
    /// exceeded either its hourly or daily cap.
    pub async fn check_budget(&self, category: InvocationCategory) -> Result<()> {
        let caps = self.config.budget_caps(category);
        let stats = self.stats().await;
        let hourly = stats.hourly.get(&category).copied().unwrap_or(0);
        let daily = stats.daily.get(&category).copied().unwrap_or(0);
        if hourly >= caps.hourly || daily >= caps.daily {
            return Err(HubError::BudgetExhausted(format!("{category:?}")));
        }
        Ok(())
    }
}

fn encode_record(record: &InvocationRecord) -> Result<HashMap<String, serde_json::Value>> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => unreachable!("InvocationRecord always serializes to an object"),
    }
}

fn decode_record(record: HashMap<String, serde_json::Value>) -> Result<InvocationRecord> {
    Ok(serde_json::from_value(serde_json::Value::Object(record.into_iter().collect()))?)
}

/// Background task: logs a one-line summary of ledger pressure every
/// `HUB_TICK_INTERVAL_SECS * 60` ticks, mirroring the other components'
/// periodic-loop shape; not load-bearing, just operational visibility.
pub async fn run_periodic(ledger: Arc<CostLedger>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let stats = ledger.stats().await;
        info!("ledger stats: hourly={:?} daily={:?}", stats.hourly, stats.daily);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::storage::StorageEngine;

    async fn test_ledger() -> CostLedger {
        let bus = EventBus::new();
        let dir = tempfile::TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), bus).unwrap();
        let table = engine.open_table("ledger").await.unwrap();
        CostLedger::new(table, RuntimeConfig::from_env()).await.unwrap()
    }

    #[tokio::test]
    async fn recording_increments_all_windows() {
        let ledger = test_ledger().await;
        ledger
            .record(InvocationRecord {
                category: InvocationCategory::Executing,
                timestamp: Utc::now(),
                tokens: Some(100),
                cost: Some(0.01),
            })
            .await
            .unwrap();
        let stats = ledger.stats().await;
        assert_eq!(stats.hourly.get(&InvocationCategory::Executing), Some(&1));
        assert_eq!(stats.daily.get(&InvocationCategory::Executing), Some(&1));
        assert_eq!(stats.session.get(&InvocationCategory::Executing), Some(&1));
    }

    #[tokio::test]
    async fn old_records_fall_out_of_the_daily_window() {
        let ledger = test_ledger().await;
        ledger
            .record(InvocationRecord {
                category: InvocationCategory::Improving,
                timestamp: Utc::now() - Duration::days(2),
                tokens: None,
                cost: None,
            })
            .await
            .unwrap();
        let stats = ledger.stats().await;
        assert_eq!(stats.daily.get(&InvocationCategory::Improving), None);
    }

    #[tokio::test]
    async fn budget_exhausted_once_cap_reached() {
        let ledger = test_ledger().await;
        ledger.config.set_budget_caps(
            InvocationCategory::Contemplating,
            crate::config::BudgetCaps { hourly: 1, daily: 10 },
        );
        ledger
            .record(InvocationRecord {
                category: InvocationCategory::Contemplating,
                timestamp: Utc::now(),
                tokens: None,
                cost: None,
            })
            .await
            .unwrap();
        assert!(ledger.check_budget(InvocationCategory::Contemplating).await.is_err());
    }
}
