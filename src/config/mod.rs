//! Startup configuration loading plus the hot-reloadable `RuntimeConfig`
//! handle threaded through every component that owns a timer or a tunable
//! threshold. Every `RuntimeConfig` getter re-reads its backing `RwLock` on
//! each call rather than caching a value at construction time, so an
//! operator can retune a running hub via the admin API without a restart.

#[cfg(test)]
mod tests;

use crate::models::InvocationCategory;
use crate::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Static settings resolved once at startup: bind address, data directory,
/// CORS origins, the admin bearer token. None of these are hot-reloadable,
/// so they live outside `RuntimeConfig`.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub data_dir: PathBuf,
    pub admin_api_key: String,
    pub allowed_origins: Vec<String>,
}

/// Per-category hourly/daily spend caps consulted by the Cost Ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub hourly: u64,
    pub daily: u64,
}

#[derive(Debug, Clone)]
struct ConfigValues {
    heartbeat_interval_ms: u64,
    agent_ttl_ms: u64,
    acceptance_timeout_ms: u64,
    disconnect_grace_ms: u64,
    task_ttl_ms: u64,
    fallback_wait_ms: u64,
    tier_down_alert_threshold_ms: u64,
    probe_interval_ms: u64,
    compaction_interval_ms: u64,
    compaction_threshold: f64,
    default_ollama_model: String,
    budgets: HashMap<InvocationCategory, BudgetCaps>,
}

impl ConfigValues {
    fn from_env() -> Self {
        Self {
            heartbeat_interval_ms: env_u64("HEARTBEAT_INTERVAL_MS", crate::constants::DEFAULT_HEARTBEAT_INTERVAL_MS),
            agent_ttl_ms: env_u64("AGENT_TTL_MS", crate::constants::DEFAULT_AGENT_TTL_MS),
            acceptance_timeout_ms: env_u64("ACCEPTANCE_TIMEOUT_MS", crate::constants::DEFAULT_ACCEPTANCE_TIMEOUT_MS),
            disconnect_grace_ms: env_u64("DISCONNECT_GRACE_MS", crate::constants::DEFAULT_DISCONNECT_GRACE_MS),
            task_ttl_ms: env_u64("TASK_TTL_MS", crate::constants::DEFAULT_TASK_TTL_MS),
            fallback_wait_ms: env_u64("FALLBACK_WAIT_MS", crate::constants::DEFAULT_FALLBACK_WAIT_MS),
            tier_down_alert_threshold_ms: env_u64(
                "TIER_DOWN_ALERT_THRESHOLD_MS",
                crate::constants::DEFAULT_TIER_DOWN_ALERT_THRESHOLD_MS,
            ),
            probe_interval_ms: env_u64("PROBE_INTERVAL_MS", crate::constants::DEFAULT_PROBE_INTERVAL_MS),
            compaction_interval_ms: env_u64("COMPACTION_INTERVAL_MS", crate::constants::DEFAULT_COMPACTION_INTERVAL_MS),
            compaction_threshold: env_f64("COMPACTION_THRESHOLD", crate::constants::DEFAULT_COMPACTION_THRESHOLD),
            default_ollama_model: std::env::var("DEFAULT_OLLAMA_MODEL")
                .unwrap_or_else(|_| crate::constants::DEFAULT_OLLAMA_MODEL.to_string()),
            budgets: default_budgets(),
        }
    }
}

fn default_budgets() -> HashMap<InvocationCategory, BudgetCaps> {
    let mut budgets = HashMap::new();
    budgets.insert(
        InvocationCategory::Executing,
        BudgetCaps {
            hourly: env_u64("BUDGET_EXECUTING_HOURLY", 200),
            daily: env_u64("BUDGET_EXECUTING_DAILY", 2_000),
        },
    );
    budgets.insert(
        InvocationCategory::Improving,
        BudgetCaps {
            hourly: env_u64("BUDGET_IMPROVING_HOURLY", 50),
            daily: env_u64("BUDGET_IMPROVING_DAILY", 500),
        },
    );
    budgets.insert(
        InvocationCategory::Contemplating,
        BudgetCaps {
            hourly: env_u64("BUDGET_CONTEMPLATING_HOURLY", 30),
            daily: env_u64("BUDGET_CONTEMPLATING_DAILY", 300),
        },
    );
    budgets
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Cheap `Arc`-backed handle, cloned into every component that reads a
/// hot-reloadable timer or threshold. `reload()`/`set_*` mutate the shared
/// cell in place so already-cloned handles observe the update immediately.
#[derive(Clone)]
pub struct RuntimeConfig {
    inner: Arc<RwLock<ConfigValues>>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConfigValues::from_env())),
        }
    }

    /// Re-reads every hot-reloadable value from the process environment,
    /// discarding any values set via `set_*` that weren't also exported.
    pub fn reload_from_env(&self) {
        *self.inner.write().unwrap() = ConfigValues::from_env();
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.inner.read().unwrap().heartbeat_interval_ms
    }

    pub fn agent_ttl_ms(&self) -> u64 {
        self.inner.read().unwrap().agent_ttl_ms
    }

    pub fn acceptance_timeout_ms(&self) -> u64 {
        self.inner.read().unwrap().acceptance_timeout_ms
    }

    pub fn disconnect_grace_ms(&self) -> u64 {
        self.inner.read().unwrap().disconnect_grace_ms
    }

    pub fn task_ttl_ms(&self) -> u64 {
        self.inner.read().unwrap().task_ttl_ms
    }

    pub fn fallback_wait_ms(&self) -> u64 {
        self.inner.read().unwrap().fallback_wait_ms
    }

    pub fn tier_down_alert_threshold_ms(&self) -> u64 {
        self.inner.read().unwrap().tier_down_alert_threshold_ms
    }

    pub fn probe_interval_ms(&self) -> u64 {
        self.inner.read().unwrap().probe_interval_ms
    }

    pub fn compaction_interval_ms(&self) -> u64 {
        self.inner.read().unwrap().compaction_interval_ms
    }

    pub fn compaction_threshold(&self) -> f64 {
        self.inner.read().unwrap().compaction_threshold
    }

    pub fn default_ollama_model(&self) -> String {
        self.inner.read().unwrap().default_ollama_model.clone()
    }

    pub fn budget_caps(&self, category: InvocationCategory) -> BudgetCaps {
        self.inner
            .read()
            .unwrap()
            .budgets
            .get(&category)
            .copied()
            .unwrap_or(BudgetCaps { hourly: u64::MAX, daily: u64::MAX })
    }

    pub fn set_task_ttl_ms(&self, value: u64) {
        self.inner.write().unwrap().task_ttl_ms = value;
    }

    pub fn set_fallback_wait_ms(&self, value: u64) {
        self.inner.write().unwrap().fallback_wait_ms = value;
    }

    pub fn set_default_ollama_model(&self, model: String) {
        self.inner.write().unwrap().default_ollama_model = model;
    }

    pub fn set_budget_caps(&self, category: InvocationCategory, caps: BudgetCaps) {
        self.inner.write().unwrap().budgets.insert(category, caps);
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Loads the static, non-hot-reloadable settings and validates required
/// secrets: fail fast on a missing admin key rather than starting
/// unauthenticated.
pub fn load_static_config() -> Result<StaticConfig> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::info!("loaded .env file from {:?}", path),
        Err(_) => tracing::debug!("no .env file found, using process environment only"),
    }

    let admin_api_key = std::env::var("HUB_ADMIN_API_KEY")
        .map_err(|_| HubError::Configuration("HUB_ADMIN_API_KEY environment variable is required".to_string()))?;
    if admin_api_key.trim().len() < 32 {
        return Err(HubError::Configuration(
            "HUB_ADMIN_API_KEY must be at least 32 characters".to_string(),
        ));
    }

    let bind_host = std::env::var("HUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let bind_port = std::env::var("HUB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(7100);
    let data_dir = std::env::var("HUB_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    let allowed_origins = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(StaticConfig {
        bind_host,
        bind_port,
        data_dir,
        admin_api_key,
        allowed_origins,
    })
}
