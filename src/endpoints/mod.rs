//! Durable endpoint list plus an in-memory status/resource map.
//!
//! The two-consecutive-result debounce for health transitions is a
//! three-state open/closed/half-open circuit breaker collapsed down to
//! healthy/unhealthy/unknown with a fixed debounce count instead of a
//! failure-threshold/cooldown.

use crate::bus::{Event, EventBus};
use crate::config::RuntimeConfig;
use crate::constants::ENDPOINT_HEALTH_DEBOUNCE_COUNT;
use crate::models::{EndpointId, EndpointRecord, EndpointSource, EndpointStatus, EndpointView, ResourceSnapshot};
use crate::storage::StorageTable;
use crate::{HubError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct EndpointState {
    status: RwLock<EndpointStatus>,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
    resources: RwLock<ResourceSnapshot>,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            status: RwLock::new(EndpointStatus::Unknown),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            resources: RwLock::new(ResourceSnapshot::default()),
        }
    }
}

pub struct EndpointRegistry {
    table: StorageTable,
    states: Arc<RwLock<HashMap<EndpointId, Arc<EndpointState>>>>,
    bus: EventBus,
    http: reqwest::Client,
}

impl EndpointRegistry {
    pub async fn new(table: StorageTable, bus: EventBus) -> Result<Self> {
        let states = Arc::new(RwLock::new(HashMap::new()));
        for (id, _) in table.scan().await? {
            states.write().await.insert(id, Arc::new(EndpointState::new()));
        }
        Ok(Self {
            table,
            states,
            bus,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        })
    }

    pub async fn register(&self, host: String, port: u16, source: EndpointSource) -> Result<EndpointRecord> {
        let id = format!("{host}:{port}");
        let record = EndpointRecord {
            id: id.clone(),
            host,
            port,
            source,
            models: Vec::new(),
        };
        let value = serde_json::to_value(&record)?;
        let map = match value {
            serde_json::Value::Object(m) => m.into_iter().collect(),
            _ => unreachable!(),
        };
        self.table.put(&id, &map).await?;
        self.states.write().await.insert(id, Arc::new(EndpointState::new()));
        Ok(record)
    }

    async fn record(&self, id: &str) -> Result<EndpointRecord> {
        let raw = self
            .table
            .get(id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("endpoint {id}")))?;
        let value = serde_json::Value::Object(raw.into_iter().collect());
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_endpoints(&self) -> Result<Vec<EndpointView>> {
        let mut out = Vec::new();
        for (id, _) in self.table.scan().await? {
            let record = self.record(&id).await?;
            let state = self.state_for(&id).await;
            out.push(EndpointView {
                record,
                status: *state.status.read().await,
                resources: state.resources.read().await.clone(),
            });
        }
        Ok(out)
    }

    pub async fn get_resources(&self, id: &str) -> Option<ResourceSnapshot> {
        let states = self.states.read().await;
        match states.get(id) {
            Some(state) => Some(state.resources.read().await.clone()),
            None => None,
        }
    }

    /// Agents push periodic resource snapshots for their home endpoint.
    /// Process-memory only, never persisted.
    pub async fn push_resource_snapshot(&self, id: &str, snapshot: ResourceSnapshot) {
        let state = self.state_for(id).await;
        let mut current = state.resources.write().await;
        *current = snapshot;
        current.last_updated = Some(chrono::Utc::now());
    }

    async fn state_for(&self, id: &str) -> Arc<EndpointState> {
        if let Some(s) = self.states.read().await.get(id) {
            return s.clone();
        }
        let mut states = self.states.write().await;
        states
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(EndpointState::new()))
            .clone()
    }

    /// Probes every known endpoint's model-listing surface. Two consecutive
    /// same-polarity results are required to transition status.
    pub async fn probe_all(&self) {
        let ids: Vec<String> = self.table.scan().await.map(|r| r.into_iter().map(|(k, _)| k).collect()).unwrap_or_default();
        for id in ids {
            self.probe_one(&id).await;
        }
    }

    async fn probe_one(&self, id: &str) {
        let Ok(record) = self.record(id).await else {
            return;
        };
        let state = self.state_for(id).await;
        let url = format!("http://{}:{}/api/tags", record.host, record.port);

        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let models = parse_model_names(resp.json::<serde_json::Value>().await.ok());
                let mut updated = record;
                updated.models = models;
                if let Ok(value) = serde_json::to_value(&updated) {
                    if let serde_json::Value::Object(map) = value {
                        let _ = self.table.put(id, &map.into_iter().collect()).await;
                    }
                }
                self.record_success(id, &state).await;
            }
            _ => self.record_failure(id, &state).await,
        }
    }

    async fn record_success(&self, id: &str, state: &EndpointState) {
        state.consecutive_failures.store(0, Ordering::Relaxed);
        let count = state.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= ENDPOINT_HEALTH_DEBOUNCE_COUNT {
            let mut status = state.status.write().await;
            if *status != EndpointStatus::Healthy {
                *status = EndpointStatus::Healthy;
                info!("endpoint {} now healthy", id);
                self.bus.publish(Event::EndpointChanged { endpoint_id: id.to_string() });
            }
        }
    }

    async fn record_failure(&self, id: &str, state: &EndpointState) {
        state.consecutive_successes.store(0, Ordering::Relaxed);
        let count = state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= ENDPOINT_HEALTH_DEBOUNCE_COUNT {
            let mut status = state.status.write().await;
            if *status != EndpointStatus::Unhealthy {
                *status = EndpointStatus::Unhealthy;
                warn!("endpoint {} now unhealthy", id);
                self.bus.publish(Event::EndpointChanged { endpoint_id: id.to_string() });
            }
        }
    }
}

fn parse_model_names(body: Option<serde_json::Value>) -> Vec<String> {
    let Some(body) = body else { return Vec::new() };
    body.get("models")
        .and_then(|m| m.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Background task: probes at `probe_interval_ms`, re-read from config on
/// every iteration rather than cached once at startup.
pub async fn run_periodic(registry: Arc<EndpointRegistry>, config: RuntimeConfig) {
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(config.probe_interval_ms())).await;
        registry.probe_all().await;
    }
}
