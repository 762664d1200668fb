//! Registry of connected agents. Owns one `AgentStateMachine`
//! per agent, the durable `agents` table, and the acceptance-timer/
//! liveness-sweeper background machinery that drives agents between states.

use super::state_machine::AgentStateMachine;
use crate::bus::{Event, EventBus};
use crate::config::RuntimeConfig;
use crate::models::{Agent, AgentFsmState, AgentId, TaskId};
use crate::storage::StorageTable;
use crate::tasks::TaskQueue;
use crate::{HubError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct PresenceRegistry {
    table: StorageTable,
    agents: Arc<RwLock<HashMap<AgentId, Arc<AgentStateMachine>>>>,
    acceptance_timers: Arc<RwLock<HashMap<TaskId, JoinHandle<()>>>>,
    disconnect_timers: Arc<RwLock<HashMap<AgentId, JoinHandle<()>>>>,
    bus: EventBus,
}

impl PresenceRegistry {
    /// Loads any durable agent records, restoring them as `offline` — a
    /// process restart always starts agents disconnected; they re-identify
    /// over a fresh WebSocket session to come back online.
    pub async fn new(table: StorageTable, bus: EventBus) -> Result<Self> {
        let registry = Self {
            table,
            agents: Arc::new(RwLock::new(HashMap::new())),
            acceptance_timers: Arc::new(RwLock::new(HashMap::new())),
            disconnect_timers: Arc::new(RwLock::new(HashMap::new())),
            bus,
        };

        for (_, record) in registry.table.scan().await? {
            if let Ok(mut agent) = serde_json::from_value::<Agent>(serde_json::Value::Object(
                record.into_iter().collect(),
            )) {
                agent.state = AgentFsmState::Offline;
                agent.current_task_id = None;
                let id = agent.agent_id.clone();
                registry
                    .agents
                    .write()
                    .await
                    .insert(id, Arc::new(AgentStateMachine::new(agent)));
            }
        }
        Ok(registry)
    }

    async fn persist(&self, agent: &Agent) -> Result<()> {
        let value = serde_json::to_value(agent)?;
        let record = match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Default::default(),
        };
        self.table.put(&agent.agent_id, &record).await
    }

    /// WebSocket identify: creates a fresh entry, or re-enters an existing
    /// (offline) one. Publishes `agent_joined`.
    ///
    /// `token` is checked against the issued-token store; token issuance
    /// itself lives in a separate subsystem, so here an empty or missing
    /// token is the only condition this layer can reject outright.
    pub async fn identify(
        &self,
        agent_id: AgentId,
        token: &str,
        name: Option<String>,
        capabilities: HashSet<String>,
        ollama_url: Option<String>,
    ) -> Result<Arc<AgentStateMachine>> {
        if token.trim().is_empty() {
            warn!("identify for agent {} rejected: no token presented", agent_id);
            return Err(HubError::Unauthorized);
        }
        self.cancel_disconnect_timer(&agent_id).await;

        let existing = self.agents.read().await.get(&agent_id).cloned();
        let fsm = if let Some(fsm) = existing {
            fsm.reconnect().await?;
            fsm
        } else {
            let now = chrono::Utc::now();
            let agent = Agent {
                agent_id: agent_id.clone(),
                name,
                capabilities,
                connected_at: now,
                last_seen: now,
                ollama_url,
                state: AgentFsmState::Idle,
                current_task_id: None,
            };
            let fsm = Arc::new(AgentStateMachine::new(agent));
            self.agents.write().await.insert(agent_id.clone(), fsm.clone());
            fsm
        };

        self.persist(&fsm.snapshot().await).await?;
        self.bus.publish(Event::AgentJoined {
            agent_id: agent_id.clone(),
        });
        info!("agent {} joined", agent_id);
        Ok(fsm)
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let fsm = self
            .get_fsm(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        fsm.touch_last_seen().await;
        self.persist(&fsm.snapshot().await).await
    }

    async fn get_fsm(&self, agent_id: &str) -> Option<Arc<AgentStateMachine>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        match self.get_fsm(agent_id).await {
            Some(fsm) => Some(fsm.snapshot().await),
            None => None,
        }
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut out = Vec::new();
        for fsm in self.agents.read().await.values() {
            out.push(fsm.snapshot().await);
        }
        out
    }

    pub async fn list_idle(&self) -> Vec<Agent> {
        self.list()
            .await
            .into_iter()
            .filter(|a| a.state == AgentFsmState::Idle)
            .collect()
    }

    /// idle → assigned, arming the acceptance timeout.
    /// The timer is stored keyed by task id so `task_accepted` can cancel it
    /// precisely even if the same agent gets re-pushed another task later
    /// (which cannot legally happen before this one resolves, but keying by
    /// task id rather than agent id keeps the invariant explicit).
    pub async fn push_task(
        &self,
        agent_id: &str,
        task_id: TaskId,
        task_queue: Arc<TaskQueue>,
        config: RuntimeConfig,
    ) -> Result<()> {
        let fsm = self
            .get_fsm(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        fsm.push_task(task_id.clone()).await?;
        self.persist(&fsm.snapshot().await).await?;
        self.bus.publish(Event::StatusChanged {
            agent_id: agent_id.to_string(),
        });

        let timer_fsm = fsm.clone();
        let timer_bus = self.bus.clone();
        let timer_agent_id = agent_id.to_string();
        let timer_task_id = task_id.clone();
        let timeout_ms = config.acceptance_timeout_ms();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            warn!(
                "acceptance timeout for agent {} task {}",
                timer_agent_id, timer_task_id
            );
            let _ = task_queue.reclaim(&timer_task_id).await;
            timer_fsm.force_idle().await;
            timer_bus.publish(Event::AgentIdle {
                agent_id: timer_agent_id,
            });
        });
        self.acceptance_timers.write().await.insert(task_id, handle);
        Ok(())
    }

    async fn cancel_acceptance_timer(&self, task_id: &str) {
        if let Some(handle) = self.acceptance_timers.write().await.remove(task_id) {
            handle.abort();
        }
    }

    /// assigned → working, only for the generation the task is currently
    /// assigned under; a late accept for a since-reclaimed generation is
    /// rejected the same way a late `task_complete`/`task_failed` is.
    pub async fn task_accepted(
        &self,
        agent_id: &str,
        task_id: &str,
        generation: u64,
        task_queue: &TaskQueue,
    ) -> Result<()> {
        let task = task_queue.get(task_id).await?;
        if task.generation != generation {
            self.bus.publish(Event::StaleGenerationRejected {
                task_id: task_id.to_string(),
                expected: task.generation,
                actual: generation,
            });
            return Err(HubError::StaleGeneration {
                expected: task.generation,
                actual: generation,
            });
        }
        let fsm = self
            .get_fsm(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        fsm.task_accepted(task_id).await?;
        self.cancel_acceptance_timer(task_id).await;
        self.persist(&fsm.snapshot().await).await?;
        self.bus.publish(Event::StatusChanged {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// assigned → idle via explicit rejection.
    pub async fn task_rejected(
        &self,
        agent_id: &str,
        task_id: &str,
        generation: u64,
        reason: String,
        task_queue: &TaskQueue,
    ) -> Result<()> {
        self.cancel_acceptance_timer(task_id).await;
        let task = task_queue.get(task_id).await?;
        if task.generation != generation {
            self.bus.publish(Event::StaleGenerationRejected {
                task_id: task_id.to_string(),
                expected: task.generation,
                actual: generation,
            });
            return Err(HubError::StaleGeneration {
                expected: task.generation,
                actual: generation,
            });
        }
        let fsm = self
            .get_fsm(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        info!("agent {} rejected task {}: {}", agent_id, task_id, reason);
        task_queue.reclaim(task_id).await?;
        fsm.force_idle().await;
        self.persist(&fsm.snapshot().await).await?;
        self.bus.publish(Event::AgentIdle {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// working → idle on agent-reported success; forwards to the task queue.
    pub async fn task_complete(
        &self,
        agent_id: &str,
        task_id: &str,
        generation: u64,
        result: HashMap<String, serde_json::Value>,
        tokens_used: Option<u64>,
        task_queue: &TaskQueue,
    ) -> Result<()> {
        let fsm = self
            .get_fsm(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        task_queue
            .complete(task_id, generation, result, tokens_used)
            .await?;
        fsm.force_idle().await;
        self.persist(&fsm.snapshot().await).await?;
        self.bus.publish(Event::AgentIdle {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// working → idle on agent-reported failure; forwards to the task queue.
    pub async fn task_failed(
        &self,
        agent_id: &str,
        task_id: &str,
        generation: u64,
        error: String,
        task_queue: &TaskQueue,
    ) -> Result<()> {
        let fsm = self
            .get_fsm(agent_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("agent {agent_id}")))?;
        task_queue.fail(task_id, generation, error).await?;
        fsm.force_idle().await;
        self.persist(&fsm.snapshot().await).await?;
        self.bus.publish(Event::AgentIdle {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Session closed: arms the disconnect grace window, after which the
    /// agent goes offline, any held task is reclaimed, and `agent_left` is
    /// published. A reconnect (`identify`) within the window cancels this.
    pub async fn disconnect(&self, agent_id: &str, task_queue: Arc<TaskQueue>, config: RuntimeConfig) {
        let Some(fsm) = self.get_fsm(agent_id).await else {
            return;
        };
        let grace_ms = config.disconnect_grace_ms();
        let agent_id = agent_id.to_string();
        let agents = self.agents.clone();
        let bus = self.bus.clone();
        let table = self.table.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(grace_ms)).await;
            let held = fsm.go_offline().await;
            if let Some(task_id) = held {
                let _ = task_queue.reclaim(&task_id).await;
            }
            if let Ok(value) = serde_json::to_value(fsm.snapshot().await) {
                if let serde_json::Value::Object(map) = value {
                    let _ = table.put(&agent_id, &map.into_iter().collect()).await;
                }
            }
            agents.write().await.remove(&agent_id);
            bus.publish(Event::AgentLeft {
                agent_id: agent_id.clone(),
            });
            info!("agent {} left after grace window", agent_id);
        });
        self.disconnect_timers.write().await.insert(agent_id.to_string(), handle);
    }

    async fn cancel_disconnect_timer(&self, agent_id: &str) {
        if let Some(handle) = self.disconnect_timers.write().await.remove(agent_id) {
            handle.abort();
        }
    }

    /// Runs at half the TTL interval: evicts any agent whose
    /// `last_seen` exceeds the TTL as if its session had closed.
    pub async fn run_liveness_sweeper(self: Arc<Self>, task_queue: Arc<TaskQueue>, config: RuntimeConfig) {
        loop {
            let ttl_ms = config.agent_ttl_ms();
            tokio::time::sleep(std::time::Duration::from_millis(ttl_ms / 2)).await;
            let now = chrono::Utc::now();
            let stale: Vec<AgentId> = {
                let mut out = Vec::new();
                for (id, fsm) in self.agents.read().await.iter() {
                    let agent = fsm.snapshot().await;
                    if agent.state != AgentFsmState::Offline {
                        let age_ms = (now - agent.last_seen).num_milliseconds().max(0) as u64;
                        if age_ms >= ttl_ms {
                            out.push(id.clone());
                        }
                    }
                }
                out
            };
            for agent_id in stale {
                warn!("evicting stale agent {}", agent_id);
                self.disconnect(&agent_id, task_queue.clone(), config.clone()).await;
            }
        }
    }
}
