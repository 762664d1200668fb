//! Durable task store with priority ordering, retry/dead-letter, and
//! generation fencing. A single owner for the `tasks` and `dead_letter`
//! tables; every mutating method persists before publishing, so a
//! subscriber never observes an event for a state that isn't durable yet.

pub mod priority_index;

use crate::bus::{Event, EventBus};
use crate::classifier;
use crate::models::*;
use crate::storage::StorageTable;
use crate::{HubError, Result};
use priority_index::PriorityIndex;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<AgentId>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_priority: HashMap<Priority, usize>,
    pub dead_letter_count: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GoalProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

pub enum FailOutcome {
    Retried(Task),
    DeadLetter(Task),
}

pub struct TaskQueue {
    tasks: StorageTable,
    dead_letter: StorageTable,
    priority_index: RwLock<PriorityIndex>,
    goal_index: RwLock<HashMap<GoalId, HashSet<TaskId>>>,
    bus: EventBus,
}

impl TaskQueue {
    /// Rebuilds the priority index and goal index from the durable `tasks`
    /// table by scanning every `queued` entry — the same "replay on
    /// startup" idiom used for the cost ledger's rolling windows and the
    /// endpoint circuit-breaker counters.
    pub async fn new(tasks: StorageTable, dead_letter: StorageTable, bus: EventBus) -> Result<Self> {
        let mut priority_index = PriorityIndex::new();
        let mut goal_index: HashMap<GoalId, HashSet<TaskId>> = HashMap::new();

        for (_, record) in tasks.scan().await? {
            if let Ok(task) = decode_task(record) {
                if task.status == TaskStatus::Queued {
                    priority_index.insert(task.priority, task.created_at, task.id.clone());
                }
                if let Some(goal_id) = task.metadata.get("goal_id").and_then(|v| v.as_str()) {
                    goal_index.entry(goal_id.to_string()).or_default().insert(task.id.clone());
                }
            }
        }

        Ok(Self {
            tasks,
            dead_letter,
            priority_index: RwLock::new(priority_index),
            goal_index: RwLock::new(goal_index),
            bus,
        })
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        self.tasks.put(&task.id, &encode_task(task)?).await
    }

    async fn persist_dead_letter(&self, task: &Task) -> Result<()> {
        self.dead_letter.put(&task.id, &encode_task(task)?).await
    }

    pub async fn submit(&self, params: SubmitTaskParams) -> Result<Task> {
        let now = chrono::Utc::now();
        let complexity = classifier::classify(&params.description, &params.needed_capabilities, &params.metadata);

        let mut task = Task {
            id: new_id(),
            description: params.description,
            priority: params.priority,
            needed_capabilities: params.needed_capabilities,
            metadata: params.metadata,
            max_retries: params.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            complete_by: params.complete_by,
            status: TaskStatus::Queued,
            assigned_to: None,
            assigned_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
            tokens_used: None,
            generation: 0,
            routing_decision: None,
            complexity,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        task.push_history("queued", "submitted");

        self.persist(&task).await?;
        self.priority_index
            .write()
            .await
            .insert(task.priority, task.created_at, task.id.clone());
        if let Some(goal_id) = task.metadata.get("goal_id").and_then(|v| v.as_str()) {
            self.goal_index
                .write()
                .await
                .entry(goal_id.to_string())
                .or_default()
                .insert(task.id.clone());
        }

        self.bus.publish(Event::TaskSubmitted { task_id: task.id.clone() });
        info!("task {} submitted (tier={:?})", task.id, task.complexity.effective_tier);
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        if let Some(record) = self.tasks.get(id).await? {
            return decode_task(record);
        }
        if let Some(record) = self.dead_letter.get(id).await? {
            return decode_task(record);
        }
        Err(HubError::NotFound(format!("task {id}")))
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        for (_, record) in self.tasks.scan().await? {
            let task = decode_task(record)?;
            if let Some(status) = filter.status {
                if task.status != status {
                    continue;
                }
            }
            if let Some(priority) = filter.priority {
                if task.priority != priority {
                    continue;
                }
            }
            if let Some(agent_id) = &filter.assigned_to {
                if task.assigned_to.as_ref() != Some(agent_id) {
                    continue;
                }
            }
            out.push(task);
        }
        Ok(out)
    }

    pub async fn list_dead_letter(&self) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        for (_, record) in self.dead_letter.scan().await? {
            out.push(decode_task(record)?);
        }
        Ok(out)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for (_, record) in self.tasks.scan().await? {
            let task = decode_task(record)?;
            *stats.by_status.entry(task.status).or_insert(0) += 1;
            *stats.by_priority.entry(task.priority).or_insert(0) += 1;
        }
        stats.dead_letter_count = self.dead_letter.len().await;
        Ok(stats)
    }

    /// Highest-priority queued task without removing it from the durable
    /// table — only the priority index entry is popped; callers that fail
    /// to assign must reinsert it (handled by `assign`'s caller contract:
    /// the scheduler only pops via this method immediately before calling
    /// `assign`, and on any non-success path simply does not re-pop).
    pub async fn dequeue_next(&self) -> Option<TaskId> {
        self.priority_index.write().await.pop_next()
    }

    pub async fn peek_queue_order(&self) -> Vec<TaskId> {
        self.priority_index.read().await.ordered_ids()
    }

    pub async fn assign(
        &self,
        task_id: &str,
        agent_id: &str,
        complete_by: Option<i64>,
        routing_decision: Option<RoutingDecision>,
    ) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Queued {
            return Err(HubError::invalid_state(vec![TaskStatus::Queued], task.status));
        }
        task.status = TaskStatus::Assigned;
        task.generation += 1;
        task.assigned_to = Some(agent_id.to_string());
        task.assigned_at = Some(chrono::Utc::now());
        task.complete_by = complete_by.or(task.complete_by);
        if let Some(decision) = routing_decision {
            task.routing_decision = Some(decision);
        }
        task.updated_at = chrono::Utc::now();
        task.push_history("assigned", format!("agent={agent_id}, generation={}", task.generation));

        self.persist(&task).await?;
        self.priority_index
            .write()
            .await
            .remove(task.priority, task.created_at, &task.id);
        self.bus.publish(Event::TaskAssigned {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            generation: task.generation,
        });
        Ok(task)
    }

    pub async fn complete(
        &self,
        task_id: &str,
        generation: u64,
        result: HashMap<String, serde_json::Value>,
        tokens_used: Option<u64>,
    ) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Assigned {
            return Err(HubError::invalid_state(vec![TaskStatus::Assigned], task.status));
        }
        if task.generation != generation {
            self.bus.publish(Event::StaleGenerationRejected {
                task_id: task.id.clone(),
                expected: task.generation,
                actual: generation,
            });
            return Err(HubError::StaleGeneration {
                expected: task.generation,
                actual: generation,
            });
        }
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.tokens_used = tokens_used;
        task.updated_at = chrono::Utc::now();
        task.push_history("completed", "agent reported success");

        self.persist(&task).await?;
        self.bus.publish(Event::TaskCompleted { task_id: task.id.clone() });
        Ok(task)
    }

    pub async fn fail(&self, task_id: &str, generation: u64, error: String) -> Result<FailOutcome> {
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Assigned {
            return Err(HubError::invalid_state(vec![TaskStatus::Assigned], task.status));
        }
        if task.generation != generation {
            self.bus.publish(Event::StaleGenerationRejected {
                task_id: task.id.clone(),
                expected: task.generation,
                actual: generation,
            });
            return Err(HubError::StaleGeneration {
                expected: task.generation,
                actual: generation,
            });
        }

        task.last_error = Some(error.clone());
        task.updated_at = chrono::Utc::now();

        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.generation += 1;
            task.status = TaskStatus::Queued;
            task.assigned_to = None;
            task.assigned_at = None;
            task.push_history("queued", format!("retry {}/{}: {error}", task.retry_count, task.max_retries));

            self.persist(&task).await?;
            self.priority_index
                .write()
                .await
                .insert(task.priority, task.created_at, task.id.clone());
            self.bus.publish(Event::TaskRetried { task_id: task.id.clone() });
            Ok(FailOutcome::Retried(task))
        } else {
            task.status = TaskStatus::DeadLetter;
            task.push_history("dead_letter", format!("retries exhausted: {error}"));
            self.tasks.delete(&task.id).await?;
            self.persist_dead_letter(&task).await?;
            self.bus.publish(Event::TaskDeadLetter { task_id: task.id.clone() });
            Ok(FailOutcome::DeadLetter(task))
        }
    }

    /// assigned → queued, bumping generation. Used by agent-disconnect
    /// reclaim, acceptance-timeout reclaim, and the overdue sweep.
    pub async fn reclaim(&self, task_id: &str) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Assigned {
            return Err(HubError::invalid_state(vec![TaskStatus::Assigned], task.status));
        }
        task.generation += 1;
        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.assigned_at = None;
        task.updated_at = chrono::Utc::now();
        task.push_history("queued", format!("reclaimed, generation={}", task.generation));

        self.persist(&task).await?;
        self.priority_index
            .write()
            .await
            .insert(task.priority, task.created_at, task.id.clone());
        self.bus.publish(Event::TaskReclaimed { task_id: task.id.clone() });
        Ok(task)
    }

    pub async fn retry_dead_letter(&self, task_id: &str) -> Result<Task> {
        let record = self
            .dead_letter
            .get(task_id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("dead-letter task {task_id}")))?;
        let mut task = decode_task(record)?;

        task.retry_count = 0;
        task.generation += 1;
        task.status = TaskStatus::Queued;
        task.last_error = None;
        task.updated_at = chrono::Utc::now();
        task.push_history("queued", "retried from dead letter");

        self.dead_letter.delete(task_id).await?;
        self.persist(&task).await?;
        self.priority_index
            .write()
            .await
            .insert(task.priority, task.created_at, task.id.clone());
        self.bus.publish(Event::TaskRetried { task_id: task.id.clone() });
        Ok(task)
    }

    pub async fn expire(&self, task_id: &str) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        if task.status != TaskStatus::Queued {
            return Err(HubError::invalid_state(vec![TaskStatus::Queued], task.status));
        }
        task.status = TaskStatus::DeadLetter;
        task.last_error = Some("ttl_expired".to_string());
        task.updated_at = chrono::Utc::now();
        task.push_history("dead_letter", "ttl_expired");

        self.priority_index
            .write()
            .await
            .remove(task.priority, task.created_at, &task.id);
        self.tasks.delete(&task.id).await?;
        self.persist_dead_letter(&task).await?;
        self.bus.publish(Event::TaskDeadLetter { task_id: task.id.clone() });
        Ok(task)
    }

    pub async fn goal_progress(&self, goal_id: &str) -> Result<GoalProgress> {
        let mut progress = GoalProgress::default();
        for (_, record) in self.tasks.scan().await? {
            let task = decode_task(record)?;
            if task.metadata.get("goal_id").and_then(|v| v.as_str()) == Some(goal_id) {
                progress.total += 1;
                if task.status == TaskStatus::Completed {
                    progress.completed += 1;
                }
            }
        }
        for (_, record) in self.dead_letter.scan().await? {
            let task = decode_task(record)?;
            if task.metadata.get("goal_id").and_then(|v| v.as_str()) == Some(goal_id) {
                progress.total += 1;
                progress.failed += 1;
            }
        }
        Ok(progress)
    }

    /// Scans assigned tasks whose `complete_by` has passed and reclaims
    /// them, bumping generation so any in-flight reply from the prior
    /// agent is rejected. Runs every ~60s.
    pub async fn sweep_overdue(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut reclaimed = 0;
        for (_, record) in self.tasks.scan().await? {
            let task = decode_task(record)?;
            if task.status == TaskStatus::Assigned {
                if let Some(deadline) = task.complete_by {
                    if deadline <= now && self.reclaim(&task.id).await.is_ok() {
                        reclaimed += 1;
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    /// Expires queued non-trivial tasks that have waited longer than
    /// `task_ttl_ms`. Trivial tasks are exempt.
    pub async fn sweep_ttl(&self, task_ttl_ms: u64) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::milliseconds(task_ttl_ms as i64);
        let mut expired = 0;
        for (_, record) in self.tasks.scan().await? {
            let task = decode_task(record)?;
            if task.status == TaskStatus::Queued
                && task.complexity.effective_tier.effective() != Tier::Trivial
                && task.created_at <= cutoff
                && self.expire(&task.id).await.is_ok()
            {
                expired += 1;
            }
        }
        Ok(expired)
    }
}

fn encode_task(task: &Task) -> Result<HashMap<String, serde_json::Value>> {
    let value = serde_json::to_value(task)?;
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => unreachable!("Task always serializes to an object"),
    }
}

fn decode_task(record: HashMap<String, serde_json::Value>) -> Result<Task> {
    let value = serde_json::Value::Object(record.into_iter().collect());
    Ok(serde_json::from_value(value)?)
}

/// Background task: overdue + TTL sweeps every `SWEEP_INTERVAL_SECS`,
/// reading `task_ttl_ms` from config on each pass rather than once at
/// startup.
pub async fn run_sweeper(queue: std::sync::Arc<TaskQueue>, config: crate::config::RuntimeConfig) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(crate::constants::SWEEP_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        if let Ok(n) = queue.sweep_overdue().await {
            if n > 0 {
                info!("overdue sweep reclaimed {} tasks", n);
            }
        }
        if let Ok(n) = queue.sweep_ttl(config.task_ttl_ms()).await {
            if n > 0 {
                info!("ttl sweep expired {} tasks", n);
            }
        }
    }
}
