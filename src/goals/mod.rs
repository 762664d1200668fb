//! Durable goal backlog plus the orchestrator that decomposes goals into
//! child tasks and advances their lifecycle. Driven by the `Hub FSM` while
//! it is in the `executing` state.

use crate::models::{Goal, GoalId, GoalStatus, Priority, SubmitTaskParams};
use crate::storage::StorageTable;
use crate::tasks::TaskQueue;
use crate::{bus::{Event, EventBus}, HubError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Durable CRUD plus lifecycle transitions over the `goals` table.
pub struct GoalBacklog {
    table: StorageTable,
    bus: EventBus,
}

fn allowed_transition(from: GoalStatus, to: GoalStatus) -> bool {
    use GoalStatus::*;
    matches!(
        (from, to),
        (Submitted, Decomposing)
            | (Decomposing, Executing)
            | (Executing, Verifying)
            | (Verifying, Complete)
            | (Verifying, Failed)
            | (Submitted, Failed)
            | (Decomposing, Failed)
            | (Executing, Failed)
    )
}

impl GoalBacklog {
    pub async fn new(table: StorageTable, bus: EventBus) -> Result<Self> {
        Ok(Self { table, bus })
    }

    async fn persist(&self, goal: &Goal) -> Result<()> {
        self.table.put(&goal.id, &encode(goal)?).await
    }

    pub async fn submit(&self, description: String, priority: Priority, success_criteria: Vec<String>) -> Result<Goal> {
        let goal = Goal::new(crate::models::new_id(), description, priority, success_criteria);
        self.persist(&goal).await?;
        self.bus.publish(Event::GoalStatusChanged { goal_id: goal.id.clone() });
        info!("goal {} submitted", goal.id);
        Ok(goal)
    }

    pub async fn get(&self, id: &str) -> Result<Goal> {
        let record = self.table.get(id).await?.ok_or_else(|| HubError::NotFound(format!("goal {id}")))?;
        decode(record)
    }

    pub async fn list(&self) -> Result<Vec<Goal>> {
        let mut out = Vec::new();
        for (_, record) in self.table.scan().await? {
            out.push(decode(record)?);
        }
        Ok(out)
    }

    pub async fn transition(&self, id: &str, to: GoalStatus) -> Result<Goal> {
        let mut goal = self.get(id).await?;
        if !allowed_transition(goal.status, to) {
            return Err(HubError::Validation(format!(
                "illegal goal transition {:?} -> {:?}",
                goal.status, to
            )));
        }
        goal.status = to;
        goal.updated_at = chrono::Utc::now();
        self.persist(&goal).await?;
        self.bus.publish(Event::GoalStatusChanged { goal_id: goal.id.clone() });
        Ok(goal)
    }

    pub async fn set_child_tasks(&self, id: &str, child_task_ids: Vec<String>) -> Result<Goal> {
        let mut goal = self.get(id).await?;
        goal.child_task_ids = child_task_ids;
        goal.updated_at = chrono::Utc::now();
        self.persist(&goal).await?;
        Ok(goal)
    }
}

fn encode(goal: &Goal) -> Result<HashMap<String, serde_json::Value>> {
    match serde_json::to_value(goal)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => unreachable!("Goal always serializes to an object"),
    }
}

fn decode(record: HashMap<String, serde_json::Value>) -> Result<Goal> {
    Ok(serde_json::from_value(serde_json::Value::Object(record.into_iter().collect()))?)
}

/// Splits a goal's `success_criteria` 1:1 into child tasks. Decomposition
/// quality is out of scope; this is the one default implementation the
/// pluggable trait ships with.
pub trait Decomposer: Send + Sync {
    fn decompose(&self, goal: &Goal) -> Vec<SubmitTaskParams>;
}

pub struct DefaultDecomposer;

impl Decomposer for DefaultDecomposer {
    fn decompose(&self, goal: &Goal) -> Vec<SubmitTaskParams> {
        goal.success_criteria
            .iter()
            .map(|criterion| {
                let mut metadata = HashMap::new();
                metadata.insert("goal_id".to_string(), serde_json::Value::String(goal.id.clone()));
                SubmitTaskParams {
                    description: criterion.clone(),
                    priority: goal.priority,
                    needed_capabilities: Default::default(),
                    metadata,
                    max_retries: None,
                    complete_by: None,
                }
            })
            .collect()
    }
}

/// Advances every in-flight goal one step per `on_tick` call: decomposes at
/// most one `submitted` goal (highest priority first), and promotes
/// `executing`/`verifying` goals whose child tasks have all resolved.
pub struct GoalOrchestrator {
    backlog: Arc<GoalBacklog>,
    tasks: Arc<TaskQueue>,
    decomposer: Box<dyn Decomposer>,
}

impl GoalOrchestrator {
    pub fn new(backlog: Arc<GoalBacklog>, tasks: Arc<TaskQueue>) -> Self {
        Self::with_decomposer(backlog, tasks, Box::new(DefaultDecomposer))
    }

    pub fn with_decomposer(backlog: Arc<GoalBacklog>, tasks: Arc<TaskQueue>, decomposer: Box<dyn Decomposer>) -> Self {
        Self { backlog, tasks, decomposer }
    }

    pub async fn on_tick(&self) -> Result<()> {
        self.advance_in_flight().await?;
        self.decompose_next_submitted().await?;
        Ok(())
    }

    async fn decompose_next_submitted(&self) -> Result<()> {
        let mut submitted: Vec<Goal> = self
            .backlog
            .list()
            .await?
            .into_iter()
            .filter(|g| g.status == GoalStatus::Submitted)
            .collect();
        submitted.sort_by_key(|g| g.priority);
        let Some(goal) = submitted.into_iter().next() else {
            return Ok(());
        };

        let goal = self.backlog.transition(&goal.id, GoalStatus::Decomposing).await?;
        let mut child_ids = Vec::new();
        for params in self.decomposer.decompose(&goal) {
            let task = self.tasks.submit(params).await?;
            child_ids.push(task.id);
        }
        self.backlog.set_child_tasks(&goal.id, child_ids).await?;
        self.backlog.transition(&goal.id, GoalStatus::Executing).await?;
        info!("goal {} decomposed into {} tasks", goal.id, goal.child_task_ids.len());
        Ok(())
    }

    async fn advance_in_flight(&self) -> Result<()> {
        for goal in self.backlog.list().await? {
            if goal.status != GoalStatus::Executing && goal.status != GoalStatus::Verifying {
                continue;
            }
            let progress = self.tasks.goal_progress(&goal.id).await?;
            if progress.total == 0 || progress.completed + progress.failed < progress.total {
                continue;
            }
            match goal.status {
                GoalStatus::Executing => {
                    self.backlog.transition(&goal.id, GoalStatus::Verifying).await?;
                }
                GoalStatus::Verifying if progress.failed == 0 => {
                    self.backlog.transition(&goal.id, GoalStatus::Complete).await?;
                }
                GoalStatus::Verifying => {
                    self.backlog.transition(&goal.id, GoalStatus::Failed).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::storage::StorageEngine;

    async fn setup() -> (Arc<GoalBacklog>, Arc<TaskQueue>) {
        let bus = EventBus::new();
        let dir = tempfile::TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), bus.clone()).unwrap();
        let goals_table = engine.open_table("goals").await.unwrap();
        let tasks_table = engine.open_table("tasks").await.unwrap();
        let dead_letter_table = engine.open_table("dead_letter").await.unwrap();
        let backlog = Arc::new(GoalBacklog::new(goals_table, bus.clone()).await.unwrap());
        let tasks = Arc::new(TaskQueue::new(tasks_table, dead_letter_table, bus).await.unwrap());
        (backlog, tasks)
    }

    #[tokio::test]
    async fn decomposition_creates_one_task_per_criterion() {
        let (backlog, tasks) = setup().await;
        let goal = backlog
            .submit(
                "ship feature".to_string(),
                Priority::High,
                vec!["criterion one".to_string(), "criterion two".to_string()],
            )
            .await
            .unwrap();

        let orchestrator = GoalOrchestrator::new(backlog.clone(), tasks.clone());
        orchestrator.on_tick().await.unwrap();

        let updated = backlog.get(&goal.id).await.unwrap();
        assert_eq!(updated.status, GoalStatus::Executing);
        assert_eq!(updated.child_task_ids.len(), 2);
    }

    #[tokio::test]
    async fn goal_completes_once_all_children_succeed() {
        let (backlog, tasks) = setup().await;
        let goal = backlog
            .submit("ship feature".to_string(), Priority::Normal, vec!["only criterion".to_string()])
            .await
            .unwrap();
        let orchestrator = GoalOrchestrator::new(backlog.clone(), tasks.clone());
        orchestrator.on_tick().await.unwrap();

        let updated = backlog.get(&goal.id).await.unwrap();
        let child_id = updated.child_task_ids[0].clone();
        let assigned = tasks.assign(&child_id, "agent-1", None, None).await.unwrap();
        tasks.complete(&assigned.id, assigned.generation, HashMap::new(), None).await.unwrap();

        orchestrator.on_tick().await.unwrap();
        let verifying = backlog.get(&goal.id).await.unwrap();
        assert_eq!(verifying.status, GoalStatus::Verifying);

        orchestrator.on_tick().await.unwrap();
        let completed = backlog.get(&goal.id).await.unwrap();
        assert_eq!(completed.status, GoalStatus::Complete);
    }

    #[test]
    fn illegal_transitions_are_rejected_by_the_table() {
        assert!(!allowed_transition(GoalStatus::Submitted, GoalStatus::Complete));
        assert!(allowed_transition(GoalStatus::Submitted, GoalStatus::Decomposing));
    }
}
