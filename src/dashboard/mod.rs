//! Read-only snapshot of the whole hub, assembled for the dashboard HTTP
//! endpoint. Touches every other component but never mutates anything.
use crate::agents::PresenceRegistry;
use crate::endpoints::EndpointRegistry;
use crate::goals::GoalBacklog;
use crate::hub_fsm::HubFsm;
use crate::ledger::{CostLedger, LedgerStats};
use crate::models::{Agent, EndpointView, Goal, HubState};
use crate::tasks::{QueueStats, TaskQueue};
use crate::Result;
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardState {
    pub queue: QueueStats,
    pub agents: Vec<Agent>,
    pub endpoints: Vec<EndpointView>,
    pub ledger: LedgerStats,
    pub hub_state: HubState,
    pub goals: Vec<Goal>,
}

pub struct DashboardSnapshotter {
    tasks: Arc<TaskQueue>,
    presence: Arc<PresenceRegistry>,
    endpoints: Arc<EndpointRegistry>,
    ledger: Arc<CostLedger>,
    fsm: Arc<HubFsm>,
    goals: Arc<GoalBacklog>,
}

impl DashboardSnapshotter {
    pub fn new(
        tasks: Arc<TaskQueue>,
        presence: Arc<PresenceRegistry>,
        endpoints: Arc<EndpointRegistry>,
        ledger: Arc<CostLedger>,
        fsm: Arc<HubFsm>,
        goals: Arc<GoalBacklog>,
    ) -> Self {
        Self { tasks, presence, endpoints, ledger, fsm, goals }
    }

    pub async fn snapshot(&self) -> Result<DashboardState> {
        Ok(DashboardState {
            queue: self.tasks.stats().await?,
            agents: self.presence.list().await,
            endpoints: self.endpoints.list_endpoints().await?,
            ledger: self.ledger.stats().await,
            hub_state: self.fsm.state().await,
            goals: self.goals.list().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::storage::StorageEngine;

    #[tokio::test]
    async fn snapshot_assembles_without_error() {
        let bus = EventBus::new();
        let dir = tempfile::TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), bus.clone()).unwrap();

        let tasks_table = engine.open_table("tasks").await.unwrap();
        let dead_letter_table = engine.open_table("dead_letter").await.unwrap();
        let agents_table = engine.open_table("agents").await.unwrap();
        let endpoints_table = engine.open_table("endpoints").await.unwrap();
        let goals_table = engine.open_table("goals").await.unwrap();
        let ledger_table = engine.open_table("ledger").await.unwrap();

        let tasks = Arc::new(TaskQueue::new(tasks_table, dead_letter_table, bus.clone()).await.unwrap());
        let presence = Arc::new(PresenceRegistry::new(agents_table, bus.clone()).await.unwrap());
        let endpoints = Arc::new(EndpointRegistry::new(endpoints_table, bus.clone()).await.unwrap());
        let goals = Arc::new(GoalBacklog::new(goals_table, bus.clone()).await.unwrap());
        let ledger = Arc::new(CostLedger::new(ledger_table, crate::config::RuntimeConfig::from_env()).await.unwrap());
        let fsm = Arc::new(HubFsm::new(tasks.clone(), goals.clone(), ledger.clone(), bus.clone()));

        let snapshotter = DashboardSnapshotter::new(tasks, presence, endpoints, ledger, fsm, goals);
        let snapshot = snapshotter.snapshot().await.unwrap();
        assert_eq!(snapshot.hub_state, HubState::Resting);
        assert!(snapshot.agents.is_empty());
    }
}
