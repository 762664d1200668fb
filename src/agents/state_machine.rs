//! Per-agent FSM. One instance per connected agent, held behind its own
//! mutex in `PresenceRegistry` — one lock per unit of concurrency rather
//! than a single registry-wide lock.
//!
//! Timer arming, task-queue calls, and event publication are orchestrated
//! by `PresenceRegistry`, which owns the `EventBus` and `TaskQueue` handles;
//! this type only enforces the legal transitions against the in-memory
//! `Agent` record.

use crate::models::{Agent, AgentFsmState, TaskId};
use crate::{HubError, Result};
use tokio::sync::Mutex;

pub struct AgentStateMachine {
    inner: Mutex<Agent>,
}

impl AgentStateMachine {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Mutex::new(agent),
        }
    }

    pub async fn snapshot(&self) -> Agent {
        self.inner.lock().await.clone()
    }

    pub async fn touch_last_seen(&self) {
        let mut agent = self.inner.lock().await;
        agent.last_seen = chrono::Utc::now();
    }

    /// idle → assigned. Caller arms the acceptance timer and publishes
    /// `status_changed` after this succeeds.
    pub async fn push_task(&self, task_id: TaskId) -> Result<()> {
        let mut agent = self.inner.lock().await;
        if agent.state != AgentFsmState::Idle {
            return Err(HubError::AgentUnavailable(format!(
                "agent {} is {:?}, not idle",
                agent.agent_id, agent.state
            )));
        }
        agent.state = AgentFsmState::Assigned;
        agent.current_task_id = Some(task_id);
        Ok(())
    }

    /// assigned → working, only if `task_id` matches the currently held task.
    pub async fn task_accepted(&self, task_id: &str) -> Result<()> {
        let mut agent = self.inner.lock().await;
        if agent.state != AgentFsmState::Assigned || agent.current_task_id.as_deref() != Some(task_id) {
            return Err(HubError::AgentUnavailable(format!(
                "agent {} cannot accept {}: state {:?}, holding {:?}",
                agent.agent_id, task_id, agent.state, agent.current_task_id
            )));
        }
        agent.state = AgentFsmState::Working;
        Ok(())
    }

    /// Drives the agent directly back to idle, clearing any held task.
    /// Used for acceptance timeout, rejection, and working→idle completion
    /// paths, all of which reclaim/forward to the task queue before calling
    /// this — by the time this runs the FSM transition itself is unconditional.
    pub async fn force_idle(&self) -> Option<TaskId> {
        let mut agent = self.inner.lock().await;
        let held = agent.current_task_id.take();
        agent.state = AgentFsmState::Idle;
        held
    }

    /// any → offline. Returns the task id that was held, if any, so the
    /// caller can reclaim it.
    pub async fn go_offline(&self) -> Option<TaskId> {
        let mut agent = self.inner.lock().await;
        let held = agent.current_task_id.take();
        agent.state = AgentFsmState::Offline;
        held
    }

    /// offline → idle, re-entering the registry on a fresh identify.
    pub async fn reconnect(&self) -> Result<()> {
        let mut agent = self.inner.lock().await;
        if agent.state != AgentFsmState::Offline {
            return Err(HubError::AgentUnavailable(format!(
                "agent {} is already {:?}",
                agent.agent_id, agent.state
            )));
        }
        agent.state = AgentFsmState::Idle;
        agent.connected_at = chrono::Utc::now();
        agent.last_seen = agent.connected_at;
        Ok(())
    }

    pub async fn state(&self) -> AgentFsmState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_agent(state: AgentFsmState) -> Agent {
        let now = chrono::Utc::now();
        Agent {
            agent_id: "a1".to_string(),
            name: None,
            capabilities: HashSet::new(),
            connected_at: now,
            last_seen: now,
            ollama_url: None,
            state,
            current_task_id: None,
        }
    }

    #[tokio::test]
    async fn push_task_requires_idle() {
        let fsm = AgentStateMachine::new(test_agent(AgentFsmState::Working));
        assert!(fsm.push_task("t1".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn accept_requires_matching_task_id() {
        let fsm = AgentStateMachine::new(test_agent(AgentFsmState::Idle));
        fsm.push_task("t1".to_string()).await.unwrap();
        assert!(fsm.task_accepted("t2").await.is_err());
        assert!(fsm.task_accepted("t1").await.is_ok());
        assert_eq!(fsm.state().await, AgentFsmState::Working);
    }

    #[tokio::test]
    async fn force_idle_clears_held_task() {
        let fsm = AgentStateMachine::new(test_agent(AgentFsmState::Idle));
        fsm.push_task("t1".to_string()).await.unwrap();
        let held = fsm.force_idle().await;
        assert_eq!(held, Some("t1".to_string()));
        assert_eq!(fsm.state().await, AgentFsmState::Idle);
    }
}
