//! Top-level autonomous state machine. Ticks once a second, deciding
//! whether to start a new cycle, and listens on the bus for corruption
//! events that force a transition into `healing` — and for the storage
//! engine's recovery outcome that later releases it back to `resting`.
use crate::bus::{Event, EventBus};
use crate::constants::{
    HEALING_ATTEMPT_WINDOW_SECS, HEALING_COOLDOWN_SECS, HEALING_MAX_ATTEMPTS, HUB_HISTORY_CAPACITY,
    HUB_TICK_INTERVAL_SECS, HUB_WATCHDOG_SECS,
};
use crate::goals::{GoalBacklog, GoalOrchestrator};
use crate::ledger::CostLedger;
use crate::models::{HubState, InvocationCategory, InvocationRecord};
use crate::tasks::TaskQueue;
use crate::{HubError, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{info, warn};

fn allowed_transition(from: HubState, to: HubState) -> bool {
    use HubState::*;
    matches!(
        (from, to),
        (Resting, Executing)
            | (Resting, Improving)
            | (Resting, Healing)
            | (Executing, Resting)
            | (Executing, Healing)
            | (Improving, Resting)
            | (Improving, Executing)
            | (Improving, Contemplating)
            | (Contemplating, Resting)
            | (Contemplating, Executing)
            | (Contemplating, Healing)
            | (Healing, Resting)
    )
}

fn category_for(state: HubState) -> Option<InvocationCategory> {
    match state {
        HubState::Executing => Some(InvocationCategory::Executing),
        HubState::Improving => Some(InvocationCategory::Improving),
        HubState::Contemplating => Some(InvocationCategory::Contemplating),
        _ => None,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TransitionRecord {
    pub from: HubState,
    pub to: HubState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

struct CycleResult {
    state: HubState,
    produced_findings: bool,
}

/// Hub-level state machine. Holds the canonical `HubState`, a bounded
/// history of transitions, and the machinery to run one autonomous cycle at
/// a time without blocking the tick loop.
pub struct HubFsm {
    state: RwLock<HubState>,
    history: Mutex<VecDeque<TransitionRecord>>,
    last_transition_at: RwLock<DateTime<Utc>>,
    paused: AtomicBool,
    cycle_running: AtomicBool,
    healing_attempts: Mutex<VecDeque<DateTime<Utc>>>,
    last_healed_at: RwLock<Option<DateTime<Utc>>>,
    wake: Notify,
    tasks: Arc<TaskQueue>,
    goals: Arc<GoalBacklog>,
    ledger: Arc<CostLedger>,
    bus: EventBus,
    result_tx: mpsc::UnboundedSender<CycleResult>,
    result_rx: Mutex<mpsc::UnboundedReceiver<CycleResult>>,
}

impl HubFsm {
    pub fn new(tasks: Arc<TaskQueue>, goals: Arc<GoalBacklog>, ledger: Arc<CostLedger>, bus: EventBus) -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            state: RwLock::new(HubState::Resting),
            history: Mutex::new(VecDeque::with_capacity(HUB_HISTORY_CAPACITY)),
            last_transition_at: RwLock::new(Utc::now()),
            paused: AtomicBool::new(false),
            cycle_running: AtomicBool::new(false),
            healing_attempts: Mutex::new(VecDeque::new()),
            last_healed_at: RwLock::new(None),
            wake: Notify::new(),
            tasks,
            goals,
            ledger,
            bus,
            result_tx,
            result_rx: Mutex::new(result_rx),
        }
    }

    pub async fn state(&self) -> HubState {
        *self.state.read().await
    }

    pub async fn history(&self) -> Vec<TransitionRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("hub fsm paused");
    }

    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        info!("hub fsm resumed");
    }

    /// Validated transition. Rejects any pair not in `allowed_transition`.
    pub async fn transition(&self, to: HubState, reason: impl Into<String>) -> Result<()> {
        let from = *self.state.read().await;
        if !allowed_transition(from, to) {
            return Err(HubError::Validation(format!("illegal hub transition {from:?} -> {to:?}")));
        }
        self.record_transition(from, to, reason.into()).await;
        Ok(())
    }

    /// Bypasses the transition table. Used by the watchdog and by healing,
    /// both of which must be able to recover from any state.
    pub async fn force_transition(&self, to: HubState, reason: impl Into<String>) {
        let from = *self.state.read().await;
        let reason = reason.into();
        if !allowed_transition(from, to) {
            warn!("forcing non-table transition {:?} -> {:?}: {}", from, to, reason);
        }
        self.record_transition(from, to, reason).await;
    }

    async fn record_transition(&self, from: HubState, to: HubState, reason: String) {
        *self.state.write().await = to;
        *self.last_transition_at.write().await = Utc::now();
        let mut history = self.history.lock().await;
        if history.len() >= HUB_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(TransitionRecord { from, to, reason, at: Utc::now() });
        self.wake.notify_one();
        info!("hub transition {:?} -> {:?}", from, to);
    }

    async fn seconds_since_last_transition(&self) -> i64 {
        (Utc::now() - *self.last_transition_at.read().await).num_seconds()
    }

    async fn has_pending_goals(&self) -> bool {
        self.goals.list().await.unwrap_or_default().iter().any(|g| {
            matches!(
                g.status,
                crate::models::GoalStatus::Submitted
                    | crate::models::GoalStatus::Decomposing
                    | crate::models::GoalStatus::Executing
                    | crate::models::GoalStatus::Verifying
            )
        })
    }

    /// Requests `resting -> improving` on an external improvement signal.
    /// No producer of that signal is wired up in this core — it's
    /// consumer-side glue outside this crate's scope — so this is the
    /// entry point a future caller (e.g. an admin action or an analytics
    /// threshold) would invoke.
    pub async fn request_improvement(self: &Arc<Self>, reason: impl Into<String>) -> Result<()> {
        if self.paused.load(Ordering::SeqCst) || self.cycle_running.load(Ordering::SeqCst) {
            return Err(HubError::Validation("hub fsm busy or paused".to_string()));
        }
        if *self.state.read().await != HubState::Resting {
            return Err(HubError::Validation("improvement only starts from resting".to_string()));
        }
        self.ledger
            .check_budget(InvocationCategory::Improving)
            .await
            .map_err(|_| HubError::BudgetExhausted("improving".to_string()))?;
        self.start_cycle(HubState::Improving, reason.into()).await
    }

    async fn maybe_start_cycle(self: &Arc<Self>) {
        if self.paused.load(Ordering::SeqCst) || self.cycle_running.load(Ordering::SeqCst) {
            return;
        }
        if *self.state.read().await != HubState::Resting {
            return;
        }
        if !self.has_pending_goals().await {
            return;
        }
        if self.ledger.check_budget(InvocationCategory::Executing).await.is_err() {
            return;
        }
        let _ = self.start_cycle(HubState::Executing, "pending goals".to_string()).await;
    }

    /// Transitions into `target` (validated against the transition table)
    /// and spawns its one-shot cycle task. The result is delivered back
    /// over `result_tx` for `drain_completed_cycles` to re-evaluate once
    /// the cycle finishes.
    async fn start_cycle(self: &Arc<Self>, target: HubState, reason: String) -> Result<()> {
        let Some(category) = category_for(target) else {
            return Err(HubError::Validation(format!("{target:?} has no invocation category")));
        };
        self.transition(target, reason).await?;
        self.cycle_running.store(true, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.run_cycle(target, category).await;
            let produced_findings = match result {
                Ok(found) => found,
                Err(e) => {
                    warn!("cycle {:?} failed: {}", target, e);
                    false
                }
            };
            let _ = this.result_tx.send(CycleResult { state: target, produced_findings });
        });
        Ok(())
    }

    /// Runs one cycle and returns whether it produced findings (meaningful
    /// only for `improving`; ignored for the other categories).
    async fn run_cycle(&self, state: HubState, category: InvocationCategory) -> Result<bool> {
        self.ledger
            .record(InvocationRecord { category, timestamp: Utc::now(), tokens: None, cost: None })
            .await?;

        match state {
            HubState::Executing => {
                let orchestrator = GoalOrchestrator::new(self.goals.clone(), self.tasks.clone());
                orchestrator.on_tick().await?;
                Ok(true)
            }
            HubState::Improving | HubState::Contemplating => {
                // No autonomous improvement/contemplation workload is wired
                // up in this core; the cycle still books cost against the
                // ledger and reports no findings, which is what routes
                // `improving` on toward `contemplating` below.
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn drain_completed_cycles(self: &Arc<Self>) {
        let results: Vec<CycleResult> = {
            let mut rx = self.result_rx.lock().await;
            let mut out = Vec::new();
            while let Ok(result) = rx.try_recv() {
                out.push(result);
            }
            out
        };

        for result in results {
            self.cycle_running.store(false, Ordering::SeqCst);
            if *self.state.read().await != result.state {
                continue;
            }

            match result.state {
                HubState::Executing => {
                    let still_pending = self.has_pending_goals().await;
                    let budget_ok = self.ledger.check_budget(InvocationCategory::Executing).await.is_ok();
                    if still_pending && budget_ok {
                        let _ = self.start_cycle(HubState::Executing, "goals still pending".to_string()).await;
                    } else {
                        let _ = self.transition(HubState::Resting, "cycle complete").await;
                    }
                }
                HubState::Improving => {
                    if self.has_pending_goals().await
                        && self.ledger.check_budget(InvocationCategory::Executing).await.is_ok()
                    {
                        let _ = self.start_cycle(HubState::Executing, "goals appeared during improvement".to_string()).await;
                    } else if !result.produced_findings
                        && self.ledger.check_budget(InvocationCategory::Contemplating).await.is_ok()
                    {
                        let _ = self
                            .start_cycle(HubState::Contemplating, "improvement produced no findings".to_string())
                            .await;
                    } else {
                        let _ = self.transition(HubState::Resting, "improvement cycle complete").await;
                    }
                }
                HubState::Contemplating => {
                    if self.has_pending_goals().await
                        && self.ledger.check_budget(InvocationCategory::Executing).await.is_ok()
                    {
                        let _ = self.start_cycle(HubState::Executing, "goals appeared during contemplation".to_string()).await;
                    } else {
                        let _ = self.transition(HubState::Resting, "contemplation cycle complete").await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn check_watchdog(&self) {
        if *self.state.read().await == HubState::Resting {
            return;
        }
        if self.seconds_since_last_transition().await >= HUB_WATCHDOG_SECS as i64 {
            warn!("watchdog firing, stuck in {:?}", self.state().await);
            self.cycle_running.store(false, Ordering::SeqCst);
            self.force_transition(HubState::Resting, "watchdog timeout").await;
        }
    }

    async fn can_attempt_healing(&self) -> bool {
        if let Some(last) = *self.last_healed_at.read().await {
            if (Utc::now() - last).num_seconds() < HEALING_COOLDOWN_SECS as i64 {
                return false;
            }
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(HEALING_ATTEMPT_WINDOW_SECS as i64);
        let mut attempts = self.healing_attempts.lock().await;
        while attempts.front().map(|t| *t < cutoff).unwrap_or(false) {
            attempts.pop_front();
        }
        attempts.len() < HEALING_MAX_ATTEMPTS as usize
    }

    async fn begin_healing(&self, table: String) {
        if !self.can_attempt_healing().await {
            warn!("healing suppressed for {}, too many recent attempts", table);
            return;
        }
        self.healing_attempts.lock().await.push_back(Utc::now());
        *self.last_healed_at.write().await = Some(Utc::now());
        self.force_transition(HubState::Healing, format!("corruption detected in {table}")).await;
    }

    /// healing → resting once the storage engine reports the recovery
    /// attempt finished, successfully or not. The cooldown was already
    /// stamped in `last_healed_at` when healing began.
    async fn end_healing(&self, table: String, recovered: bool) {
        if *self.state.read().await != HubState::Healing {
            return;
        }
        let reason = if recovered {
            format!("healing cycle complete for {table}")
        } else {
            format!("healing failed for {table}, resting anyway")
        };
        self.force_transition(HubState::Resting, reason).await;
    }

    pub async fn tick(self: &Arc<Self>) {
        self.drain_completed_cycles().await;
        self.check_watchdog().await;
        self.maybe_start_cycle().await;
    }
}

/// Background task: drives the 1Hz tick loop and subscribes to
/// `Event::CorruptionDetected` to trigger healing out of band from the
/// regular cycle schedule, then to `Event::RecoveryComplete`/
/// `Event::RecoveryFailed` to leave `healing` once the storage engine's
/// recovery attempt finishes.
pub async fn run_tick_loop(fsm: Arc<HubFsm>) {
    let mut events = fsm.bus.subscribe();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(HUB_TICK_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                fsm.tick().await;
            }
            Ok(event) = events.recv() => {
                match event {
                    Event::CorruptionDetected { table } => fsm.begin_healing(table).await,
                    Event::RecoveryComplete { table } => fsm.end_healing(table, true).await,
                    Event::RecoveryFailed { table } => fsm.end_healing(table, false).await,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::storage::StorageEngine;

    async fn test_fsm() -> Arc<HubFsm> {
        let bus = EventBus::new();
        let dir = tempfile::TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), bus.clone()).unwrap();
        let tasks_table = engine.open_table("tasks").await.unwrap();
        let dead_letter_table = engine.open_table("dead_letter").await.unwrap();
        let goals_table = engine.open_table("goals").await.unwrap();
        let ledger_table = engine.open_table("ledger").await.unwrap();
        let tasks = Arc::new(TaskQueue::new(tasks_table, dead_letter_table, bus.clone()).await.unwrap());
        let goals = Arc::new(GoalBacklog::new(goals_table, bus.clone()).await.unwrap());
        let ledger = Arc::new(CostLedger::new(ledger_table, crate::config::RuntimeConfig::from_env()).await.unwrap());
        Arc::new(HubFsm::new(tasks, goals, ledger, bus))
    }

    #[tokio::test]
    async fn starts_resting() {
        let fsm = test_fsm().await;
        assert_eq!(fsm.state().await, HubState::Resting);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let fsm = test_fsm().await;
        assert!(fsm.transition(HubState::Healing, "test").await.is_ok());
        assert!(fsm.transition(HubState::Improving, "test").await.is_err());
    }

    #[tokio::test]
    async fn force_transition_always_succeeds() {
        let fsm = test_fsm().await;
        fsm.force_transition(HubState::Contemplating, "forced").await;
        assert_eq!(fsm.state().await, HubState::Contemplating);
    }

    #[tokio::test]
    async fn a_full_cycle_returns_to_resting() {
        let fsm = test_fsm().await;
        let goal = fsm
            .goals
            .submit("do the thing".to_string(), crate::models::Priority::Normal, vec!["criterion".to_string()])
            .await
            .unwrap();
        fsm.maybe_start_cycle().await;
        assert_eq!(fsm.state().await, HubState::Executing);

        // The cycle re-arms itself while the goal's child task is unresolved;
        // complete it partway through so the goal finishes and the fsm has
        // somewhere to land besides another executing cycle.
        let mut child_completed = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            fsm.drain_completed_cycles().await;

            if !child_completed {
                if let Ok(updated) = fsm.goals.get(&goal.id).await {
                    if let Some(child_id) = updated.child_task_ids.first().cloned() {
                        if let Ok(assigned) = fsm.tasks.assign(&child_id, "agent-1", None, None).await {
                            let _ = fsm
                                .tasks
                                .complete(&assigned.id, assigned.generation, std::collections::HashMap::new(), None)
                                .await;
                            child_completed = true;
                        }
                    }
                }
            }

            if fsm.state().await == HubState::Resting {
                break;
            }
        }
        assert_eq!(fsm.state().await, HubState::Resting);
    }

    #[tokio::test]
    async fn healing_attempts_are_capped_within_the_window() {
        let fsm = test_fsm().await;
        for _ in 0..HEALING_MAX_ATTEMPTS {
            assert!(fsm.can_attempt_healing().await);
            fsm.healing_attempts.lock().await.push_back(Utc::now());
        }
        assert!(!fsm.can_attempt_healing().await);
    }

    #[tokio::test]
    async fn end_healing_returns_to_resting() {
        let fsm = test_fsm().await;
        fsm.begin_healing("agents".to_string()).await;
        assert_eq!(fsm.state().await, HubState::Healing);

        fsm.end_healing("agents".to_string(), true).await;
        assert_eq!(fsm.state().await, HubState::Resting);
    }

    #[tokio::test]
    async fn end_healing_is_a_no_op_outside_healing() {
        let fsm = test_fsm().await;
        assert_eq!(fsm.state().await, HubState::Resting);
        fsm.end_healing("agents".to_string(), true).await;
        assert_eq!(fsm.state().await, HubState::Resting);
        assert!(fsm.history().await.is_empty());
    }
}
