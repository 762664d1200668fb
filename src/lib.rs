//! # AgentCom Hub
//!
//! The coordination engine for a fleet of autonomous coding agents. Agents
//! (each a separate process fronted by a sidecar) maintain persistent
//! WebSocket sessions with the hub; operators and other clients submit work
//! through the HTTP surface; the hub dispatches tasks to agents, tracks
//! outcomes, persists state across restarts, and drives higher-level
//! autonomous behavior through the Hub FSM.
//!
//! ## Architecture
//!
//! Leaf-first dependency order: the [`storage`] engine and [`bus`] underpin
//! everything above them; [`agents`] presence/FSM and the [`tasks`] queue
//! sit above storage; [`router`] pairs the two via [`endpoints`] and
//! [`classifier`]; [`ledger`], [`hub_fsm`], and [`goals`] drive autonomous
//! behavior on top of all of it; [`dashboard`] is a read-only fan-out
//! reader over the whole stack. [`ws`] and [`api`] are the external wire
//! surfaces that delegate into the core.

/// Agent presence registry and per-agent state machine
pub mod agents;
/// Axum HTTP surface (§6 routes, thin delegation into the core)
pub mod api;
/// Bearer-token auth middleware for the HTTP surface
pub mod auth;
/// In-process topic-based event bus
pub mod bus;
/// Pure task-complexity classifier
pub mod classifier;
/// Startup configuration loading and the hot-reloadable runtime handle
pub mod config;
/// Tunable default values
pub mod constants;
/// Dashboard read-only state snapshotter
pub mod dashboard;
/// Durable endpoint registry, health probing, resource snapshots
pub mod endpoints;
/// Error types and the crate-wide `Result` alias
pub mod error;
/// Durable goal backlog and orchestrator
pub mod goals;
/// Singleton autonomous-cycle state machine
pub mod hub_fsm;
/// Rolling-window invocation cost ledger
pub mod ledger;
/// Core data models: Task, Agent, Endpoint, Goal, RoutingDecision, ...
pub mod models;
/// HTTP request / agent-dispatch rate limiting
pub mod rate_limit;
/// Tier-aware scheduler and pure routing/scoring functions
pub mod router;
/// Secure token generation
pub mod security;
/// Durable keyed storage engine underpinning every other component
pub mod storage;
/// Durable task queue with generation fencing and dead-lettering
pub mod tasks;
/// Submit-time input validation
pub mod validation;
/// Agent session WebSocket handler (wire protocol)
pub mod ws;

pub use error::{HubError, Result};

use std::sync::Arc;

/// Every long-lived singleton, constructed once in dependency order and
/// cloned (cheap, `Arc`-backed) into whichever task needs it.
#[derive(Clone)]
pub struct Hub {
    pub storage: Arc<storage::StorageEngine>,
    pub bus: bus::EventBus,
    pub presence: Arc<agents::PresenceRegistry>,
    pub tasks: Arc<tasks::TaskQueue>,
    pub endpoints: Arc<endpoints::EndpointRegistry>,
    pub rate_limiter: Arc<rate_limit::AgentRateLimiter>,
    pub scheduler: Arc<router::Scheduler>,
    pub ledger: Arc<ledger::CostLedger>,
    pub goals: Arc<goals::GoalBacklog>,
    pub fsm: Arc<hub_fsm::HubFsm>,
    pub connections: ws::ConnectionRegistry,
    pub config: config::RuntimeConfig,
}

impl Hub {
    /// Builds every singleton in leaf-first dependency order: storage, bus,
    /// presence, task queue, endpoint registry, scheduler, cost ledger,
    /// goal backlog, hub FSM.
    pub async fn new(static_config: config::StaticConfig, config: config::RuntimeConfig) -> Result<Self> {
        let bus = bus::EventBus::new();
        let storage = Arc::new(storage::StorageEngine::open(static_config.data_dir.clone(), bus.clone())?);

        let agents_table = storage.open_table("agents").await?;
        let presence = Arc::new(agents::PresenceRegistry::new(agents_table, bus.clone()).await?);

        let tasks_table = storage.open_table("tasks").await?;
        let dead_letter_table = storage.open_table("dead_letter").await?;
        let tasks = Arc::new(tasks::TaskQueue::new(tasks_table, dead_letter_table, bus.clone()).await?);

        let endpoints_table = storage.open_table("endpoints").await?;
        let endpoints = Arc::new(endpoints::EndpointRegistry::new(endpoints_table, bus.clone()).await?);

        let rate_limiter = Arc::new(rate_limit::AgentRateLimiter::new());

        let scheduler = Arc::new(router::Scheduler::new(
            tasks.clone(),
            presence.clone(),
            endpoints.clone(),
            rate_limiter.clone(),
            config.clone(),
            bus.clone(),
        ));

        let ledger_table = storage.open_table("ledger").await?;
        let ledger = Arc::new(ledger::CostLedger::new(ledger_table, config.clone()).await?);

        let goals_table = storage.open_table("goals").await?;
        let goals = Arc::new(goals::GoalBacklog::new(goals_table, bus.clone()).await?);

        let fsm = Arc::new(hub_fsm::HubFsm::new(
            tasks.clone(),
            goals.clone(),
            ledger.clone(),
            bus.clone(),
        ));

        let connections = ws::ConnectionRegistry::new();

        Ok(Self {
            storage,
            bus,
            presence,
            tasks,
            endpoints,
            rate_limiter,
            scheduler,
            ledger,
            goals,
            fsm,
            connections,
            config,
        })
    }

    /// Spawns every background loop (sweeps, probes, ticks). Returns
    /// immediately; loops run until the process exits.
    pub fn spawn_background_tasks(&self) {
        tokio::spawn(tasks::run_sweeper(self.tasks.clone(), self.config.clone()));
        tokio::spawn(storage::run_periodic(self.storage.clone(), self.config.clone()));
        tokio::spawn(storage::run_corruption_watcher(self.storage.clone(), self.bus.clone()));
        tokio::spawn(endpoints::run_periodic(self.endpoints.clone(), self.config.clone()));
        tokio::spawn(self.presence.clone().run_liveness_sweeper(self.tasks.clone(), self.config.clone()));
        tokio::spawn(self.scheduler.clone().run_event_loop());
        tokio::spawn(hub_fsm::run_tick_loop(self.fsm.clone()));
        tokio::spawn(ledger::run_periodic(self.ledger.clone()));
        tokio::spawn(ws::run_dispatch_loop(self.bus.clone(), self.connections.clone(), self.tasks.clone()));
    }

    pub async fn shutdown(&self) {
        self.fsm.pause().await;
        self.storage.close().await;
    }
}
