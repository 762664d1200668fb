//! Event-driven scheduler pairing queued tasks with idle agents.
//! Stateless apart from a small map of pending fallback timers — the
//! `route` function itself is pure and lives entirely in this module plus
//! `scoring.rs`.

pub mod scoring;

use crate::agents::PresenceRegistry;
use crate::bus::{Event, EventBus};
use crate::config::RuntimeConfig;
use crate::endpoints::EndpointRegistry;
use crate::models::*;
use crate::rate_limit::AgentRateLimiter;
use crate::tasks::TaskQueue;
use scoring::{model_is_loaded, score_candidate, ScoringInput};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

const RECENT_REPO_CAPACITY: usize = 20;
const RAM_BASELINE_MB: f64 = 8_000.0;
pub const CLOUD_API_ENDPOINT_ID: &str = "cloud_api";

pub enum RouteOutcome {
    Assign {
        agent: Agent,
        decision: RoutingDecision,
    },
    Unavailable {
        reason: String,
        fallback_tier: Option<Tier>,
    },
}

/// Pure routing decision. `forced_tier` overrides
/// `task.complexity.effective_tier`, used when retrying at the fallback tier.
pub fn route(
    task: &Task,
    idle_agents: &[Agent],
    endpoints: &[EndpointView],
    default_model: &str,
    recent_repos: &HashMap<EndpointId, HashSet<String>>,
    forced_tier: Option<Tier>,
) -> RouteOutcome {
    let original_tier = task.complexity.effective_tier.effective();
    let tier = forced_tier.unwrap_or(original_tier).effective();
    let target_type = TargetType::from(tier);
    let fallback_used = forced_tier.is_some();

    let capable_agents: Vec<&Agent> = idle_agents
        .iter()
        .filter(|a| a.satisfies(&task.needed_capabilities))
        .collect();

    let (selected_agent, selected_endpoint, selected_model, candidate_count) = match target_type {
        TargetType::Sidecar => {
            let Some(agent) = capable_agents.first() else {
                return unavailable(tier, "no idle capability-matching agent for trivial tier");
            };
            ((*agent).clone(), None, None, capable_agents.len())
        }
        TargetType::Ollama => {
            if capable_agents.is_empty() {
                return unavailable(tier, "no idle capability-matching agent for standard tier");
            }
            let healthy: Vec<&EndpointView> = endpoints
                .iter()
                .filter(|e| e.status == EndpointStatus::Healthy && e.record.models.iter().any(|m| m == default_model))
                .collect();
            if healthy.is_empty() {
                return unavailable(tier, "no healthy ollama endpoint serving the configured model");
            }
            let mut scored: Vec<(&EndpointView, f64)> = healthy
                .iter()
                .map(|view| {
                    let repo_affinity = task
                        .metadata
                        .get("repo")
                        .and_then(|v| v.as_str())
                        .map(|repo| {
                            recent_repos
                                .get(&view.record.id)
                                .map(|set| set.contains(repo))
                                .unwrap_or(false)
                        })
                        .unwrap_or(false);
                    let input = ScoringInput {
                        resources: &view.resources,
                        model: default_model,
                        model_loaded: model_is_loaded(&view.resources, default_model),
                        repo_affinity,
                        ram_baseline_mb: RAM_BASELINE_MB,
                    };
                    (*view, score_candidate(&input))
                })
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let top = scored[0].0;
            (
                capable_agents[0].clone(),
                Some(top.record.id.clone()),
                Some(default_model.to_string()),
                healthy.len(),
            )
        }
        TargetType::CloudApi => {
            let cloud_agents: Vec<&&Agent> = capable_agents.iter().filter(|a| a.is_cloud_api_capable()).collect();
            let Some(agent) = cloud_agents.first() else {
                return unavailable(tier, "no idle cloud_api-capable agent for complex tier");
            };
            (
                (**agent).clone(),
                Some(CLOUD_API_ENDPOINT_ID.to_string()),
                None,
                cloud_agents.len(),
            )
        }
    };

    let decision = RoutingDecision {
        effective_tier: tier,
        target_type,
        selected_endpoint,
        selected_model,
        fallback_used,
        fallback_from_tier: if fallback_used { Some(original_tier) } else { None },
        fallback_reason: if fallback_used {
            Some(format!("{original_tier:?} unavailable, fell back to {tier:?}"))
        } else {
            None
        },
        candidate_count,
        classification_reason: task.complexity.reason.clone(),
        decided_at: chrono::Utc::now().timestamp_millis(),
    };

    RouteOutcome::Assign {
        agent: selected_agent,
        decision,
    }
}

fn unavailable(tier: Tier, reason: &str) -> RouteOutcome {
    RouteOutcome::Unavailable {
        reason: reason.to_string(),
        fallback_tier: tier.one_step_neighbors().first().copied(),
    }
}

struct FallbackEntry {
    fallback_tier: Tier,
    cancel: Arc<Notify>,
}

pub struct Scheduler {
    task_queue: Arc<TaskQueue>,
    presence: Arc<PresenceRegistry>,
    endpoints: Arc<EndpointRegistry>,
    rate_limiter: Arc<AgentRateLimiter>,
    config: RuntimeConfig,
    bus: EventBus,
    pending_fallbacks: Mutex<HashMap<TaskId, FallbackEntry>>,
    recent_repos: RwLock<HashMap<EndpointId, VecDeque<String>>>,
}

impl Scheduler {
    pub fn new(
        task_queue: Arc<TaskQueue>,
        presence: Arc<PresenceRegistry>,
        endpoints: Arc<EndpointRegistry>,
        rate_limiter: Arc<AgentRateLimiter>,
        config: RuntimeConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            task_queue,
            presence,
            endpoints,
            rate_limiter,
            config,
            bus,
            pending_fallbacks: Mutex::new(HashMap::new()),
            recent_repos: RwLock::new(HashMap::new()),
        }
    }

    /// One round: snapshot idle agents/queued order/endpoints once, then
    /// attempt to route each queued task in priority order.
    pub async fn try_schedule_all(self: &Arc<Self>) {
        let mut idle_agents: Vec<Agent> = self.presence.list_idle().await;
        idle_agents.retain(|a| !self.rate_limiter.is_limited(&a.agent_id));

        let order = self.task_queue.peek_queue_order().await;
        let endpoints = self.endpoints.list_endpoints().await.unwrap_or_default();
        let default_model = self.config.default_ollama_model();
        let recent_repos = self.recent_repos.read().await.clone();

        for task_id in order {
            let Ok(task) = self.task_queue.get(&task_id).await else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }

            match route(&task, &idle_agents, &endpoints, &default_model, &recent_repos, None) {
                RouteOutcome::Assign { agent, decision } => {
                    if let Err(e) = self.commit_assignment(&task, &agent, decision).await {
                        warn!("assignment race for task {}: {}", task.id, e);
                        continue;
                    }
                    idle_agents.retain(|a| a.agent_id != agent.agent_id);
                }
                RouteOutcome::Unavailable { reason, fallback_tier } => {
                    info!("task {} unavailable at preferred tier: {}", task.id, reason);
                    if let Some(fallback_tier) = fallback_tier {
                        self.arm_fallback(task.id.clone(), fallback_tier);
                    }
                }
            }
        }
    }

    async fn commit_assignment(&self, task: &Task, agent: &Agent, decision: RoutingDecision) -> crate::Result<()> {
        let assigned = self
            .task_queue
            .assign(&task.id, &agent.agent_id, task.complete_by, Some(decision.clone()))
            .await?;
        self.presence
            .push_task(&agent.agent_id, assigned.id.clone(), self.task_queue.clone(), self.config.clone())
            .await?;
        if let Some(endpoint_id) = &decision.selected_endpoint {
            self.remember_repo_affinity(endpoint_id, task).await;
        }
        self.cancel_fallback(&task.id).await;
        Ok(())
    }

    async fn remember_repo_affinity(&self, endpoint_id: &str, task: &Task) {
        let Some(repo) = task.metadata.get("repo").and_then(|v| v.as_str()) else {
            return;
        };
        let mut repos = self.recent_repos.write().await;
        let entry = repos.entry(endpoint_id.to_string()).or_insert_with(VecDeque::new);
        if !entry.contains(&repo.to_string()) {
            entry.push_back(repo.to_string());
            if entry.len() > RECENT_REPO_CAPACITY {
                entry.pop_front();
            }
        }
    }

    /// Arms a fallback timer of `fallback_wait_ms`, re-read from config at
    /// arm time. A task already awaiting a fallback attempt
    /// keeps its existing timer.
    fn arm_fallback(self: &Arc<Self>, task_id: TaskId, fallback_tier: Tier) {
        let scheduler = self.clone();
        let cancel = Arc::new(Notify::new());
        tokio::spawn(async move {
            {
                let mut pending = scheduler.pending_fallbacks.lock().await;
                if pending.contains_key(&task_id) {
                    return;
                }
                pending.insert(
                    task_id.clone(),
                    FallbackEntry {
                        fallback_tier,
                        cancel: cancel.clone(),
                    },
                );
            }

            let wait_ms = scheduler.config.fallback_wait_ms();
            tokio::select! {
                _ = cancel.notified() => {
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(wait_ms)) => {}
            }

            scheduler.pending_fallbacks.lock().await.remove(&task_id);
            scheduler.fire_fallback(&task_id, fallback_tier).await;
        });
    }

    async fn fire_fallback(self: &Arc<Self>, task_id: &str, fallback_tier: Tier) {
        let Ok(task) = self.task_queue.get(task_id).await else {
            return;
        };
        if task.status != TaskStatus::Queued {
            return;
        }

        let idle_agents: Vec<Agent> = self
            .presence
            .list_idle()
            .await
            .into_iter()
            .filter(|a| !self.rate_limiter.is_limited(&a.agent_id))
            .collect();
        let endpoints = self.endpoints.list_endpoints().await.unwrap_or_default();
        let default_model = self.config.default_ollama_model();
        let recent_repos = self.recent_repos.read().await.clone();

        match route(&task, &idle_agents, &endpoints, &default_model, &recent_repos, Some(fallback_tier)) {
            RouteOutcome::Assign { agent, decision } => {
                if let Err(e) = self.commit_assignment(&task, &agent, decision).await {
                    warn!("fallback assignment failed for task {}: {}", task_id, e);
                }
            }
            RouteOutcome::Unavailable { reason, .. } => {
                info!("fallback tier also unavailable for task {}: {}", task_id, reason);
            }
        }
    }

    async fn cancel_fallback(&self, task_id: &str) {
        if let Some(entry) = self.pending_fallbacks.lock().await.remove(task_id) {
            entry.cancel.notify_one();
        }
    }

    /// Subscribes to the events that can change what's schedulable and
    /// re-runs a scheduling round on each; also cancels any pending fallback when a
    /// task leaves the queue through a path other than this scheduler
    /// (e.g. direct dead-letter admin action).
    pub async fn run_event_loop(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => match event {
                    Event::TaskSubmitted { .. }
                    | Event::TaskRetried { .. }
                    | Event::TaskReclaimed { .. }
                    | Event::AgentJoined { .. }
                    | Event::AgentIdle { .. }
                    | Event::EndpointChanged { .. } => {
                        self.try_schedule_all().await;
                    }
                    Event::TaskCompleted { task_id } | Event::TaskDeadLetter { task_id } => {
                        self.cancel_fallback(&task_id).await;
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
