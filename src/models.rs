use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type TaskId = String;
pub type AgentId = String;
pub type EndpointId = String;
pub type GoalId = String;

/// Task priority. Ord is numeric ascending — `Urgent` (0) sorts before
/// `Low` (3), so a plain `BTreeSet<(Priority, ..)>` dequeues urgent first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Task lifecycle status. Names normalized for consistency across the HTTP and websocket surfaces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Completed,
    DeadLetter,
}

/// Complexity tier a task is classified into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Trivial,
    Standard,
    Complex,
    Unknown,
}

impl Tier {
    /// `unknown` is treated as `standard` everywhere routing consults it.
    pub fn effective(self) -> Tier {
        match self {
            Tier::Unknown => Tier::Standard,
            other => other,
        }
    }

    pub fn one_step_neighbors(self) -> &'static [Tier] {
        match self.effective() {
            Tier::Trivial => &[Tier::Standard],
            // Escalate before de-escalating: a standard task stuck on capacity
            // is more often missing headroom than mis-classified, so complex
            // is the fallback `unavailable()` proposes first.
            Tier::Standard => &[Tier::Complex, Tier::Trivial],
            Tier::Complex => &[Tier::Standard],
            Tier::Unknown => &[],
        }
    }
}

/// Execution target a tier maps to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Sidecar,
    Ollama,
    CloudApi,
}

impl From<Tier> for TargetType {
    fn from(tier: Tier) -> Self {
        match tier.effective() {
            Tier::Trivial => TargetType::Sidecar,
            Tier::Standard => TargetType::Ollama,
            Tier::Complex => TargetType::CloudApi,
            Tier::Unknown => TargetType::Ollama,
        }
    }
}

/// Classifier output cached on a task at submit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Complexity {
    pub effective_tier: Tier,
    pub reason: String,
}

/// Structured record captured at assignment. Immutable once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub effective_tier: Tier,
    pub target_type: TargetType,
    pub selected_endpoint: Option<EndpointId>,
    pub selected_model: Option<String>,
    pub fallback_used: bool,
    pub fallback_from_tier: Option<Tier>,
    pub fallback_reason: Option<String>,
    pub candidate_count: usize,
    pub classification_reason: String,
    pub decided_at: i64,
}

/// One entry in a task's append-only audit trail. Not authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub needed_capabilities: HashSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub max_retries: u32,
    pub complete_by: Option<i64>,

    pub status: TaskStatus,
    pub assigned_to: Option<AgentId>,
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub result: Option<HashMap<String, serde_json::Value>>,
    pub tokens_used: Option<u64>,

    pub generation: u64,
    pub routing_decision: Option<RoutingDecision>,
    pub complexity: Complexity,
    pub history: Vec<HistoryEntry>,

    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    pub fn push_history(&mut self, event: &str, details: impl Into<String>) {
        self.history.push(HistoryEntry {
            event: event.to_string(),
            timestamp: chrono::Utc::now(),
            details: details.into(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitTaskParams {
    pub description: String,
    pub priority: Priority,
    pub needed_capabilities: HashSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub max_retries: Option<u32>,
    pub complete_by: Option<i64>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-agent FSM state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentFsmState {
    Idle,
    Assigned,
    Working,
    Offline,
}

/// A declared agent capability; version absent means wildcard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Capability {
    pub name: String,
    pub version: Option<String>,
}

impl Capability {
    pub fn matches(&self, required: &Capability) -> bool {
        self.name == required.name
            && (required.version.is_none() || self.version == required.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub name: Option<String>,
    pub capabilities: HashSet<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub ollama_url: Option<String>,
    pub state: AgentFsmState,
    pub current_task_id: Option<TaskId>,
}

impl Agent {
    /// Every name in `needed` must appear in the agent's declared capability set.
    pub fn satisfies(&self, needed: &HashSet<String>) -> bool {
        needed.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn is_cloud_api_capable(&self) -> bool {
        self.capabilities.contains("cloud_api")
    }
}

/// Durable fields for an LLM host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub host: String,
    pub port: u16,
    pub source: EndpointSource,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    Manual,
    Discovered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Ephemeral, process-memory-only resource snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub ram_used_mb: f64,
    pub ram_total_mb: f64,
    pub vram_used_mb: Option<f64>,
    pub vram_total_mb: Option<f64>,
    pub models_running: Vec<String>,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointView {
    pub record: EndpointRecord,
    pub status: EndpointStatus,
    pub resources: ResourceSnapshot,
}

/// Goal lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Submitted,
    Decomposing,
    Executing,
    Verifying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub description: String,
    pub priority: Priority,
    pub success_criteria: Vec<String>,
    pub status: GoalStatus,
    pub child_task_ids: Vec<TaskId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Goal {
    pub fn new(
        id: GoalId,
        description: String,
        priority: Priority,
        success_criteria: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            description,
            priority,
            success_criteria,
            status: GoalStatus::Submitted,
            child_task_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Invocation category the cost ledger and hub FSM both key off of.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvocationCategory {
    Executing,
    Improving,
    Contemplating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub category: InvocationCategory,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tokens: Option<u64>,
    pub cost: Option<f64>,
}

/// Hub-level autonomous state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Resting,
    Executing,
    Improving,
    Contemplating,
    Healing,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
