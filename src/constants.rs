//! System-wide default values for hot-reloadable config (see `config::RuntimeConfig`).
//! These are the defaults used when an environment variable is absent; every
//! value here is re-read from config on each access, never cached.

/// Default agent session heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default agent liveness TTL; eviction sweeper runs at half this interval.
pub const DEFAULT_AGENT_TTL_MS: u64 = 60_000;

/// Default acceptance timeout for a pushed task.
pub const DEFAULT_ACCEPTANCE_TIMEOUT_MS: u64 = 30_000;

/// Grace window after a session closes before its held task is reclaimed
/// and the agent is dropped from the registry. Chosen short enough that a
/// flaky reconnect still beats it in the common case.
pub const DEFAULT_DISCONNECT_GRACE_MS: u64 = 10_000;

/// Default queued-task expiry for non-trivial tiers.
pub const DEFAULT_TASK_TTL_MS: u64 = 600_000;

/// Default router fallback timer.
pub const DEFAULT_FALLBACK_WAIT_MS: u64 = 5_000;

/// Minimum duration a tier must be down before an alert fires.
pub const DEFAULT_TIER_DOWN_ALERT_THRESHOLD_MS: u64 = 60_000;

/// Default endpoint health probe interval.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 30_000;

/// Default full-table compaction sweep interval.
pub const DEFAULT_COMPACTION_INTERVAL_MS: u64 = 6 * 60 * 60 * 1000;

/// Fragmentation ratio below which compaction is skipped.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.1;

/// Default model used for standard-tier (Ollama) routing.
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3";

/// Overdue/TTL sweep cadence for the task queue.
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Number of most recent backups retained per table.
pub const BACKUP_RETENTION_COUNT: usize = 3;

/// Hub FSM tick rate.
pub const HUB_TICK_INTERVAL_SECS: u64 = 1;

/// Hub FSM watchdog: force a transition to resting if stuck this long.
pub const HUB_WATCHDOG_SECS: u64 = 2 * 60 * 60;

/// Cooldown after a healing cycle completes.
pub const HEALING_COOLDOWN_SECS: u64 = 5 * 60;

/// Maximum healing attempts allowed within `HEALING_ATTEMPT_WINDOW_SECS`.
pub const HEALING_MAX_ATTEMPTS: u32 = 3;
pub const HEALING_ATTEMPT_WINDOW_SECS: u64 = 10 * 60;

/// Depth of the Hub FSM's transition history ring buffer.
pub const HUB_HISTORY_CAPACITY: usize = 200;

/// Endpoint health transitions require this many consecutive same-polarity probes.
pub const ENDPOINT_HEALTH_DEBOUNCE_COUNT: u32 = 2;

/// Scoring constants for the standard-tier (Ollama) candidate ranking.
pub const WARM_MODEL_BONUS: f64 = 1.15;
pub const REPO_AFFINITY_BONUS: f64 = 1.05;
pub const RAM_CAP_MULTIPLIER: f64 = 1.5;
pub const VRAM_ABSENT_FACTOR: f64 = 0.9;
