//! A standard-tier task with no healthy Ollama endpoint falls back, after
//! `fallback_wait_ms`, to the complex tier and is assigned to the one
//! idle `cloud_api`-capable agent online.

use agentcom_hub::config::{RuntimeConfig, StaticConfig};
use agentcom_hub::models::{AgentFsmState, Priority, SubmitTaskParams, TaskStatus};
use agentcom_hub::Hub;
use std::collections::HashSet;

fn static_config(dir: &std::path::Path) -> StaticConfig {
    StaticConfig {
        bind_host: "127.0.0.1".to_string(),
        bind_port: 0,
        data_dir: dir.to_path_buf(),
        admin_api_key: "a".repeat(32),
        allowed_origins: vec!["http://localhost:3000".to_string()],
    }
}

#[tokio::test]
async fn standard_tier_falls_back_to_complex_after_timeout() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = RuntimeConfig::from_env();
    config.set_fallback_wait_ms(50);
    let hub = Hub::new(static_config(dir.path()), config).await.unwrap();

    let mut capabilities = HashSet::new();
    capabilities.insert("cloud_api".to_string());
    hub.presence
        .identify("agent-cloud".to_string(), "test-token", None, capabilities, None)
        .await
        .unwrap();

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("complexity_hint".to_string(), serde_json::Value::String("standard".to_string()));
    let task = hub
        .tasks
        .submit(SubmitTaskParams {
            description: "pin this to standard tier".to_string(),
            priority: Priority::Normal,
            needed_capabilities: Default::default(),
            metadata,
            max_retries: None,
            complete_by: None,
        })
        .await
        .unwrap();

    // First round: no healthy ollama endpoint exists, so the task stays
    // queued and a fallback timer is armed.
    hub.scheduler.try_schedule_all().await;
    let still_queued = hub.tasks.get(&task.id).await.unwrap();
    assert_eq!(still_queued.status, TaskStatus::Queued);

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let after_fallback = hub.tasks.get(&task.id).await.unwrap();
    assert_eq!(after_fallback.status, TaskStatus::Assigned);
    assert_eq!(after_fallback.assigned_to.as_deref(), Some("agent-cloud"));

    let decision = after_fallback.routing_decision.expect("fallback assignment records a routing decision");
    assert!(decision.fallback_used);
    assert_eq!(decision.fallback_from_tier, Some(agentcom_hub::models::Tier::Standard));
    assert_eq!(decision.effective_tier, agentcom_hub::models::Tier::Complex);

    let agent = hub.presence.get("agent-cloud").await.unwrap();
    assert_eq!(agent.state, AgentFsmState::Assigned);
}
