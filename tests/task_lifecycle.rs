//! End-to-end task lifecycle scenarios: happy path, stale completion
//! rejection after a reclaim, and retry exhaustion into the dead-letter
//! table. This file is the cross-component half, driving `Hub` end to
//! end rather than a single module in isolation.

use agentcom_hub::config::{RuntimeConfig, StaticConfig};
use agentcom_hub::models::{Priority, SubmitTaskParams, TaskStatus};
use agentcom_hub::Hub;
use std::collections::HashMap;

fn static_config(dir: &std::path::Path) -> StaticConfig {
    StaticConfig {
        bind_host: "127.0.0.1".to_string(),
        bind_port: 0,
        data_dir: dir.to_path_buf(),
        admin_api_key: "a".repeat(32),
        allowed_origins: vec!["http://localhost:3000".to_string()],
    }
}

async fn test_hub(dir: &std::path::Path) -> Hub {
    Hub::new(static_config(dir), RuntimeConfig::from_env()).await.unwrap()
}

fn submit_params(description: &str) -> SubmitTaskParams {
    SubmitTaskParams {
        description: description.to_string(),
        priority: Priority::Normal,
        needed_capabilities: Default::default(),
        metadata: Default::default(),
        max_retries: None,
        complete_by: None,
    }
}

/// Scenario 1 (happy path): submit, assign, complete. The task ends up
/// `Completed` and a subsequent `get` reflects it (submit/get round-trip
/// law from §8).
#[tokio::test]
async fn happy_path_submit_assign_complete() {
    let dir = tempfile::TempDir::new().unwrap();
    let hub = test_hub(dir.path()).await;

    let task = hub.tasks.submit(submit_params("implement the new login endpoint")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let fetched = hub.tasks.get(&task.id).await.unwrap();
    assert_eq!(fetched.description, task.description);

    let assigned = hub.tasks.assign(&task.id, "agent-1", None, None).await.unwrap();
    assert_eq!(assigned.status, TaskStatus::Assigned);
    assert_eq!(assigned.generation, 1);

    let completed = hub
        .tasks
        .complete(&assigned.id, assigned.generation, HashMap::new(), Some(42))
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.tokens_used, Some(42));
}

/// Scenario 2 (stale completion after reclaim): an agent that held a task
/// reports completion after the overdue sweep already reclaimed it.
/// Generations differ, so the stale reply is rejected and the task's
/// newer assignment is untouched (§8: "for any two acknowledged completion
/// messages, their generations differ").
#[tokio::test]
async fn stale_completion_after_reclaim_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let hub = test_hub(dir.path()).await;

    let task = hub.tasks.submit(submit_params("fix whitespace in main.rs")).await.unwrap();
    let first_assignment = hub.tasks.assign(&task.id, "agent-1", None, None).await.unwrap();
    let stale_generation = first_assignment.generation;

    // The overdue sweep (or an explicit admin reclaim) returns the task to
    // the queue and bumps its generation before the original agent's reply
    // arrives.
    let reclaimed = hub.tasks.reclaim(&task.id).await.unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Queued);
    assert!(reclaimed.generation > stale_generation);

    let second_assignment = hub.tasks.assign(&task.id, "agent-2", None, None).await.unwrap();
    assert_ne!(second_assignment.generation, stale_generation);

    let stale_reply = hub
        .tasks
        .complete(&task.id, stale_generation, HashMap::new(), None)
        .await;
    assert!(stale_reply.is_err());

    // The live assignment is unaffected by the rejected stale reply.
    let still_assigned = hub.tasks.get(&task.id).await.unwrap();
    assert_eq!(still_assigned.status, TaskStatus::Assigned);
    assert_eq!(still_assigned.generation, second_assignment.generation);
}

/// Scenario 3 (retry exhaustion): a task that fails `max_retries` times in
/// a row lands in the dead-letter table, and an explicit retry brings it
/// back to `queued` with a fresh generation.
#[tokio::test]
async fn retry_exhaustion_dead_letters_then_retries() {
    let dir = tempfile::TempDir::new().unwrap();
    let hub = test_hub(dir.path()).await;

    let mut params = submit_params("investigate the flaky scheduler test");
    params.max_retries = Some(2);
    let task = hub.tasks.submit(params).await.unwrap();

    for attempt in 0..2 {
        let assigned = hub.tasks.assign(&task.id, "agent-1", None, None).await.unwrap();
        let outcome = hub
            .tasks
            .fail(&assigned.id, assigned.generation, format!("attempt {attempt} failed"))
            .await
            .unwrap();
        match outcome {
            agentcom_hub::tasks::FailOutcome::Retried(retried) => {
                assert_eq!(retried.status, TaskStatus::Queued);
            }
            agentcom_hub::tasks::FailOutcome::DeadLetter(_) => panic!("should not dead-letter before retries exhausted"),
        }
    }

    let assigned = hub.tasks.assign(&task.id, "agent-1", None, None).await.unwrap();
    let outcome = hub
        .tasks
        .fail(&assigned.id, assigned.generation, "final failure".to_string())
        .await
        .unwrap();
    let dead_id = match outcome {
        agentcom_hub::tasks::FailOutcome::DeadLetter(dead) => {
            assert_eq!(dead.status, TaskStatus::DeadLetter);
            dead.id
        }
        agentcom_hub::tasks::FailOutcome::Retried(_) => panic!("should have exhausted retries"),
    };

    let stats = hub.tasks.stats().await.unwrap();
    assert_eq!(stats.dead_letter_count, 1);
    assert!(!stats.by_status.contains_key(&TaskStatus::DeadLetter));

    let retried = hub.tasks.retry_dead_letter(&dead_id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Queued);
    assert_eq!(retried.retry_count, 0);
}

/// Scenario 5 (TTL expiry): a non-trivial task left queued past
/// `task_ttl_ms` is expired straight to dead-letter by the sweep; a
/// trivial task with the same age is exempt (§4.3).
#[tokio::test]
async fn ttl_sweep_expires_non_trivial_tasks_only() {
    let dir = tempfile::TempDir::new().unwrap();
    let hub = test_hub(dir.path()).await;
    hub.config.set_task_ttl_ms(1);

    let standard = hub.tasks.submit(submit_params("implement the new login endpoint")).await.unwrap();
    let trivial = hub.tasks.submit(submit_params("fix whitespace in main.rs")).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let expired = hub.tasks.sweep_ttl(hub.config.task_ttl_ms()).await.unwrap();
    assert_eq!(expired, 1);

    let standard_after = hub.tasks.get(&standard.id).await.unwrap();
    assert_eq!(standard_after.status, TaskStatus::DeadLetter);
    assert_eq!(standard_after.last_error.as_deref(), Some("ttl_expired"));

    let trivial_after = hub.tasks.get(&trivial.id).await.unwrap();
    assert_eq!(trivial_after.status, TaskStatus::Queued);
}

/// A `task_accepted` carrying the generation from before a reclaim is
/// rejected the same way a stale `task_complete` is; the live assignment's
/// generation, and the agent's FSM state, are untouched by the stale reply.
#[tokio::test]
async fn stale_generation_task_accepted_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let hub = test_hub(dir.path()).await;

    let mut capabilities = std::collections::HashSet::new();
    capabilities.insert("code".to_string());
    hub.presence
        .identify("agent-1".to_string(), "test-token", None, capabilities, None)
        .await
        .unwrap();

    let task = hub.tasks.submit(submit_params("refactor the session cache")).await.unwrap();
    let first_assignment = hub.tasks.assign(&task.id, "agent-1", None, None).await.unwrap();
    let stale_generation = first_assignment.generation;

    hub.tasks.reclaim(&task.id).await.unwrap();
    hub.presence
        .identify("agent-2".to_string(), "test-token", None, Default::default(), None)
        .await
        .unwrap();
    let second_assignment = hub.tasks.assign(&task.id, "agent-2", None, None).await.unwrap();

    let stale_accept = hub
        .presence
        .task_accepted("agent-1", &task.id, stale_generation, &hub.tasks)
        .await;
    assert!(stale_accept.is_err());

    let still_assigned = hub.tasks.get(&task.id).await.unwrap();
    assert_eq!(still_assigned.generation, second_assignment.generation);
}
