//! HTTP surface: task/agent/endpoint/goal CRUD, the dashboard and ledger
//! read endpoints, hub admin controls, and the websocket upgrade route, all
//! behind the same auth and rate-limit middleware stack.
use crate::auth::{auth_middleware, create_auth_state};
use crate::dashboard::DashboardSnapshotter;
use crate::models::{EndpointSource, GoalId, HubState, Priority, TaskId, TaskStatus};
use crate::rate_limit::{rate_limit_middleware, HttpRateLimiter};
use crate::tasks::TaskFilter;
use crate::validation::TaskContentValidator;
use crate::ws::{self, WsState};
use crate::Hub;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct ApiState {
    hub: Hub,
    validator: Arc<TaskContentValidator>,
}

pub fn build_router(hub: Hub, allowed_origins: Vec<String>, admin_api_key: String) -> Router {
    let ws_state = WsState {
        presence: hub.presence.clone(),
        tasks: hub.tasks.clone(),
        endpoints: hub.endpoints.clone(),
        rate_limiter: hub.rate_limiter.clone(),
        connections: hub.connections.clone(),
        bus: hub.bus.clone(),
        config: hub.config.clone(),
    };

    let api_state = ApiState {
        hub,
        validator: Arc::new(TaskContentValidator::default()),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_origin(AllowOrigin::list(
            allowed_origins.into_iter().filter_map(|o| o.parse::<HeaderValue>().ok()),
        ));

    let auth_state = create_auth_state(admin_api_key);
    let http_rate_limiter = Arc::new(HttpRateLimiter::new());

    let protected = Router::new()
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/dead-letter", get(list_dead_letter_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/agents", get(list_agents))
        .route("/agents/states", get(agent_states))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/state", get(get_agent_state))
        .route("/endpoints", post(register_endpoint).get(list_endpoints))
        .route("/goals", post(submit_goal).get(list_goals))
        .route("/goals/{id}", get(get_goal))
        .route("/ledger/stats", get(ledger_stats))
        .route("/hub/state", get(hub_state))
        .route("/hub/history", get(hub_history))
        .route("/hub/pause", post(hub_pause))
        .route("/hub/resume", post(hub_resume))
        .route("/hub/stop", post(hub_stop))
        .route("/hub/start", post(hub_start))
        .layer(axum::middleware::from_fn_with_state(auth_state, auth_middleware))
        .layer(axum::middleware::from_fn_with_state(http_rate_limiter, rate_limit_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::upgrade_handler))
        .with_state(ws_state)
        .merge(
            Router::new()
                .route("/dashboard/state", get(dashboard_state))
                .with_state(api_state.clone()),
        )
        .merge(protected.with_state(api_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

fn error_response(err: crate::HubError) -> Response {
    let status = match &err {
        crate::HubError::NotFound(_) => StatusCode::NOT_FOUND,
        crate::HubError::InvalidState { .. } | crate::HubError::StaleGeneration { .. } | crate::HubError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        crate::HubError::BudgetExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        crate::HubError::Unauthorized => StatusCode::UNAUTHORIZED,
        crate::HubError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

use axum::response::Response;

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    description: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    needed_capabilities: std::collections::HashSet<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    max_retries: Option<u32>,
    complete_by: Option<i64>,
}

async fn submit_task(State(state): State<ApiState>, Json(body): Json<SubmitTaskRequest>) -> Response {
    if let Err(e) = state.validator.validate_and_sanitize_task_content(&body.description) {
        return error_response(e);
    }
    let params = crate::models::SubmitTaskParams {
        description: body.description,
        priority: body.priority,
        needed_capabilities: body.needed_capabilities,
        metadata: body.metadata,
        max_retries: body.max_retries,
        complete_by: body.complete_by,
    };
    match state.hub.tasks.submit(params).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    status: Option<TaskStatus>,
    priority: Option<Priority>,
    assigned_to: Option<String>,
}

async fn list_tasks(State(state): State<ApiState>, Query(query): Query<TaskListQuery>) -> Response {
    let filter = TaskFilter {
        status: query.status,
        priority: query.priority,
        assigned_to: query.assigned_to,
    };
    match state.hub.tasks.list(&filter).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> Response {
    match state.hub.tasks.get(&id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

async fn retry_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> Response {
    match state.hub.tasks.retry_dead_letter(&id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

async fn task_stats(State(state): State<ApiState>) -> Response {
    match state.hub.tasks.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_dead_letter_tasks(State(state): State<ApiState>) -> Response {
    match state.hub.tasks.list_dead_letter().await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_agents(State(state): State<ApiState>) -> Response {
    Json(state.hub.presence.list().await).into_response()
}

async fn agent_states(State(state): State<ApiState>) -> Response {
    let states: HashMap<String, crate::models::AgentFsmState> =
        state.hub.presence.list().await.into_iter().map(|a| (a.agent_id, a.state)).collect();
    Json(states).into_response()
}

async fn get_agent(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.hub.presence.get(&id).await {
        Some(agent) => Json(agent).into_response(),
        None => error_response(crate::HubError::NotFound(format!("agent {id}"))),
    }
}

async fn get_agent_state(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.hub.presence.get(&id).await {
        Some(agent) => Json(json!({"state": agent.state})).into_response(),
        None => error_response(crate::HubError::NotFound(format!("agent {id}"))),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterEndpointRequest {
    host: String,
    port: u16,
    #[serde(default = "default_source")]
    source: EndpointSource,
}

fn default_source() -> EndpointSource {
    EndpointSource::Manual
}

async fn register_endpoint(State(state): State<ApiState>, Json(body): Json<RegisterEndpointRequest>) -> Response {
    match state.hub.endpoints.register(body.host, body.port, body.source).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_endpoints(State(state): State<ApiState>) -> Response {
    match state.hub.endpoints.list_endpoints().await {
        Ok(views) => Json(views).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitGoalRequest {
    description: String,
    #[serde(default)]
    priority: Priority,
    success_criteria: Vec<String>,
}

async fn submit_goal(State(state): State<ApiState>, Json(body): Json<SubmitGoalRequest>) -> Response {
    match state.hub.goals.submit(body.description, body.priority, body.success_criteria).await {
        Ok(goal) => Json(goal).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_goals(State(state): State<ApiState>) -> Response {
    match state.hub.goals.list().await {
        Ok(goals) => Json(goals).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_goal(State(state): State<ApiState>, Path(id): Path<GoalId>) -> Response {
    match state.hub.goals.get(&id).await {
        Ok(goal) => Json(goal).into_response(),
        Err(e) => error_response(e),
    }
}

async fn dashboard_state(State(state): State<ApiState>) -> Response {
    let snapshotter = DashboardSnapshotter::new(
        state.hub.tasks.clone(),
        state.hub.presence.clone(),
        state.hub.endpoints.clone(),
        state.hub.ledger.clone(),
        state.hub.fsm.clone(),
        state.hub.goals.clone(),
    );
    match snapshotter.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

async fn ledger_stats(State(state): State<ApiState>) -> Response {
    Json(state.hub.ledger.stats().await).into_response()
}

async fn hub_state(State(state): State<ApiState>) -> Response {
    Json(json!({
        "state": state.hub.fsm.state().await,
        "paused": state.hub.fsm.is_paused(),
    }))
    .into_response()
}

async fn hub_history(State(state): State<ApiState>) -> Response {
    Json(state.hub.fsm.history().await).into_response()
}

// `stop` is pause plus a forced landing in `resting`; `start` is a plain
// resume, since resuming from any state the tick loop can already reach on
// its own.
async fn hub_stop(State(state): State<ApiState>) -> Response {
    state.hub.fsm.pause().await;
    state.hub.fsm.force_transition(HubState::Resting, "hub stopped via admin API").await;
    Json(json!({"state": state.hub.fsm.state().await, "paused": true})).into_response()
}

async fn hub_start(State(state): State<ApiState>) -> Response {
    state.hub.fsm.resume().await;
    Json(json!({"paused": false})).into_response()
}

async fn hub_pause(State(state): State<ApiState>) -> Response {
    state.hub.fsm.pause().await;
    Json(json!({"state": state.hub.fsm.state().await, "paused": true})).into_response()
}

async fn hub_resume(State(state): State<ApiState>) -> Response {
    state.hub.fsm.resume().await;
    Json(json!({"paused": false})).into_response()
}
