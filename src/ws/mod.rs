//! WebSocket wire protocol and connection registry. Agents keep one
//! long-lived connection each; the hub pushes task assignments over it and
//! agents report status back over the same socket.
use crate::agents::PresenceRegistry;
use crate::bus::{Event, EventBus};
use crate::config::RuntimeConfig;
use crate::endpoints::EndpointRegistry;
use crate::models::{AgentId, Priority, ResourceSnapshot, RoutingDecision};
use crate::rate_limit::AgentRateLimiter;
use crate::tasks::TaskQueue;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Identify {
        agent_id: AgentId,
        token: String,
        name: Option<String>,
        #[serde(default)]
        capabilities: HashSet<String>,
        ollama_url: Option<String>,
    },
    #[serde(rename = "ping")]
    Heartbeat,
    TaskAccepted {
        task_id: String,
        generation: u64,
    },
    TaskRejected {
        task_id: String,
        generation: u64,
        reason: String,
    },
    TaskComplete {
        task_id: String,
        generation: u64,
        #[serde(default)]
        result: HashMap<String, serde_json::Value>,
        tokens_used: Option<u64>,
    },
    TaskFailed {
        task_id: String,
        generation: u64,
        error: String,
    },
    ResourceSnapshot {
        #[serde(flatten)]
        snapshot: ResourceSnapshot,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename = "identify_ok")]
    Identified { agent_id: AgentId },
    #[serde(rename = "push_task")]
    TaskPush {
        task_id: String,
        description: String,
        metadata: HashMap<String, serde_json::Value>,
        priority: Priority,
        generation: u64,
        complete_by: Option<i64>,
        routing_decision: Option<RoutingDecision>,
    },
    #[serde(rename = "identify_error")]
    Error { reason: String },
    Pong,
}

/// Live per-agent outbound channels, populated once an agent identifies and
/// removed when its socket closes. The scheduler's `task_assigned` event is
/// turned into an outbound `TaskPush` by looking the agent up here.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<AgentId, mpsc::UnboundedSender<ServerMessage>>>>,
    unknown_message_count: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, agent_id: AgentId, sender: mpsc::UnboundedSender<ServerMessage>) {
        self.connections.write().await.insert(agent_id, sender);
    }

    async fn remove(&self, agent_id: &str) {
        self.connections.write().await.remove(agent_id);
    }

    pub async fn send(&self, agent_id: &str, message: ServerMessage) -> bool {
        match self.connections.read().await.get(agent_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn unknown_message_count(&self) -> u64 {
        self.unknown_message_count.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct WsState {
    pub presence: Arc<PresenceRegistry>,
    pub tasks: Arc<TaskQueue>,
    pub endpoints: Arc<EndpointRegistry>,
    pub rate_limiter: Arc<AgentRateLimiter>,
    pub connections: ConnectionRegistry,
    pub bus: EventBus,
    pub config: RuntimeConfig,
}

pub async fn upgrade_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut agent_id: Option<AgentId> = None;

    let writer = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    use futures_util::StreamExt;
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        let Ok(client_message) = parsed else {
            state.connections.unknown_message_count.fetch_add(1, Ordering::Relaxed);
            warn!("dropping unparseable websocket message");
            continue;
        };

        if let Some(id) = &agent_id {
            if state.rate_limiter.is_limited(id) {
                let _ = tx.send(ServerMessage::Error { reason: "rate limited".to_string() });
                continue;
            }
        }

        if let Err(response) = dispatch(&state, &mut agent_id, &tx, client_message).await {
            let _ = tx.send(ServerMessage::Error { reason: response });
        }
    }

    writer.abort();
    if let Some(agent_id) = agent_id {
        state.connections.remove(&agent_id).await;
        state
            .presence
            .disconnect(&agent_id, state.tasks.clone(), state.config.clone())
            .await;
        info!("agent {} disconnected", agent_id);
    }
}

async fn dispatch(
    state: &WsState,
    agent_id: &mut Option<AgentId>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
) -> Result<(), String> {
    match message {
        ClientMessage::Identify { agent_id: id, token, name, capabilities, ollama_url } => {
            state
                .presence
                .identify(id.clone(), &token, name, capabilities, ollama_url)
                .await
                .map_err(|e| e.to_string())?;
            state.connections.insert(id.clone(), tx.clone()).await;
            *agent_id = Some(id.clone());
            let _ = tx.send(ServerMessage::Identified { agent_id: id });
            Ok(())
        }
        ClientMessage::Heartbeat => {
            let id = current_agent(agent_id)?;
            state.presence.heartbeat(&id).await.map_err(|e| e.to_string())?;
            let _ = tx.send(ServerMessage::Pong);
            Ok(())
        }
        ClientMessage::TaskAccepted { task_id, generation } => {
            let id = current_agent(agent_id)?;
            state
                .presence
                .task_accepted(&id, &task_id, generation, &state.tasks)
                .await
                .map_err(|e| e.to_string())
        }
        ClientMessage::TaskRejected { task_id, generation, reason } => {
            let id = current_agent(agent_id)?;
            state
                .presence
                .task_rejected(&id, &task_id, generation, reason, &state.tasks)
                .await
                .map_err(|e| e.to_string())
        }
        ClientMessage::TaskComplete { task_id, generation, result, tokens_used } => {
            let id = current_agent(agent_id)?;
            state
                .presence
                .task_complete(&id, &task_id, generation, result, tokens_used, &state.tasks)
                .await
                .map_err(|e| e.to_string())
        }
        ClientMessage::TaskFailed { task_id, generation, error } => {
            let id = current_agent(agent_id)?;
            state
                .presence
                .task_failed(&id, &task_id, generation, error, &state.tasks)
                .await
                .map_err(|e| e.to_string())
        }
        ClientMessage::ResourceSnapshot { snapshot } => {
            let id = current_agent(agent_id)?;
            state.endpoints.push_resource_snapshot(&id, snapshot).await;
            Ok(())
        }
    }
}

fn current_agent(agent_id: &Option<AgentId>) -> Result<AgentId, String> {
    agent_id.clone().ok_or_else(|| "identify before sending messages".to_string())
}

/// Background task: turns `task_assigned` bus events into outbound
/// `TaskPush` frames for whichever agent the task landed on, looking the
/// task back up by id to carry its full assignment — including the
/// `generation` the agent must echo back in `task_complete`/`task_failed`.
pub async fn run_dispatch_loop(bus: EventBus, connections: ConnectionRegistry, tasks: Arc<TaskQueue>) {
    let mut events = bus.subscribe();
    loop {
        match events.recv().await {
            Ok(Event::TaskAssigned { task_id, agent_id, .. }) => {
                let Ok(task) = tasks.get(&task_id).await else {
                    warn!("task {} vanished before it could be pushed to {}", task_id, agent_id);
                    continue;
                };
                let delivered = connections
                    .send(
                        &agent_id,
                        ServerMessage::TaskPush {
                            task_id: task.id.clone(),
                            description: task.description.clone(),
                            metadata: task.metadata.clone(),
                            priority: task.priority,
                            generation: task.generation,
                            complete_by: task.complete_by,
                            routing_decision: task.routing_decision,
                        },
                    )
                    .await;
                if !delivered {
                    warn!("no live connection for agent {} to push task {}", agent_id, task_id);
                }
            }
            Ok(_) => {}
            Err(_) => continue,
        }
    }
}
