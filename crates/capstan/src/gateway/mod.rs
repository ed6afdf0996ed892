/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Control-side agent connection manager.
//!
//! Accepts the long-lived bidirectional channel each agent maintains,
//! authenticates it by token + machine id, routes inbound frames, and
//! serializes outbound frames through one writer task per connection.
//!
//! The gateway also owns the result-waiter table: the remote dispatcher
//! registers a single-consumer rendezvous keyed by log id before sending
//! an `execute` frame, and an inbound `task_result` frame with a matching
//! key is delivered to it. A result with no waiter — a late arrival after
//! a timeout, or a run the agent fired from its own cron — falls through
//! to a direct log-row save.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CapstanError;
use crate::frames::{
    AgentTaskSpec, ConnectedPayload, Frame, FrameKind, HeartbeatAckPayload, HeartbeatPayload,
    SchedulerConfigPayload, TaskHeartbeatPayload, TaskLogPayload, TaskResultPayload, TasksPayload,
};
use crate::livelog::{compress_to_base64, LiveLogRegistry};
use crate::models::{Agent, AgentStatus, NewAgent, TaskLog};
use crate::repository::{Repository, TaskFilter};
use crate::scheduler::RunStatus;

/// Outbound frames buffered per connection before the writer blocks.
const OUTBOUND_BUFFER: usize = 256;

struct Connection {
    generation: u64,
    outbound: mpsc::Sender<Frame>,
    stop: CancellationToken,
}

struct GatewayInner {
    repo: Arc<dyn Repository>,
    livelogs: Arc<LiveLogRegistry>,
    connections: StdMutex<HashMap<u64, Connection>>,
    waiters: StdMutex<HashMap<u64, oneshot::Sender<TaskResultPayload>>>,
    generation: AtomicU64,
}

/// The connection manager. Cheap to clone.
#[derive(Clone)]
pub struct AgentGateway {
    inner: Arc<GatewayInner>,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(default)]
    token: String,
    #[serde(default)]
    machine_id: String,
    #[serde(default)]
    name: String,
}

impl AgentGateway {
    pub fn new(repo: Arc<dyn Repository>, livelogs: Arc<LiveLogRegistry>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                repo,
                livelogs,
                connections: StdMutex::new(HashMap::new()),
                waiters: StdMutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Routes served by the control binary: the agent channel and the
    /// HTTP fallback for result reporting.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/agent/ws", get(ws_handler))
            .route("/api/agent/report", post(report_handler))
            .with_state(self.clone())
    }

    /// Registers a result waiter for a log id. The previous waiter for
    /// the same key, if any, is dropped.
    pub fn register_waiter(&self, log_id: u64) -> oneshot::Receiver<TaskResultPayload> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .insert(log_id, tx);
        rx
    }

    /// Drops the waiter for a log id, if still registered.
    pub fn unregister_waiter(&self, log_id: u64) {
        self.inner
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .remove(&log_id);
    }

    /// Whether the agent currently holds a live connection.
    pub fn is_connected(&self, agent_id: u64) -> bool {
        self.inner
            .connections
            .lock()
            .expect("connection table poisoned")
            .contains_key(&agent_id)
    }

    /// Queues a frame for an agent. Fails when the agent is not connected
    /// or its writer has fallen too far behind.
    pub fn send_to_agent(&self, agent_id: u64, frame: Frame) -> Result<(), CapstanError> {
        let outbound = {
            let connections = self
                .inner
                .connections
                .lock()
                .expect("connection table poisoned");
            connections
                .get(&agent_id)
                .map(|c| c.outbound.clone())
                .ok_or(CapstanError::AgentNotConnected(agent_id))?
        };
        outbound
            .try_send(frame)
            .map_err(|_| CapstanError::AgentNotConnected(agent_id))
    }

    /// Pushes the agent's current task list (used after task CRUD).
    pub async fn broadcast_tasks(&self, agent_id: u64) {
        if !self.is_connected(agent_id) {
            return;
        }
        match tasks_payload_for(self.inner.repo.as_ref(), agent_id).await {
            Ok(payload) => {
                let _ = self.send_to_agent(agent_id, Frame::new(FrameKind::Tasks, &payload));
            }
            Err(err) => {
                warn!(agent_id, error = %err, "failed to load tasks for broadcast");
            }
        }
    }

    /// Tells the agent its enabled flag flipped.
    pub fn notify_enabled(&self, agent_id: u64, enabled: bool) {
        let kind = if enabled {
            FrameKind::Enabled
        } else {
            FrameKind::Disabled
        };
        let _ = self.send_to_agent(agent_id, Frame::bare(kind));
    }

    /// Instructs the agent to download and install the latest binary.
    pub fn push_update(&self, agent_id: u64) -> Result<(), CapstanError> {
        self.send_to_agent(agent_id, Frame::bare(FrameKind::Update))
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .expect("connection table poisoned")
            .len()
    }

    /// Delivers a result frame to its waiter, or persists it directly
    /// when nobody is waiting. Public so the HTTP fallback route and
    /// tests share the path.
    pub async fn handle_task_result(&self, agent_id: u64, mut payload: TaskResultPayload) {
        payload.agent_id = agent_id;

        let waiter = self
            .inner
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .remove(&payload.log_id);

        match waiter {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    debug!("result waiter gone before delivery");
                }
            }
            None => {
                debug!(
                    agent_id,
                    log_id = payload.log_id,
                    "no waiter for result, saving log row directly"
                );
                if let Err(err) = persist_agent_result(self.inner.repo.as_ref(), &payload).await {
                    warn!(agent_id, error = %err, "failed to persist agent result");
                }
            }
        }
    }
}

/// Builds a `tasks` payload for everything bound to the agent.
async fn tasks_payload_for(
    repo: &dyn Repository,
    agent_id: u64,
) -> Result<TasksPayload, CapstanError> {
    let tasks = repo
        .list_tasks(TaskFilter {
            agent_id: Some(agent_id),
            ..Default::default()
        })
        .await?;

    let mut specs = Vec::with_capacity(tasks.len());
    for task in tasks {
        let envs = repo.resolve_envs(&task.env_ids).await?.join(",");
        specs.push(AgentTaskSpec {
            id: task.id,
            name: task.name,
            command: task.command,
            schedule: task.schedule,
            timeout: task.timeout_minutes,
            work_dir: task.work_dir,
            envs,
            enabled: task.enabled,
        });
    }
    Ok(TasksPayload { tasks: specs })
}

/// Saves a log row straight from a result payload (the no-waiter path).
async fn persist_agent_result(
    repo: &dyn Repository,
    payload: &TaskResultPayload,
) -> Result<(), CapstanError> {
    let status = parse_run_status(&payload.status).unwrap_or(RunStatus::Failed);

    let row = TaskLog {
        id: payload.log_id,
        task_id: payload.task_id,
        agent_id: Some(payload.agent_id),
        command: payload.command.clone(),
        status,
        duration_ms: payload.duration,
        exit_code: payload.exit_code,
        start_time: Utc.timestamp_opt(payload.start_time, 0).single(),
        end_time: Utc.timestamp_opt(payload.end_time, 0).single(),
        output: compress_to_base64(&payload.output)?,
        error: payload.error.clone(),
        created_at: Utc::now(),
    };
    repo.save_task_log(&row).await?;

    if let Some(task) = repo.get_task(payload.task_id).await? {
        if let Some(policy) = task.clean_config {
            let _ = repo.delete_old_logs(task.id, policy).await;
        }
    }
    Ok(())
}

/// Parses the wire form of a run status.
pub fn parse_run_status(status: &str) -> Option<RunStatus> {
    match status {
        "queued" => Some(RunStatus::Queued),
        "running" => Some(RunStatus::Running),
        "success" => Some(RunStatus::Success),
        "failed" => Some(RunStatus::Failed),
        "timeout" => Some(RunStatus::Timeout),
        "cancelled" => Some(RunStatus::Cancelled),
        _ => None,
    }
}

async fn ws_handler(
    State(gateway): State<AgentGateway>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Authenticate before upgrading.
    let auth = match authenticate(&gateway, &query).await {
        Ok(auth) => auth,
        Err(err) => {
            warn!(error = %err, "agent connection rejected");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(gateway, auth, socket))
}

struct AuthOutcome {
    agent: Agent,
    is_new: bool,
}

async fn authenticate(
    gateway: &AgentGateway,
    query: &ConnectQuery,
) -> Result<AuthOutcome, CapstanError> {
    if query.token.is_empty() || query.machine_id.is_empty() {
        return Err(CapstanError::Config(
            "missing token or machine_id".to_string(),
        ));
    }

    let repo = gateway.inner.repo.as_ref();

    if let Some(mut agent) = repo.find_agent_by_token(&query.token).await? {
        if !agent.enabled {
            return Err(CapstanError::AgentDisabled(agent.id));
        }
        if agent.machine_id.is_empty() {
            // First connection since registration: bind the machine.
            agent.machine_id = query.machine_id.clone();
            repo.save_agent(&agent).await?;
        } else if agent.machine_id != query.machine_id {
            return Err(CapstanError::Config(format!(
                "machine id mismatch for agent #{}",
                agent.id
            )));
        }
        return Ok(AuthOutcome {
            agent,
            is_new: false,
        });
    }

    // Unknown token: maybe a one-shot registration token.
    if repo.take_registration_token(&query.token).await? {
        let name = if query.name.is_empty() {
            let short: String = query.machine_id.chars().take(8).collect();
            format!("agent-{short}")
        } else {
            query.name.clone()
        };
        let agent = repo
            .register_agent(NewAgent {
                name,
                token: query.token.clone(),
                machine_id: query.machine_id.clone(),
            })
            .await?;
        info!(agent_id = agent.id, "new agent registered");
        return Ok(AuthOutcome {
            agent,
            is_new: true,
        });
    }

    Err(CapstanError::Config("unknown agent token".to_string()))
}

async fn handle_socket(gateway: AgentGateway, auth: AuthOutcome, socket: WebSocket) {
    let inner = gateway.inner.clone();
    let agent_id = auth.agent.id;
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
    let stop = CancellationToken::new();

    // Replace any previous connection for this agent: exactly one table
    // entry per connected agent.
    {
        let mut connections = inner.connections.lock().expect("connection table poisoned");
        if let Some(old) = connections.insert(
            agent_id,
            Connection {
                generation,
                outbound: out_tx.clone(),
                stop: stop.clone(),
            },
        ) {
            info!(agent_id, "replacing existing agent connection");
            old.stop.cancel();
        }
    }

    // Single writer per socket.
    let writer_stop = stop.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_stop.cancelled() => break,
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Mark online and greet.
    mark_agent(&inner, agent_id, AgentStatus::Online, None).await;
    let scheduler_config = match inner.repo.scheduler_settings().await {
        Ok(s) => SchedulerConfigPayload {
            worker_count: s.worker_count,
            queue_size: s.queue_size,
            rate_interval: s.rate_interval_ms,
        },
        Err(_) => SchedulerConfigPayload {
            worker_count: 4,
            queue_size: 100,
            rate_interval: 200,
        },
    };
    let _ = out_tx
        .send(Frame::new(
            FrameKind::Connected,
            &ConnectedPayload {
                agent_id,
                name: auth.agent.name.clone(),
                is_new_agent: auth.is_new,
                machine_id: auth.agent.machine_id.clone(),
                scheduler_config,
            },
        ))
        .await;

    info!(agent_id, name = %auth.agent.name, "agent connected");

    // Read loop.
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = ws_rx.next() => message,
        };
        let Some(Ok(message)) = message else { break };

        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };

        handle_frame(&gateway, agent_id, &out_tx, frame).await;
    }

    // Tear down: only the generation that owns the table entry removes
    // it, and only then is the agent really offline — a replaced
    // connection must not shadow its successor.
    stop.cancel();
    let _ = writer.await;
    let owned_entry = {
        let mut connections = inner.connections.lock().expect("connection table poisoned");
        let owned = connections
            .get(&agent_id)
            .is_some_and(|c| c.generation == generation);
        if owned {
            connections.remove(&agent_id);
        }
        owned
    };
    if owned_entry {
        mark_agent(&inner, agent_id, AgentStatus::Offline, None).await;
        info!(agent_id, "agent disconnected");
    }
}

async fn handle_frame(
    gateway: &AgentGateway,
    agent_id: u64,
    out_tx: &mpsc::Sender<Frame>,
    frame: Frame,
) {
    let inner = &gateway.inner;
    match frame.kind {
        FrameKind::Heartbeat => {
            let payload: HeartbeatPayload = frame.parse_data().unwrap_or_default();
            mark_agent(inner, agent_id, AgentStatus::Online, Some(&payload)).await;

            let latest_version = inner
                .repo
                .get_setting("agent", "latest_version")
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            let force_update = inner
                .repo
                .get_agent(agent_id)
                .await
                .ok()
                .flatten()
                .map(|a| a.force_update)
                .unwrap_or(false);
            let need_update =
                !latest_version.is_empty() && latest_version != payload.version;

            let name = inner
                .repo
                .get_agent(agent_id)
                .await
                .ok()
                .flatten()
                .map(|a| a.name)
                .unwrap_or_default();
            let _ = out_tx
                .send(Frame::new(
                    FrameKind::HeartbeatAck,
                    &HeartbeatAckPayload {
                        agent_id,
                        name,
                        need_update,
                        force_update,
                        latest_version,
                    },
                ))
                .await;
        }
        FrameKind::FetchTasks => match tasks_payload_for(inner.repo.as_ref(), agent_id).await {
            Ok(payload) => {
                let _ = out_tx.send(Frame::new(FrameKind::Tasks, &payload)).await;
            }
            Err(err) => warn!(agent_id, error = %err, "failed to load agent tasks"),
        },
        FrameKind::TaskResult => {
            if let Ok(payload) = frame.parse_data::<TaskResultPayload>() {
                gateway.handle_task_result(agent_id, payload).await;
            }
        }
        FrameKind::TaskLog => {
            if let Ok(payload) = frame.parse_data::<TaskLogPayload>() {
                if let Some(livelog) = inner.livelogs.get(payload.log_id) {
                    // Writes after close are swallowed.
                    let _ = livelog.write(payload.content.as_bytes());
                }
            }
        }
        FrameKind::TaskHeartbeat => {
            if let Ok(payload) = frame.parse_data::<TaskHeartbeatPayload>() {
                let _ = inner
                    .repo
                    .update_log_duration(payload.log_id, payload.duration)
                    .await;
            }
        }
        other => {
            debug!(agent_id, kind = ?other, "ignoring unexpected inbound frame");
        }
    }
}

async fn mark_agent(
    inner: &Arc<GatewayInner>,
    agent_id: u64,
    status: AgentStatus,
    heartbeat: Option<&HeartbeatPayload>,
) {
    let Ok(Some(mut agent)) = inner.repo.get_agent(agent_id).await else {
        return;
    };
    agent.status = status;
    agent.last_seen = Some(Utc::now());
    if let Some(hb) = heartbeat {
        agent.hostname = hb.hostname.clone();
        agent.os = hb.os.clone();
        agent.arch = hb.arch.clone();
        agent.version = hb.version.clone();
    }
    let _ = inner.repo.save_agent(&agent).await;
}

/// HTTP fallback used by agents whose channel write failed:
/// `POST /api/agent/report` with bearer token + machine id headers.
async fn report_handler(
    State(gateway): State<AgentGateway>,
    headers: HeaderMap,
    Json(payload): Json<TaskResultPayload>,
) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    let agent = match gateway.inner.repo.find_agent_by_token(token).await {
        Ok(Some(agent)) if agent.enabled => agent,
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    };

    if let Some(machine_id) = headers.get("x-machine-id").and_then(|v| v.to_str().ok()) {
        if !agent.machine_id.is_empty() && agent.machine_id != machine_id {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    gateway.handle_task_result(agent.id, payload).await;
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests;
