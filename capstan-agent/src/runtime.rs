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

//! The agent runtime.
//!
//! Keeps the channel to the control node alive (reconnecting with a 5 s
//! backoff), mirrors the task list into a local scheduler + cron
//! dispatcher, streams run output back as `task_log` frames, and reports
//! results — over the channel when possible, over HTTP when not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use capstan::executor::shell::parse_env_pairs;
use capstan::frames::{
    AgentTaskSpec, ConnectedPayload, ExecutePayload, Frame, FrameKind, HeartbeatAckPayload,
    HeartbeatPayload, StopPayload, TaskHeartbeatPayload, TaskLogPayload, TaskResultPayload,
    TasksPayload,
};
use capstan::cron::{CronDispatcher, CronJobSpec};
use capstan::error::CapstanError;
use capstan::scheduler::{
    ExecutionRequest, ExecutionResult, RunType, Scheduler, SchedulerConfig,
    SchedulerEventHandler,
};
use capstan::sink::{LogSink, SharedSink};

use crate::config::AgentConfig;
use crate::outbound::Outbound;
use crate::update;

/// Reconnect delay after a lost connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Output lines retained per run for failure previews.
const PREVIEW_LINES: usize = 50;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// State shared between the runtime and the scheduler handler.
pub struct AgentShared {
    pub config: AgentConfig,
    pub machine_id: String,
    outbound: StdMutex<Option<Arc<Outbound>>>,
    log_rings: StdMutex<HashMap<u64, Vec<String>>>,
    pub http: reqwest::Client,
}

impl AgentShared {
    fn current_outbound(&self) -> Option<Arc<Outbound>> {
        self.outbound.lock().expect("outbound slot poisoned").clone()
    }

    fn send_control(&self, frame: Frame) -> Result<(), ()> {
        match self.current_outbound() {
            Some(outbound) => outbound.send_control(frame),
            None => Err(()),
        }
    }

    fn push_log_chunk(&self, log_id: u64, chunk: &[u8]) {
        self.remember_lines(log_id, chunk);
        if let Some(outbound) = self.current_outbound() {
            outbound.push_log(Frame::new(
                FrameKind::TaskLog,
                &TaskLogPayload {
                    log_id,
                    content: String::from_utf8_lossy(chunk).into_owned(),
                },
            ));
        }
    }

    fn remember_lines(&self, log_id: u64, chunk: &[u8]) {
        if log_id == 0 {
            return;
        }
        let text = String::from_utf8_lossy(chunk);
        let mut rings = self.log_rings.lock().expect("log rings poisoned");
        let ring = rings.entry(log_id).or_default();
        for line in text.trim_end_matches('\n').split('\n') {
            ring.push(line.to_string());
        }
        let len = ring.len();
        if len > PREVIEW_LINES {
            ring.drain(..len - PREVIEW_LINES);
        }
    }

    fn print_last_logs(&self, log_id: u64) {
        if log_id == 0 {
            return;
        }
        let rings = self.log_rings.lock().expect("log rings poisoned");
        let Some(lines) = rings.get(&log_id).filter(|l| !l.is_empty()) else {
            return;
        };
        error!(log_id, lines = lines.len(), "failed run output preview");
        for line in lines {
            println!("  {line}");
        }
    }

    fn clear_task_log(&self, log_id: u64) {
        if log_id == 0 {
            return;
        }
        self.log_rings
            .lock()
            .expect("log rings poisoned")
            .remove(&log_id);
    }

    async fn report_result_http(&self, payload: &TaskResultPayload) {
        let url = format!("{}/api/agent/report", self.config.server_url);
        let result = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.token))
            .header("X-Machine-ID", &self.machine_id)
            .json(payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(log_id = payload.log_id, "result reported over HTTP fallback");
            }
            Ok(response) => {
                warn!(status = %response.status(), "HTTP result report rejected");
            }
            Err(err) => {
                warn!(error = %err, "HTTP result report failed");
            }
        }
    }
}

/// Streams one run's output back as `task_log` frames.
struct RealTimeLogWriter {
    shared: Arc<AgentShared>,
    log_id: u64,
}

impl LogSink for RealTimeLogWriter {
    fn write_chunk(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.shared.push_log_chunk(self.log_id, chunk);
    }
}

/// The agent's scheduler event handler: everything funnels into the
/// outbound channel.
struct AgentHandler {
    shared: Arc<AgentShared>,
}

#[async_trait]
impl SchedulerEventHandler for AgentHandler {
    async fn on_task_executing(
        &self,
        req: &mut ExecutionRequest,
    ) -> Result<Option<(SharedSink, SharedSink)>, CapstanError> {
        if req.log_id == 0 {
            return Ok(None);
        }
        let sink: SharedSink = Arc::new(RealTimeLogWriter {
            shared: self.shared.clone(),
            log_id: req.log_id,
        });
        Ok(Some((sink.clone(), sink)))
    }

    async fn on_task_heartbeat(&self, req: &ExecutionRequest, elapsed_ms: i64) {
        if req.log_id > 0 {
            let _ = self.shared.send_control(Frame::new(
                FrameKind::TaskHeartbeat,
                &TaskHeartbeatPayload {
                    log_id: req.log_id,
                    duration: elapsed_ms,
                },
            ));
        }

        if elapsed_ms >= 60_000 && elapsed_ms / 60_000 > (elapsed_ms - 3_000) / 60_000 {
            info!(
                task_id = %req.task_id,
                elapsed_s = elapsed_ms / 1000,
                "task still running"
            );
        }
    }

    async fn on_task_completed(&self, req: &ExecutionRequest, result: &ExecutionResult) {
        let payload = TaskResultPayload {
            task_id: req.task_row_id().unwrap_or_default(),
            log_id: result.log_id,
            agent_id: 0,
            command: req.command.clone(),
            output: result.output.clone(),
            error: result.error.clone(),
            status: result.status.to_string(),
            duration: result.duration_ms,
            exit_code: result.exit_code,
            start_time: result.start_time.timestamp(),
            end_time: result.end_time.timestamp(),
        };

        if self
            .shared
            .send_control(Frame::new(FrameKind::TaskResult, &payload))
            .is_err()
        {
            warn!(log_id = result.log_id, "channel send failed, reporting over HTTP");
            self.shared.report_result_http(&payload).await;
        }

        if !result.success {
            self.shared.print_last_logs(result.log_id);
        }
        self.shared.clear_task_log(result.log_id);
    }

    async fn on_task_failed(&self, req: &ExecutionRequest, err: &CapstanError) {
        // Push the error text first so the control node's collector has
        // it before the terminal frame lands.
        self.shared.push_log_chunk(
            req.log_id,
            format!("task execution failed: {err}").as_bytes(),
        );

        let now = chrono::Utc::now().timestamp();
        let payload = TaskResultPayload {
            task_id: req.task_row_id().unwrap_or_default(),
            log_id: req.log_id,
            agent_id: 0,
            command: req.command.clone(),
            output: String::new(),
            error: err.to_string(),
            status: "failed".to_string(),
            duration: 0,
            exit_code: 1,
            start_time: now,
            end_time: now,
        };

        if self
            .shared
            .send_control(Frame::new(FrameKind::TaskResult, &payload))
            .is_err()
        {
            self.shared.report_result_http(&payload).await;
        }

        self.shared.print_last_logs(req.log_id);
        self.shared.clear_task_log(req.log_id);
    }
}

/// The agent: connection management plus the local execution engine.
pub struct AgentRuntime {
    shared: Arc<AgentShared>,
    scheduler: Scheduler,
    cron: CronDispatcher,
    tasks: StdMutex<HashMap<u64, AgentTaskSpec>>,
    stop: CancellationToken,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, machine_id: String) -> Self {
        let shared = Arc::new(AgentShared {
            config,
            machine_id,
            outbound: StdMutex::new(None),
            log_rings: StdMutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        });

        let handler = Arc::new(AgentHandler {
            shared: shared.clone(),
        });
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let scheduler = Scheduler::new(
            SchedulerConfig {
                worker_count: workers,
                queue_size: 100,
                rate_interval: Duration::from_millis(100),
            },
            handler.clone(),
        );
        let cron = CronDispatcher::new(scheduler.clone(), handler);

        Self {
            shared,
            scheduler,
            cron,
            tasks: StdMutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        self.scheduler.start().await;
        self.cron.start();

        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.connection_loop().await;
        });
        info!("agent started");
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        self.cron.stop();
        self.scheduler.stop().await;
        info!("agent stopped");
    }

    async fn connection_loop(self: &Arc<Self>) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }

            let url = self.shared.config.ws_url(&self.shared.machine_id);
            info!("connecting to control node");
            match tokio_tungstenite::connect_async(&url).await {
                Ok((stream, _)) => {
                    self.serve_connection(stream).await;
                    warn!("connection to control node lost");
                }
                Err(err) => {
                    warn!(error = %err, "connection failed");
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn serve_connection(self: &Arc<Self>, stream: WsStream) {
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (outbound, mut control_rx) = Outbound::new();
        *self.shared.outbound.lock().expect("outbound slot poisoned") = Some(outbound.clone());

        let conn_stop = self.stop.child_token();

        // One writer per socket: drains queued log chunks eagerly, control
        // frames as they come.
        let writer_outbound = outbound.clone();
        let writer_stop = conn_stop.clone();
        let writer = tokio::spawn(async move {
            'outer: loop {
                while let Some(frame) = writer_outbound.pop_log() {
                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                        break 'outer;
                    }
                }
                tokio::select! {
                    _ = writer_stop.cancelled() => break,
                    frame = control_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    _ = writer_outbound.log_available() => {}
                }
            }
        });

        // Heartbeats on the configured interval, plus one immediately.
        self.send_heartbeat();
        let heartbeat_runtime = self.clone();
        let heartbeat_stop = conn_stop.clone();
        let interval = self.shared.config.interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_stop.cancelled() => return,
                    _ = ticker.tick() => heartbeat_runtime.send_heartbeat(),
                }
            }
        });

        // Read loop.
        loop {
            let message = tokio::select! {
                _ = conn_stop.cancelled() => break,
                message = ws_rx.next() => message,
            };
            let Some(Ok(message)) = message else { break };
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                continue;
            };
            self.handle_frame(frame).await;
        }

        conn_stop.cancel();
        *self.shared.outbound.lock().expect("outbound slot poisoned") = None;
        let _ = writer.await;
        let _ = heartbeat.await;
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame.kind {
            FrameKind::Connected => {
                if let Ok(payload) = frame.parse_data::<ConnectedPayload>() {
                    self.handle_connected(payload).await;
                }
            }
            FrameKind::HeartbeatAck => {
                if let Ok(payload) = frame.parse_data::<HeartbeatAckPayload>() {
                    if payload.need_update
                        && (self.shared.config.auto_update || payload.force_update)
                    {
                        info!(version = %payload.latest_version, "update available, upgrading");
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            update::self_update(shared).await;
                        });
                    }
                }
            }
            FrameKind::Tasks => {
                if let Ok(payload) = frame.parse_data::<TasksPayload>() {
                    self.update_tasks(payload.tasks).await;
                }
            }
            FrameKind::Execute => {
                if let Ok(payload) = frame.parse_data::<ExecutePayload>() {
                    self.handle_execute(payload).await;
                }
            }
            FrameKind::Stop => {
                if let Ok(payload) = frame.parse_data::<StopPayload>() {
                    if !self.scheduler.stop_log(payload.log_id) {
                        warn!(log_id = payload.log_id, "stop requested for unknown run");
                    }
                }
            }
            FrameKind::Update => {
                info!("update instructed by control node");
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    update::self_update(shared).await;
                });
            }
            FrameKind::Disabled => {
                warn!("agent disabled by control node, clearing tasks");
                self.clear_all_tasks();
            }
            FrameKind::Enabled => {
                info!("agent enabled by control node, fetching tasks");
                self.fetch_tasks();
            }
            other => {
                warn!(kind = ?other, "unexpected inbound frame");
            }
        }
    }

    async fn handle_connected(self: &Arc<Self>, payload: ConnectedPayload) {
        if payload.is_new_agent {
            info!(agent_id = payload.agent_id, "registered with control node");
        } else {
            info!(agent_id = payload.agent_id, "connected to control node");
        }

        let pushed = SchedulerConfig {
            worker_count: payload.scheduler_config.worker_count,
            queue_size: payload.scheduler_config.queue_size,
            rate_interval: Duration::from_millis(payload.scheduler_config.rate_interval),
        };
        let current = self.scheduler.config().await;
        if pushed != current
            && pushed.worker_count > 0
            && pushed.queue_size > 0
        {
            info!(
                workers = pushed.worker_count,
                queue = pushed.queue_size,
                "applying scheduler configuration from control node"
            );
            self.scheduler.reload(pushed).await;
        }

        self.fetch_tasks();
    }

    fn fetch_tasks(&self) {
        if self.shared.send_control(Frame::bare(FrameKind::FetchTasks)).is_err() {
            warn!("failed to request task list");
        }
    }

    fn send_heartbeat(&self) {
        let payload = HeartbeatPayload {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            auto_update: self.shared.config.auto_update,
        };
        if self
            .shared
            .send_control(Frame::new(FrameKind::Heartbeat, &payload))
            .is_err()
        {
            warn!("failed to send heartbeat");
        }
    }

    /// Diffs the pushed task list against the local registry.
    async fn update_tasks(&self, new_tasks: Vec<AgentTaskSpec>) {
        let (to_remove, to_schedule) = {
            let mut registry = self.tasks.lock().expect("task registry poisoned");
            let incoming: HashMap<u64, AgentTaskSpec> =
                new_tasks.into_iter().map(|t| (t.id, t)).collect();

            let to_remove: Vec<u64> = registry
                .keys()
                .filter(|id| !incoming.contains_key(id))
                .copied()
                .collect();
            for id in &to_remove {
                registry.remove(id);
            }

            let mut to_schedule = Vec::new();
            for (id, task) in incoming {
                let changed = registry.get(&id) != Some(&task);
                if changed {
                    to_schedule.push(task.clone());
                    registry.insert(id, task);
                }
            }
            (to_remove, to_schedule)
        };

        for id in to_remove {
            self.cron.remove_task(&id.to_string());
            info!(task_id = id, "task removed");
        }

        for task in to_schedule {
            if task.enabled && !task.schedule.is_empty() {
                let spec = CronJobSpec {
                    task_id: task.id.to_string(),
                    name: task.name.clone(),
                    command: task.command.clone(),
                    schedule: task.schedule.clone(),
                    timeout_minutes: task.timeout,
                    work_dir: task.work_dir.clone(),
                    envs: task.envs.clone(),
                };
                match self.cron.add_task(spec).await {
                    Ok(()) => info!(task_id = task.id, name = %task.name, "task scheduled"),
                    Err(err) => {
                        error!(task_id = task.id, error = %err, "failed to schedule task")
                    }
                }
            } else {
                self.cron.remove_task(&task.id.to_string());
                info!(task_id = task.id, "task disabled");
            }
        }

        let count = self.tasks.lock().expect("task registry poisoned").len();
        info!(count, "task list synchronized");
    }

    fn clear_all_tasks(&self) {
        let ids: Vec<u64> = {
            let mut registry = self.tasks.lock().expect("task registry poisoned");
            let ids = registry.keys().copied().collect();
            registry.clear();
            ids
        };
        for id in ids {
            self.cron.remove_task(&id.to_string());
        }
        info!("all tasks cleared");
    }

    async fn handle_execute(self: &Arc<Self>, payload: ExecutePayload) {
        let task = {
            let registry = self.tasks.lock().expect("task registry poisoned");
            registry.get(&payload.task_id).cloned()
        };
        let Some(task) = task else {
            warn!(task_id = payload.task_id, "execute for unknown task");
            return;
        };

        let req = ExecutionRequest {
            task_id: task.id.to_string(),
            log_id: payload.log_id,
            name: task.name.clone(),
            run_type: RunType::Manual,
            command: task.command.clone(),
            work_dir: task.work_dir.clone(),
            envs: parse_env_pairs(&task.envs),
            timeout_minutes: task.timeout,
            metadata: Default::default(),
        };
        self.scheduler.enqueue_or_execute(req).await;
    }
}

async fn send_frame(
    ws_tx: &mut futures::stream::SplitSink<WsStream, Message>,
    frame: &Frame,
) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(frame) else {
        return Ok(());
    };
    ws_tx.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<AgentShared> {
        Arc::new(AgentShared {
            config: AgentConfig::default(),
            machine_id: "m".into(),
            outbound: StdMutex::new(None),
            log_rings: StdMutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        })
    }

    #[test]
    fn preview_ring_keeps_last_fifty_lines() {
        let shared = shared();
        for i in 0..80 {
            shared.remember_lines(1, format!("line {i}\n").as_bytes());
        }

        let rings = shared.log_rings.lock().unwrap();
        let ring = rings.get(&1).unwrap();
        assert_eq!(ring.len(), PREVIEW_LINES);
        assert_eq!(ring.first().unwrap(), "line 30");
        assert_eq!(ring.last().unwrap(), "line 79");
    }

    #[test]
    fn multi_line_chunks_split_into_ring_entries() {
        let shared = shared();
        shared.remember_lines(2, b"one\ntwo\nthree\n");

        let rings = shared.log_rings.lock().unwrap();
        assert_eq!(rings.get(&2).unwrap().as_slice(), ["one", "two", "three"]);
    }

    #[test]
    fn untracked_runs_skip_the_ring() {
        let shared = shared();
        shared.remember_lines(0, b"ignored\n");
        assert!(shared.log_rings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_diff_schedules_and_removes() {
        let runtime = Arc::new(AgentRuntime::new(AgentConfig::default(), "m".into()));

        let task = AgentTaskSpec {
            id: 1,
            name: "t1".into(),
            command: "true".into(),
            schedule: "*/5 * * * * *".into(),
            timeout: 1.0,
            work_dir: String::new(),
            envs: String::new(),
            enabled: true,
        };
        runtime.update_tasks(vec![task.clone()]).await;
        assert_eq!(runtime.cron.scheduled_count(), 1);

        // Disabling removes the cron entry but keeps the registry row.
        let mut disabled = task.clone();
        disabled.enabled = false;
        runtime.update_tasks(vec![disabled]).await;
        assert_eq!(runtime.cron.scheduled_count(), 0);
        assert_eq!(runtime.tasks.lock().unwrap().len(), 1);

        // An empty list clears everything.
        runtime.update_tasks(vec![]).await;
        assert!(runtime.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_all_tasks_empties_cron() {
        let runtime = Arc::new(AgentRuntime::new(AgentConfig::default(), "m".into()));
        runtime
            .update_tasks(vec![AgentTaskSpec {
                id: 7,
                name: "t7".into(),
                command: "true".into(),
                schedule: "*/5 * * * * *".into(),
                timeout: 1.0,
                work_dir: String::new(),
                envs: String::new(),
                enabled: true,
            }])
            .await;
        assert_eq!(runtime.cron.scheduled_count(), 1);

        runtime.clear_all_tasks();
        assert_eq!(runtime.cron.scheduled_count(), 0);
    }
}
