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

//! End-to-end tests of the agent channel: a real WebSocket client plays
//! the agent against the gateway's axum router.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use capstan::frames::{
    ConnectedPayload, ExecutePayload, Frame, FrameKind, HeartbeatPayload, TaskLogPayload,
    TaskResultPayload,
};
use capstan::gateway::AgentGateway;
use capstan::livelog::{decompress_from_base64, LiveLogRegistry};
use capstan::models::{Agent, AgentStatus, Task, TaskKind, TriggerKind};
use capstan::remote::RemoteDispatcher;
use capstan::repository::{MemoryRepository, Repository};
use capstan::scheduler::RunStatus;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestControl {
    addr: std::net::SocketAddr,
    repo: Arc<MemoryRepository>,
    livelogs: Arc<LiveLogRegistry>,
    gateway: AgentGateway,
}

async fn start_control() -> TestControl {
    let repo = Arc::new(MemoryRepository::new());
    let livelogs = LiveLogRegistry::new();
    let gateway = AgentGateway::new(repo.clone(), livelogs.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = gateway.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestControl {
        addr,
        repo,
        livelogs,
        gateway,
    }
}

fn test_agent(token: &str) -> Agent {
    Agent {
        id: 0,
        name: "worker-a".into(),
        token: token.into(),
        machine_id: String::new(),
        status: AgentStatus::Offline,
        last_seen: None,
        hostname: String::new(),
        os: String::new(),
        arch: String::new(),
        version: "1.0.0".into(),
        enabled: true,
        force_update: false,
    }
}

fn agent_bound_task(id: u64, agent_id: u64, timeout_minutes: f64) -> Task {
    Task {
        id,
        name: "remote-uname".into(),
        command: "uname".into(),
        kind: TaskKind::Task,
        trigger: TriggerKind::Cron,
        schedule: "*/5 * * * * *".into(),
        timeout_minutes,
        work_dir: String::new(),
        env_ids: vec![],
        language_pins: vec![],
        agent_id: Some(agent_id),
        enabled: true,
        run_config: Default::default(),
        repo_config: None,
        clean_config: None,
        running_tokens: vec![],
        last_run: None,
        next_run: None,
    }
}

async fn connect_agent(control: &TestControl, token: &str, machine_id: &str) -> WsStream {
    let url = format!(
        "ws://{}/api/agent/ws?token={token}&machine_id={machine_id}",
        control.addr
    );
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn next_frame(ws: &mut WsStream) -> Frame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("read ok");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

#[tokio::test]
async fn handshake_binds_machine_and_reports_config() {
    let control = start_control().await;
    let agent = control.repo.insert_agent(test_agent("tok-1")).await;

    let mut ws = connect_agent(&control, "tok-1", "machine-xyz").await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.kind, FrameKind::Connected);

    let payload: ConnectedPayload = frame.parse_data().unwrap();
    assert_eq!(payload.agent_id, agent.id);
    assert!(!payload.is_new_agent);
    assert_eq!(payload.scheduler_config.worker_count, 4);

    // The machine id is now bound and the agent marked online.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = control.repo.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.machine_id, "machine-xyz");
    assert_eq!(stored.status, AgentStatus::Online);
    assert!(control.gateway.is_connected(agent.id));
    assert_eq!(control.gateway.connection_count(), 1);
}

#[tokio::test]
async fn wrong_machine_id_is_rejected() {
    let control = start_control().await;
    let mut agent = test_agent("tok-2");
    agent.machine_id = "original-machine".into();
    control.repo.insert_agent(agent).await;

    let url = format!(
        "ws://{}/api/agent/ws?token=tok-2&machine_id=imposter",
        control.addr
    );
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
}

#[tokio::test]
async fn registration_token_creates_agent_once() {
    let control = start_control().await;
    control.repo.add_registration_token("join-tok").await;

    let mut ws = connect_agent(&control, "join-tok", "fresh-machine").await;
    let frame = next_frame(&mut ws).await;
    let payload: ConnectedPayload = frame.parse_data().unwrap();
    assert!(payload.is_new_agent);

    let stored = control
        .repo
        .find_agent_by_token("join-tok")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.machine_id, "fresh-machine");
}

#[tokio::test]
async fn heartbeat_updates_host_facts_and_acks() {
    let control = start_control().await;
    let agent = control.repo.insert_agent(test_agent("tok-3")).await;
    control
        .repo
        .set_setting("agent", "latest_version", "2.0.0")
        .await;

    let mut ws = connect_agent(&control, "tok-3", "m3").await;
    let _connected = next_frame(&mut ws).await;

    send_frame(
        &mut ws,
        &Frame::new(
            FrameKind::Heartbeat,
            &HeartbeatPayload {
                version: "1.0.0".into(),
                hostname: "worker-host".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                auto_update: true,
            },
        ),
    )
    .await;

    let ack = next_frame(&mut ws).await;
    assert_eq!(ack.kind, FrameKind::HeartbeatAck);
    let ack: capstan::frames::HeartbeatAckPayload = ack.parse_data().unwrap();
    assert!(ack.need_update);
    assert_eq!(ack.latest_version, "2.0.0");

    let stored = control.repo.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.hostname, "worker-host");
    assert_eq!(stored.os, "linux");
}

// The agent round trip: control dispatches, the fake agent streams a log
// chunk and a result, the dispatcher returns the translated outcome.
#[tokio::test]
async fn remote_execute_round_trip() {
    let control = start_control().await;
    let agent = control.repo.insert_agent(test_agent("tok-5")).await;
    let task = control
        .repo
        .insert_task(agent_bound_task(1, agent.id, 1.0))
        .await;

    let mut ws = connect_agent(&control, "tok-5", "m5").await;
    let _connected = next_frame(&mut ws).await;

    let log_id = 77;
    let livelog = control.livelogs.create(log_id).unwrap();

    let dispatcher = RemoteDispatcher::new(
        control.repo.clone() as Arc<dyn Repository>,
        control.gateway.clone(),
    );
    let task_for_exec = task.clone();
    let exec = tokio::spawn(async move { dispatcher.execute(&task_for_exec, log_id).await });

    // Agent side: receive execute, stream output, return the result.
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.kind, FrameKind::Execute);
    let payload: ExecutePayload = frame.parse_data().unwrap();
    assert_eq!(payload.task_id, task.id);
    assert_eq!(payload.log_id, log_id);

    send_frame(
        &mut ws,
        &Frame::new(
            FrameKind::TaskLog,
            &TaskLogPayload {
                log_id,
                content: "Linux\n".into(),
            },
        ),
    )
    .await;
    send_frame(
        &mut ws,
        &Frame::new(
            FrameKind::TaskResult,
            &TaskResultPayload {
                task_id: task.id,
                log_id,
                status: "success".into(),
                output: "Linux\n".into(),
                duration: 15,
                exit_code: 0,
                start_time: 1_700_000_000,
                end_time: 1_700_000_001,
                ..Default::default()
            },
        ),
    )
    .await;

    let result = exec.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.duration_ms, 15);

    // The streamed chunk reached the server-side collector.
    let encoded = livelog.compress_and_cleanup().unwrap();
    assert_eq!(decompress_from_base64(&encoded).unwrap(), "Linux\n");
}

// Agent disconnects mid-run: the waiter times out with a failed result,
// and the late result frame falls through to the fallback save path.
#[tokio::test]
async fn agent_disconnect_times_out_then_late_result_is_saved() {
    let control = start_control().await;
    let agent = control.repo.insert_agent(test_agent("tok-6")).await;
    // 0.02 minutes = 1.2 s waiter timeout.
    let task = control
        .repo
        .insert_task(agent_bound_task(1, agent.id, 0.02))
        .await;

    let mut ws = connect_agent(&control, "tok-6", "m6").await;
    let _connected = next_frame(&mut ws).await;

    let log_id = 88;
    let dispatcher = RemoteDispatcher::new(
        control.repo.clone() as Arc<dyn Repository>,
        control.gateway.clone(),
    );
    let task_for_exec = task.clone();
    let exec = tokio::spawn(async move { dispatcher.execute(&task_for_exec, log_id).await });

    // Receive the execute frame, then drop the socket without answering.
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.kind, FrameKind::Execute);
    tokio::time::sleep(Duration::from_millis(500)).await;
    drop(ws);

    let result = exec.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("timed out"));

    // A late result finds no waiter and is persisted directly.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut ws = connect_agent(&control, "tok-6", "m6").await;
    let _connected = next_frame(&mut ws).await;
    send_frame(
        &mut ws,
        &Frame::new(
            FrameKind::TaskResult,
            &TaskResultPayload {
                task_id: task.id,
                log_id,
                status: "success".into(),
                output: "late but real\n".into(),
                duration: 2000,
                exit_code: 0,
                start_time: 1_700_000_000,
                end_time: 1_700_000_002,
                ..Default::default()
            },
        ),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let row = control.repo.get_task_log(log_id).await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Success);
    assert_eq!(row.agent_id, Some(agent.id));
    assert_eq!(
        decompress_from_base64(&row.output).unwrap(),
        "late but real\n"
    );
}

#[tokio::test]
async fn reconnect_replaces_the_connection_entry() {
    let control = start_control().await;
    let agent = control.repo.insert_agent(test_agent("tok-7")).await;

    let mut first = connect_agent(&control, "tok-7", "m7").await;
    let _ = next_frame(&mut first).await;
    assert_eq!(control.gateway.connection_count(), 1);

    let mut second = connect_agent(&control, "tok-7", "m7").await;
    let _ = next_frame(&mut second).await;

    // Still exactly one table entry for the agent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(control.gateway.connection_count(), 1);
    assert!(control.gateway.is_connected(agent.id));
}
