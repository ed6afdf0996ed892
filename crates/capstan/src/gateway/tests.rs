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

use std::sync::Arc;

use super::*;
use crate::livelog::decompress_from_base64;
use crate::models::{Task, TaskKind, TaskRunConfig, TriggerKind};
use crate::repository::MemoryRepository;

fn sample_task(id: u64, agent_id: Option<u64>) -> Task {
    Task {
        id,
        name: format!("task-{id}"),
        command: "uname".into(),
        kind: TaskKind::Task,
        trigger: TriggerKind::Cron,
        schedule: "*/5 * * * * *".into(),
        timeout_minutes: 1.0,
        work_dir: String::new(),
        env_ids: vec![],
        language_pins: vec![],
        agent_id,
        enabled: true,
        run_config: TaskRunConfig { concurrency: 1 },
        repo_config: None,
        clean_config: None,
        running_tokens: vec![],
        last_run: None,
        next_run: None,
    }
}

fn gateway_with_repo() -> (AgentGateway, Arc<MemoryRepository>, Arc<LiveLogRegistry>) {
    let repo = Arc::new(MemoryRepository::new());
    let livelogs = LiveLogRegistry::new();
    let gateway = AgentGateway::new(repo.clone(), livelogs.clone());
    (gateway, repo, livelogs)
}

fn result_payload(task_id: u64, log_id: u64, status: &str) -> TaskResultPayload {
    TaskResultPayload {
        task_id,
        log_id,
        agent_id: 0,
        command: "uname".into(),
        output: "Linux\n".into(),
        error: String::new(),
        status: status.into(),
        duration: 12,
        exit_code: 0,
        start_time: 1_700_000_000,
        end_time: 1_700_000_001,
    }
}

#[tokio::test]
async fn waiter_receives_matching_result() {
    let (gateway, _repo, _livelogs) = gateway_with_repo();

    let rx = gateway.register_waiter(42);
    gateway
        .handle_task_result(3, result_payload(1, 42, "success"))
        .await;

    let delivered = rx.await.unwrap();
    assert_eq!(delivered.log_id, 42);
    assert_eq!(delivered.agent_id, 3);
    assert_eq!(delivered.status, "success");
}

#[tokio::test]
async fn unmatched_result_falls_back_to_log_save() {
    let (gateway, repo, _livelogs) = gateway_with_repo();
    repo.insert_task(sample_task(1, Some(3))).await;

    // No waiter registered: the row is written directly.
    gateway
        .handle_task_result(3, result_payload(1, 42, "success"))
        .await;

    let row = repo.get_task_log(42).await.unwrap().unwrap();
    assert_eq!(row.task_id, 1);
    assert_eq!(row.agent_id, Some(3));
    assert_eq!(row.status, RunStatus::Success);
    assert_eq!(decompress_from_base64(&row.output).unwrap(), "Linux\n");
}

#[tokio::test]
async fn unregistered_waiter_routes_late_result_to_fallback() {
    let (gateway, repo, _livelogs) = gateway_with_repo();
    repo.insert_task(sample_task(1, Some(3))).await;

    let rx = gateway.register_waiter(42);
    gateway.unregister_waiter(42);
    drop(rx);

    gateway
        .handle_task_result(3, result_payload(1, 42, "failed"))
        .await;

    let row = repo.get_task_log(42).await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Failed);
}

#[tokio::test]
async fn task_log_frames_append_to_live_collector() {
    let (gateway, _repo, livelogs) = gateway_with_repo();
    let livelog = livelogs.create(9).unwrap();
    let (_id, mut rx) = livelog.subscribe();

    // Simulate the inbound frame path.
    let frame = Frame::new(
        FrameKind::TaskLog,
        &TaskLogPayload {
            log_id: 9,
            content: "streamed line\n".into(),
        },
    );
    let payload: TaskLogPayload = frame.parse_data().unwrap();
    if let Some(log) = livelogs.get(payload.log_id) {
        log.write(payload.content.as_bytes()).unwrap();
    }

    assert_eq!(rx.recv().await.unwrap(), b"streamed line\n");
    let _ = gateway;
}

#[tokio::test]
async fn send_to_unconnected_agent_fails() {
    let (gateway, _repo, _livelogs) = gateway_with_repo();
    let err = gateway.send_to_agent(1, Frame::bare(FrameKind::Stop));
    assert!(matches!(err, Err(CapstanError::AgentNotConnected(1))));
    assert!(!gateway.is_connected(1));
    assert_eq!(gateway.connection_count(), 0);
}

#[tokio::test]
async fn tasks_payload_contains_resolved_envs() {
    let (_gateway, repo, _livelogs) = gateway_with_repo();
    let env_id = repo.insert_env("API_KEY", "secret").await;
    let mut task = sample_task(1, Some(5));
    task.env_ids = vec![env_id];
    repo.insert_task(task).await;
    repo.insert_task(sample_task(2, Some(6))).await;

    let payload = tasks_payload_for(repo.as_ref(), 5).await.unwrap();
    assert_eq!(payload.tasks.len(), 1);
    assert_eq!(payload.tasks[0].envs, "API_KEY=secret");
}

#[tokio::test]
async fn run_status_wire_names_parse() {
    for (name, status) in [
        ("success", RunStatus::Success),
        ("failed", RunStatus::Failed),
        ("timeout", RunStatus::Timeout),
        ("cancelled", RunStatus::Cancelled),
    ] {
        assert_eq!(parse_run_status(name), Some(status));
    }
    assert_eq!(parse_run_status("sideways"), None);
}
