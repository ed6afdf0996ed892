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
use std::time::Duration;

use super::*;
use crate::livelog::decompress_from_base64;
use crate::models::{KeepPolicy, RepoSyncConfig, TaskRunConfig};
use crate::repository::MemoryRepository;

fn task_row(command: &str, concurrency: u8) -> Task {
    Task {
        id: 0,
        name: "test-task".into(),
        command: command.into(),
        kind: TaskKind::Task,
        trigger: TriggerKind::Cron,
        schedule: "*/1 * * * * *".into(),
        timeout_minutes: 1.0,
        work_dir: String::new(),
        env_ids: vec![],
        language_pins: vec![],
        agent_id: None,
        enabled: true,
        run_config: TaskRunConfig { concurrency },
        repo_config: None,
        clean_config: None,
        running_tokens: vec![],
        last_run: None,
        next_run: None,
    }
}

async fn coordinator_with_repo() -> (TaskCoordinator, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    repo.set_setting("scheduler", "rate_interval", "10").await;
    let livelogs = crate::livelog::LiveLogRegistry::new();
    let gateway = AgentGateway::new(repo.clone(), livelogs.clone());
    let coordinator = TaskCoordinator::new(repo.clone(), livelogs, gateway)
        .await
        .unwrap();
    coordinator.scheduler().start().await;
    (coordinator, repo)
}

async fn wait_for_finished_log(
    repo: &MemoryRepository,
    task_id: u64,
    deadline: Duration,
) -> Vec<crate::models::TaskLog> {
    let start = tokio::time::Instant::now();
    loop {
        let logs = repo.logs_for_task(task_id).await;
        if logs.iter().any(|l| l.status.is_finished()) {
            return logs;
        }
        if start.elapsed() > deadline {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(unix)]
#[tokio::test]
async fn local_run_finalizes_a_success_row() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("echo hello", 1)).await;

    let queued = coordinator.execute_task(task.id, None).await;
    assert!(queued.success);
    assert_eq!(queued.status, RunStatus::Queued);

    let logs = wait_for_finished_log(&repo, task.id, Duration::from_secs(5)).await;
    assert_eq!(logs.len(), 1);
    let row = &logs[0];
    assert_eq!(row.status, RunStatus::Success);
    assert_eq!(row.exit_code, 0);
    assert!(row.duration_ms < 2000);

    let output = decompress_from_base64(&row.output).unwrap().replace('\r', "");
    assert!(output.ends_with("hello\n"));

    // The run slot was released and last_run recorded.
    let task = repo.get_task(task.id).await.unwrap().unwrap();
    assert!(task.running_tokens.is_empty());
    assert!(task.last_run.is_some());

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn timeout_run_finalizes_a_timeout_row() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("sleep 5", 1)).await;

    let req = ExecutionRequest {
        task_id: task.id.to_string(),
        log_id: 0,
        name: task.name.clone(),
        run_type: RunType::Manual,
        command: task.command.clone(),
        work_dir: String::new(),
        envs: vec![],
        timeout_minutes: 0.02,
        metadata: Default::default(),
    };
    let result = coordinator.scheduler().execute_sync(req).await.unwrap();

    assert_eq!(result.status, RunStatus::Timeout);
    assert_ne!(result.exit_code, 0);
    assert!(result.duration_ms >= 1100 && result.duration_ms < 3000);
    assert!(result.error.contains("deadline"));

    let logs = repo.logs_for_task(task.id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Timeout);

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn exclusive_gate_allows_one_run_and_rejects_the_rest() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("sleep 2", 0)).await;

    let first = coordinator.execute_task(task.id, None).await;
    assert!(first.success);

    // Give the first run time to pass the gate.
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Read-only gate rejects while the first run is in flight.
    let second = coordinator.execute_task(task.id, None).await;
    assert!(!second.success);
    assert!(second.error.contains("already running"));

    // Racing requests that slip past the read-only check are stopped by
    // the transactional gate without leaving a row.
    let req = ExecutionRequest {
        task_id: task.id.to_string(),
        log_id: 0,
        name: task.name.clone(),
        run_type: RunType::Cron,
        command: task.command.clone(),
        work_dir: String::new(),
        envs: vec![],
        timeout_minutes: 1.0,
        metadata: Default::default(),
    };
    assert!(coordinator.scheduler().execute_sync(req).await.is_err());

    let logs = wait_for_finished_log(&repo, task.id, Duration::from_secs(6)).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Success);

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn parallel_task_admits_concurrent_runs() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("sleep 1", 1)).await;

    coordinator.execute_task(task.id, None).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = coordinator.execute_task(task.id, None).await;
    assert!(second.success);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let logs = repo.logs_for_task(task.id).await;
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == RunStatus::Success));

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn startup_trigger_fires_after_boot() {
    let repo = Arc::new(MemoryRepository::new());
    repo.set_setting("scheduler", "rate_interval", "10").await;
    let mut task = task_row("echo booted", 1);
    task.trigger = TriggerKind::Startup;
    task.schedule = String::new();
    let task = repo.insert_task(task).await;

    let livelogs = crate::livelog::LiveLogRegistry::new();
    let gateway = AgentGateway::new(repo.clone(), livelogs.clone());
    let coordinator = TaskCoordinator::new(repo.clone(), livelogs, gateway)
        .await
        .unwrap();
    coordinator.start().await.unwrap();

    let logs = wait_for_finished_log(&repo, task.id, Duration::from_secs(8)).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Success);

    coordinator.stop().await;
}

#[tokio::test]
async fn boot_clears_stale_run_tokens() {
    let repo = Arc::new(MemoryRepository::new());
    let mut task = task_row("true", 0);
    task.running_tokens = vec![123, 456];
    let task = repo.insert_task(task).await;

    let livelogs = crate::livelog::LiveLogRegistry::new();
    let gateway = AgentGateway::new(repo.clone(), livelogs.clone());
    let coordinator = TaskCoordinator::new(repo.clone(), livelogs, gateway)
        .await
        .unwrap();
    coordinator.start().await.unwrap();

    let loaded = repo.get_task(task.id).await.unwrap().unwrap();
    assert!(loaded.running_tokens.is_empty());

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn stop_run_cancels_a_local_run() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("sleep 30", 1)).await;

    coordinator.execute_task(task.id, None).await;

    // Wait until the run opens its log row.
    let mut log_id = 0;
    for _ in 0..50 {
        if let Some(log) = repo.logs_for_task(task.id).await.first() {
            log_id = log.id;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(log_id > 0);

    coordinator.stop_run(log_id).await.unwrap();

    let logs = wait_for_finished_log(&repo, task.id, Duration::from_secs(8)).await;
    assert_eq!(logs[0].status, RunStatus::Cancelled);

    coordinator.stop().await;
}

#[tokio::test]
async fn stop_run_for_finished_log_is_refused() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("true", 1)).await;
    let mut row = repo
        .create_task_log(crate::models::NewTaskLog::new(task.id, "true"))
        .await
        .unwrap();
    row.status = RunStatus::Success;
    repo.save_task_log(&row).await.unwrap();

    assert!(matches!(
        coordinator.stop_run(row.id).await,
        Err(CapstanError::NotRunning)
    ));
    assert!(matches!(
        coordinator.stop_run(9999).await,
        Err(CapstanError::LogNotFound(9999))
    ));

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn retention_prunes_rows_after_completion() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let mut task = task_row("echo more", 1);
    task.clean_config = Some(KeepPolicy::Count(2));
    let task = repo.insert_task(task).await;

    for _ in 0..4 {
        coordinator.execute_task(task.id, None).await;
        // Let each run finish before the next so rows accumulate.
        tokio::time::sleep(Duration::from_millis(600)).await;
    }

    let logs = repo.logs_for_task(task.id).await;
    assert!(logs.len() <= 2, "expected retention to prune, got {}", logs.len());

    coordinator.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn result_ring_elides_output_for_finished_runs() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let task = repo.insert_task(task_row("echo ringed", 1)).await;

    coordinator.execute_task(task.id, None).await;
    wait_for_finished_log(&repo, task.id, Duration::from_secs(5)).await;

    let results = coordinator.last_results(10);
    assert!(!results.is_empty());
    let finished = results
        .iter()
        .find(|r| r.status.is_finished())
        .expect("a finished result in the ring");
    assert!(finished.output.is_empty());

    coordinator.stop().await;
}

#[tokio::test]
async fn unknown_task_is_rejected_without_a_row() {
    let (coordinator, repo) = coordinator_with_repo().await;

    let result = coordinator.execute_task(999, None).await;
    assert!(!result.success);
    assert!(result.error.contains("not found"));
    assert!(repo.logs_for_task(999).await.is_empty());

    coordinator.stop().await;
}

#[test]
fn repo_command_synthesis_covers_flags() {
    let mut task = task_row("", 1);
    task.kind = TaskKind::Repo;
    task.repo_config = Some(RepoSyncConfig {
        source_type: "git".into(),
        source_url: "https://github.com/example/tools.git".into(),
        target_path: "tools".into(),
        branch: "main".into(),
        sparse_path: String::new(),
        single_file: false,
        proxy: "custom".into(),
        proxy_url: "https://proxy.example.com".into(),
        auth_token: "tok".into(),
    });

    let command = build_repo_command(&task).unwrap();
    assert!(command.starts_with("capstan-ctl reposync"));
    assert!(command.contains("--source-type git"));
    assert!(command.contains("--source-url https://github.com/example/tools.git"));
    assert!(command.contains("--branch main"));
    assert!(command.contains("--proxy custom"));
    assert!(command.contains("--proxy-url https://proxy.example.com"));
    assert!(command.contains("--auth-token tok"));
    assert!(!command.contains("--single-file"));
    assert!(!command.contains("--path "));

    // No config or no URL: nothing to synthesize.
    task.repo_config = None;
    assert!(build_repo_command(&task).is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn env_references_reach_the_child() {
    let (coordinator, repo) = coordinator_with_repo().await;
    let env_id = repo.insert_env("CAPSTAN_TEST_FLAG", "from-env-store").await;
    let mut task = task_row("echo flag=$CAPSTAN_TEST_FLAG", 1);
    task.env_ids = vec![env_id];
    let task = repo.insert_task(task).await;

    coordinator.execute_task(task.id, None).await;
    let logs = wait_for_finished_log(&repo, task.id, Duration::from_secs(5)).await;
    let output = decompress_from_base64(&logs[0].output).unwrap();
    assert!(output.contains("flag=from-env-store"));

    coordinator.stop().await;
}
