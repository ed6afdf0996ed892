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

//! Remote dispatch for agent-bound runs.
//!
//! Instead of spawning a child locally, the coordinator sends an
//! `execute` frame to the task's agent and parks on a result waiter keyed
//! by the log id. The agent streams `task_log` chunks into the same
//! LiveLog the coordinator opened, so server-side subscribers see the
//! remote run in real time; the terminal `task_result` frame resolves the
//! waiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tracing::{info, warn};

use crate::error::CapstanError;
use crate::executor::{CommandResult, DEFAULT_TIMEOUT_MINUTES};
use crate::frames::{ExecutePayload, Frame, FrameKind, StopPayload};
use crate::gateway::{parse_run_status, AgentGateway};
use crate::models::Task;
use crate::repository::Repository;
use crate::scheduler::RunStatus;

/// Sends agent-bound runs across the wire and awaits their results.
#[derive(Clone)]
pub struct RemoteDispatcher {
    repo: Arc<dyn Repository>,
    gateway: AgentGateway,
}

impl RemoteDispatcher {
    pub fn new(repo: Arc<dyn Repository>, gateway: AgentGateway) -> Self {
        Self { repo, gateway }
    }

    /// Executes `task` on its agent and waits for the result frame.
    ///
    /// Hard failures — missing, disabled, or disconnected agent — are
    /// errors. A timeout waiting for the result is *not*: it yields a
    /// failed result so the run still finalizes its log row.
    pub async fn execute(&self, task: &Task, log_id: u64) -> Result<CommandResult, CapstanError> {
        let agent_id = task
            .agent_id
            .filter(|id| *id > 0)
            .ok_or_else(|| CapstanError::Execution("task is not agent-bound".to_string()))?;

        let agent = self
            .repo
            .get_agent(agent_id)
            .await?
            .ok_or(CapstanError::AgentNotFound(agent_id))?;
        if !agent.enabled {
            return Err(CapstanError::AgentDisabled(agent_id));
        }

        info!(
            task_id = task.id,
            agent_id, log_id, "dispatching task to agent"
        );

        // Register the waiter before the frame goes out so the result
        // cannot slip through the gap.
        let waiter = self.gateway.register_waiter(log_id);

        let sent = self.gateway.send_to_agent(
            agent_id,
            Frame::new(
                FrameKind::Execute,
                &ExecutePayload {
                    task_id: task.id,
                    log_id,
                },
            ),
        );
        if let Err(err) = sent {
            self.gateway.unregister_waiter(log_id);
            return Err(err);
        }

        let timeout_minutes = if task.timeout_minutes > 0.0 {
            task.timeout_minutes
        } else {
            DEFAULT_TIMEOUT_MINUTES
        };
        let timeout = Duration::from_secs_f64(timeout_minutes * 60.0);
        let start = Utc::now();

        let outcome = tokio::time::timeout(timeout, waiter).await;
        self.gateway.unregister_waiter(log_id);

        match outcome {
            Ok(Ok(payload)) => {
                let status = parse_run_status(&payload.status).unwrap_or(RunStatus::Failed);
                Ok(CommandResult {
                    status,
                    error: if payload.error.is_empty() {
                        None
                    } else {
                        Some(payload.error)
                    },
                    duration_ms: payload.duration,
                    exit_code: payload.exit_code,
                    start_time: Utc
                        .timestamp_opt(payload.start_time, 0)
                        .single()
                        .unwrap_or(start),
                    end_time: Utc
                        .timestamp_opt(payload.end_time, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            }
            // The agent vanished mid-run (socket closed drops the sender).
            Ok(Err(_)) | Err(_) => {
                let end = Utc::now();
                warn!(
                    task_id = task.id,
                    agent_id, log_id, "timed out waiting for agent result"
                );
                Ok(CommandResult {
                    status: RunStatus::Failed,
                    error: Some(CapstanError::AgentResultTimeout.to_string()),
                    duration_ms: (end - start).num_milliseconds(),
                    exit_code: -1,
                    start_time: start,
                    end_time: end,
                })
            }
        }
    }

    /// Asks the agent to cancel a run by log id.
    pub fn stop(&self, agent_id: u64, log_id: u64) -> Result<(), CapstanError> {
        self.gateway
            .send_to_agent(agent_id, Frame::new(FrameKind::Stop, &StopPayload { log_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livelog::LiveLogRegistry;
    use crate::models::{TaskKind, TaskRunConfig, TriggerKind};
    use crate::models::{Agent, AgentStatus};
    use crate::repository::MemoryRepository;

    fn agent_task(id: u64, agent_id: u64, timeout_minutes: f64) -> Task {
        Task {
            id,
            name: format!("remote-{id}"),
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
            run_config: TaskRunConfig { concurrency: 1 },
            repo_config: None,
            clean_config: None,
            running_tokens: vec![],
            last_run: None,
            next_run: None,
        }
    }

    fn agent(id: u64, enabled: bool) -> Agent {
        Agent {
            id,
            name: format!("agent-{id}"),
            token: format!("token-{id}"),
            machine_id: "m".into(),
            status: AgentStatus::Online,
            last_seen: None,
            hostname: String::new(),
            os: String::new(),
            arch: String::new(),
            version: String::new(),
            enabled,
            force_update: false,
        }
    }

    async fn dispatcher() -> (RemoteDispatcher, Arc<MemoryRepository>, AgentGateway) {
        let repo = Arc::new(MemoryRepository::new());
        let gateway = AgentGateway::new(repo.clone(), LiveLogRegistry::new());
        let dispatcher = RemoteDispatcher::new(repo.clone(), gateway.clone());
        (dispatcher, repo, gateway)
    }

    #[tokio::test]
    async fn missing_agent_is_an_error() {
        let (dispatcher, repo, _gw) = dispatcher().await;
        let task = repo.insert_task(agent_task(1, 99, 1.0)).await;

        assert!(matches!(
            dispatcher.execute(&task, 10).await,
            Err(CapstanError::AgentNotFound(99))
        ));
    }

    #[tokio::test]
    async fn disabled_agent_is_an_error() {
        let (dispatcher, repo, _gw) = dispatcher().await;
        repo.insert_agent(agent(5, false)).await;
        let task = repo.insert_task(agent_task(1, 5, 1.0)).await;

        assert!(matches!(
            dispatcher.execute(&task, 10).await,
            Err(CapstanError::AgentDisabled(5))
        ));
    }

    #[tokio::test]
    async fn disconnected_agent_is_an_error_and_waiter_is_cleaned() {
        let (dispatcher, repo, gateway) = dispatcher().await;
        repo.insert_agent(agent(5, true)).await;
        let task = repo.insert_task(agent_task(1, 5, 1.0)).await;

        assert!(matches!(
            dispatcher.execute(&task, 10).await,
            Err(CapstanError::AgentNotConnected(5))
        ));

        // The waiter slot is free again: a late result takes the
        // fallback path instead of finding a dangling sender.
        gateway
            .handle_task_result(
                5,
                crate::frames::TaskResultPayload {
                    task_id: 1,
                    log_id: 10,
                    status: "success".into(),
                    ..Default::default()
                },
            )
            .await;
        assert!(repo.get_task_log(10).await.unwrap().is_some());
    }
}
