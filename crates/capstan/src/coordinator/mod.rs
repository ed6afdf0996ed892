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

//! Task coordinator.
//!
//! Binds the worker pool and the cron dispatcher to the persistent
//! task/log model: the per-task concurrency gate, the log-row lifecycle
//! (create → update → compress → finalize), retention, the bounded result
//! ring, startup triggers, and routing of agent-bound runs through the
//! remote dispatcher.
//!
//! The coordinator's event-handling half is a separate
//! [`CoordinatorHandler`] so the scheduler only ever holds the capability,
//! never the coordinator itself.

mod handler;

pub use handler::CoordinatorHandler;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use tracing::{info, warn};

use crate::cron::{CronDispatcher, CronJobSpec};
use crate::error::CapstanError;
use crate::executor::{self, ExecutorArgs};
use crate::gateway::AgentGateway;
use crate::livelog::LiveLogRegistry;
use crate::models::{Task, TaskKind, TriggerKind};
use crate::remote::RemoteDispatcher;
use crate::repository::{Repository, TaskFilter};
use crate::scheduler::{
    DynExecutor, ExecutionRequest, ExecutionResult, RunStatus, RunType, Scheduler,
};

/// Metadata key carrying the run token through a request.
pub(crate) const RUN_TOKEN_KEY: &str = "run_token";

/// Bound of the in-memory result ring.
const RESULT_RING_CAPACITY: usize = 100;

/// Delay before startup-triggered tasks fire after boot.
const STARTUP_TRIGGER_DELAY: Duration = Duration::from_secs(3);

/// Default directory repo-sync targets resolve against.
const SCRIPTS_WORK_DIR: &str = "scripts";

/// State shared between the coordinator and its event handler.
pub(crate) struct CoordinatorState {
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) livelogs: Arc<LiveLogRegistry>,
    pub(crate) results: StdMutex<VecDeque<ExecutionResult>>,
}

impl CoordinatorState {
    /// Updates the bounded result ring. Finished entries drop their
    /// output to keep the ring small; full logs live in the store.
    pub(crate) fn update_result(&self, mut result: ExecutionResult) {
        if result.status.is_finished() {
            result.output = String::new();
        }

        let mut ring = self.results.lock().expect("result ring poisoned");
        if result.log_id != 0 {
            if let Some(existing) = ring.iter_mut().find(|r| r.log_id == result.log_id) {
                *existing = result;
                return;
            }
        }
        if ring.len() >= RESULT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(result);
    }
}

/// The coordination engine of the control node.
pub struct TaskCoordinator {
    state: Arc<CoordinatorState>,
    scheduler: Scheduler,
    cron: CronDispatcher,
    remote: RemoteDispatcher,
    gateway: AgentGateway,
}

impl TaskCoordinator {
    /// Wires the scheduler, cron dispatcher, and remote dispatcher
    /// together. Scheduler tuning comes from the settings contract.
    pub async fn new(
        repo: Arc<dyn Repository>,
        livelogs: Arc<LiveLogRegistry>,
        gateway: AgentGateway,
    ) -> Result<Self, CapstanError> {
        let settings = repo.scheduler_settings().await?;
        let config = crate::scheduler::SchedulerConfig {
            worker_count: settings.worker_count,
            queue_size: settings.queue_size,
            rate_interval: Duration::from_millis(settings.rate_interval_ms),
        };

        let state = Arc::new(CoordinatorState {
            repo: repo.clone(),
            livelogs,
            results: StdMutex::new(VecDeque::with_capacity(RESULT_RING_CAPACITY)),
        });

        let handler = Arc::new(CoordinatorHandler::new(state.clone()));
        let scheduler = Scheduler::new(config, handler.clone());
        let cron = CronDispatcher::new(scheduler.clone(), handler);
        let remote = RemoteDispatcher::new(repo, gateway.clone());

        scheduler.set_executor(dispatch_executor(state.clone(), remote.clone()));

        Ok(Self {
            state,
            scheduler,
            cron,
            remote,
            gateway,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn cron(&self) -> &CronDispatcher {
        &self.cron
    }

    pub fn gateway(&self) -> &AgentGateway {
        &self.gateway
    }

    /// Boots the engine: clears stale run tokens, starts workers and the
    /// cron loop, registers enabled local cron tasks, and arms startup
    /// triggers.
    pub async fn start(&self) -> Result<(), CapstanError> {
        // Tokens left behind by a crash would wedge exclusive tasks
        // forever; drop them all before anything runs.
        self.state.repo.clear_run_slots().await?;

        self.scheduler.start().await;
        self.cron.start();

        let tasks = self
            .state
            .repo
            .list_tasks(TaskFilter {
                enabled_only: true,
                ..Default::default()
            })
            .await?;

        let mut scheduled = 0usize;
        for task in tasks {
            match task.trigger {
                TriggerKind::Startup => {
                    self.arm_startup_trigger(&task);
                }
                TriggerKind::Cron => {
                    if task.schedule.is_empty() || task.is_agent_bound() {
                        continue;
                    }
                    match self.cron.add_task(cron_spec(&task)).await {
                        Ok(()) => scheduled += 1,
                        Err(err) => {
                            warn!(task_id = task.id, error = %err, "failed to schedule task")
                        }
                    }
                }
            }
        }
        info!(scheduled, "cron tasks loaded");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cron.stop();
        self.scheduler.stop().await;
    }

    /// Re-reads scheduler settings and rebuilds the worker pool.
    pub async fn reload(&self) -> Result<(), CapstanError> {
        let settings = self.state.repo.scheduler_settings().await?;
        self.scheduler
            .reload(crate::scheduler::SchedulerConfig {
                worker_count: settings.worker_count,
                queue_size: settings.queue_size,
                rate_interval: Duration::from_millis(settings.rate_interval_ms),
            })
            .await;
        Ok(())
    }

    fn arm_startup_trigger(&self, task: &Task) {
        let coordinator_state = self.state.clone();
        let scheduler = self.scheduler.clone();
        let task_id = task.id;
        let name = task.name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_TRIGGER_DELAY).await;
            info!(task_id, name = %name, "firing startup trigger");
            let result =
                execute_task_inner(&coordinator_state, &scheduler, task_id, None).await;
            if !result.success {
                warn!(task_id, error = %result.error, "startup trigger rejected");
            }
        });
    }

    /// Queues a manual run of a task. The read-only concurrency check
    /// rejects without creating a log row; the authoritative gate runs
    /// again transactionally when the run leaves the queue.
    pub async fn execute_task(
        &self,
        task_id: u64,
        extra_envs: Option<Vec<String>>,
    ) -> ExecutionResult {
        execute_task_inner(&self.state, &self.scheduler, task_id, extra_envs).await
    }

    /// Stops a run by log id, routing to the agent for remote runs.
    pub async fn stop_run(&self, log_id: u64) -> Result<(), CapstanError> {
        let log = self
            .state
            .repo
            .get_task_log(log_id)
            .await?
            .ok_or(CapstanError::LogNotFound(log_id))?;
        if log.status != RunStatus::Running {
            return Err(CapstanError::NotRunning);
        }

        let task = self
            .state
            .repo
            .get_task(log.task_id)
            .await?
            .ok_or_else(|| CapstanError::TaskNotFound(log.task_id.to_string()))?;

        if let Some(agent_id) = task.agent_id.filter(|id| *id > 0) {
            info!(task_id = task.id, agent_id, log_id, "stopping remote run");
            return self.remote.stop(agent_id, log_id);
        }

        info!(task_id = task.id, log_id, "stopping local run");
        if self.scheduler.stop_log(log_id) {
            Ok(())
        } else {
            Err(CapstanError::NotRunning)
        }
    }

    /// Runs a system command synchronously, outside any task row.
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        envs: Vec<String>,
        work_dir: &str,
    ) -> Result<ExecutionResult, CapstanError> {
        let mut req = ExecutionRequest::system(command);
        req.timeout_minutes = timeout.as_secs_f64() / 60.0;
        req.envs = envs;
        req.work_dir = work_dir.to_string();
        self.scheduler.execute_sync(req).await
    }

    /// Most recent results, newest first.
    pub fn last_results(&self, count: usize) -> Vec<ExecutionResult> {
        let ring = self.state.results.lock().expect("result ring poisoned");
        ring.iter().rev().take(count).cloned().collect()
    }

    /// Registers, refreshes, or removes the cron entry for a task after a
    /// definition change.
    pub async fn sync_cron_task(&self, task: &Task) -> Result<(), CapstanError> {
        let eligible = task.enabled
            && task.trigger == TriggerKind::Cron
            && !task.schedule.is_empty()
            && !task.is_agent_bound();
        if eligible {
            self.cron.add_task(cron_spec(task)).await
        } else {
            self.cron.remove_task(&task.id.to_string());
            Ok(())
        }
    }

    pub fn remove_cron_task(&self, task_id: u64) {
        self.cron.remove_task(&task_id.to_string());
    }

    pub fn validate_cron(&self, expression: &str) -> Result<(), CapstanError> {
        crate::cron::validate_cron(expression)
    }

    pub fn running_count(&self) -> usize {
        self.scheduler.running_count()
    }
}

async fn execute_task_inner(
    state: &Arc<CoordinatorState>,
    scheduler: &Scheduler,
    task_id: u64,
    extra_envs: Option<Vec<String>>,
) -> ExecutionResult {
    let task = match state.repo.get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return ExecutionResult::rejected(
                task_id.to_string(),
                CapstanError::TaskNotFound(task_id.to_string()).to_string(),
            )
        }
        Err(err) => return ExecutionResult::rejected(task_id.to_string(), err.to_string()),
    };

    // Read-only gate: reject early, before any log row exists.
    if task.is_exclusive() && !task.running_tokens.is_empty() {
        return ExecutionResult::rejected(
            task_id.to_string(),
            CapstanError::AlreadyRunning.to_string(),
        );
    }

    let mut envs = match state.repo.resolve_envs(&task.env_ids).await {
        Ok(envs) => envs,
        Err(err) => return ExecutionResult::rejected(task_id.to_string(), err.to_string()),
    };
    if let Some(extra) = extra_envs {
        envs.extend(extra);
    }

    let req = ExecutionRequest {
        task_id: task.id.to_string(),
        log_id: 0,
        name: task.name.clone(),
        run_type: RunType::Manual,
        command: task.command.clone(),
        work_dir: task.work_dir.clone(),
        envs,
        timeout_minutes: task.timeout_minutes,
        metadata: Default::default(),
    };

    scheduler.enqueue_or_execute(req).await;
    ExecutionResult::queued(task.id.to_string())
}

/// The execution function injected into the scheduler: rewrites repo-sync
/// commands, resolves environment references, and routes agent-bound
/// tasks to the remote dispatcher; everything else runs locally.
fn dispatch_executor(state: Arc<CoordinatorState>, remote: RemoteDispatcher) -> DynExecutor {
    Arc::new(move |mut args: ExecutorArgs| {
        let state = state.clone();
        let remote = remote.clone();
        async move {
            let task = match args.request.task_row_id() {
                Some(id) => state.repo.get_task(id).await?,
                None => None,
            };

            // System commands and vanished tasks run as plain commands.
            let Some(task) = task else {
                return executor::execute(args).await;
            };

            if task.kind == TaskKind::Repo {
                if let Some(command) = build_repo_command(&task) {
                    args.request.command = command;
                }
            }

            let mut refs = state.repo.resolve_envs(&task.env_ids).await?;
            args.request.envs.append(&mut refs);

            if task.is_agent_bound() {
                return remote.execute(&task, args.request.log_id).await;
            }

            executor::execute(args).await
        }
        .boxed()
    })
}

/// Synthesizes the reposync invocation for a repo-type task from its
/// parsed config.
fn build_repo_command(task: &Task) -> Option<String> {
    let config = task.repo_config.as_ref()?;
    if config.source_url.is_empty() {
        return None;
    }

    let target = if config.target_path.is_empty() {
        SCRIPTS_WORK_DIR.to_string()
    } else if std::path::Path::new(&config.target_path).is_absolute() {
        config.target_path.clone()
    } else {
        format!("{SCRIPTS_WORK_DIR}/{}", config.target_path)
    };
    let target = std::path::absolute(&target)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(target);

    let mut parts = vec![
        "capstan-ctl".to_string(),
        "reposync".to_string(),
        "--source-type".to_string(),
        config.source_type.clone(),
        "--source-url".to_string(),
        config.source_url.clone(),
        "--target-path".to_string(),
        target,
    ];
    if !config.branch.is_empty() {
        parts.push("--branch".to_string());
        parts.push(config.branch.clone());
    }
    if !config.sparse_path.is_empty() {
        parts.push("--path".to_string());
        parts.push(config.sparse_path.clone());
    }
    if config.single_file {
        parts.push("--single-file".to_string());
    }
    if !config.proxy.is_empty() && config.proxy != "none" {
        parts.push("--proxy".to_string());
        parts.push(config.proxy.clone());
        if config.proxy == "custom" && !config.proxy_url.is_empty() {
            parts.push("--proxy-url".to_string());
            parts.push(config.proxy_url.clone());
        }
    }
    if !config.auth_token.is_empty() {
        parts.push("--auth-token".to_string());
        parts.push(config.auth_token.clone());
    }

    Some(parts.join(" "))
}

fn cron_spec(task: &Task) -> CronJobSpec {
    CronJobSpec {
        task_id: task.id.to_string(),
        name: task.name.clone(),
        command: task.command.clone(),
        schedule: task.schedule.clone(),
        timeout_minutes: task.timeout_minutes,
        work_dir: task.work_dir.clone(),
        envs: String::new(),
    }
}

#[cfg(test)]
mod tests;
