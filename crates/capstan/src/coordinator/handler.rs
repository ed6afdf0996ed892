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

//! The coordinator's scheduler event handler.
//!
//! Owns the log-row lifecycle: `on_task_executing` passes the concurrency
//! gate, opens the row with status `running`, and allocates the live
//! collector; `on_task_completed` / `on_task_failed` compress the stream,
//! finalize the row, release the run slot, and apply retention. Terminal
//! events never precede the last byte written — the collector is closed
//! here, after the executor has drained the child.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use tracing::{error, info, warn};

use crate::error::CapstanError;
use crate::livelog::compress_to_base64;
use crate::models::NewTaskLog;
use crate::scheduler::{
    ExecutionRequest, ExecutionResult, RunStatus, SchedulerEventHandler,
};
use crate::sink::SharedSink;

use super::{CoordinatorState, RUN_TOKEN_KEY};

/// Implements the scheduler capability for the control node.
pub struct CoordinatorHandler {
    state: Arc<CoordinatorState>,
}

impl CoordinatorHandler {
    pub(crate) fn new(state: Arc<CoordinatorState>) -> Self {
        Self { state }
    }

    fn run_token(req: &ExecutionRequest) -> Option<i64> {
        req.metadata.get(RUN_TOKEN_KEY).and_then(|v| v.as_i64())
    }

    async fn release_token(&self, task_id: u64, req: &ExecutionRequest) {
        if let Some(token) = Self::run_token(req) {
            let _ = self.state.repo.release_run_slot(task_id, token).await;
        }
    }

    async fn apply_retention(&self, task_id: u64) {
        if let Ok(Some(task)) = self.state.repo.get_task(task_id).await {
            if let Some(policy) = task.clean_config {
                match self.state.repo.delete_old_logs(task_id, policy).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(task_id, deleted, "old task logs removed"),
                    Err(err) => warn!(task_id, error = %err, "log retention failed"),
                }
            }
        }
    }
}

#[async_trait]
impl SchedulerEventHandler for CoordinatorHandler {
    async fn on_task_executing(
        &self,
        req: &mut ExecutionRequest,
    ) -> Result<Option<(SharedSink, SharedSink)>, CapstanError> {
        // System commands carry no task row and get no log.
        let Some(task_id) = req.task_row_id() else {
            return Ok(None);
        };
        let Some(task) = self.state.repo.get_task(task_id).await? else {
            return Ok(None);
        };

        // Transactional concurrency gate. Rejection happens before any
        // row exists, so a refused run leaves no trace.
        let token = rand::random::<u32>() as i64;
        self.state.repo.acquire_run_slot(task_id, token).await?;

        let mut new_log = NewTaskLog::new(task_id, req.command.clone());
        new_log.agent_id = task.agent_id.filter(|id| *id > 0);
        let row = match self.state.repo.create_task_log(new_log).await {
            Ok(row) => row,
            Err(err) => {
                let _ = self.state.repo.release_run_slot(task_id, token).await;
                return Err(err);
            }
        };

        req.log_id = row.id;
        req.metadata
            .insert(RUN_TOKEN_KEY.to_string(), serde_json::json!(token));

        let livelog = match self.state.livelogs.create(row.id) {
            Ok(livelog) => livelog,
            Err(err) => {
                let _ = self.state.repo.release_run_slot(task_id, token).await;
                return Err(CapstanError::Io(err));
            }
        };

        self.state.update_result(ExecutionResult {
            task_id: req.task_id.clone(),
            log_id: row.id,
            success: false,
            output: String::new(),
            error: String::new(),
            status: RunStatus::Running,
            duration_ms: 0,
            exit_code: 0,
            start_time: Utc::now(),
            end_time: Utc::now(),
        });

        // One collector serves both streams: merged output, PTY eligible.
        let sink: SharedSink = livelog;
        Ok(Some((sink.clone(), sink)))
    }

    async fn on_task_completed(&self, req: &ExecutionRequest, result: &ExecutionResult) {
        if req.log_id == 0 {
            return;
        }
        let Some(task_id) = req.task_row_id() else {
            return;
        };

        self.release_token(task_id, req).await;

        let output = match self.state.livelogs.get(req.log_id) {
            Some(livelog) => livelog.compress_and_cleanup().unwrap_or_else(|err| {
                error!(log_id = req.log_id, error = %err, "log compression failed");
                format!("[System Error] log compression failed: {err}")
            }),
            // The collector is gone; fall back to the captured output.
            None => compress_to_base64(&result.output).unwrap_or_default(),
        };

        match self.state.repo.get_task_log(req.log_id).await {
            Ok(Some(mut row)) => {
                row.status = result.status;
                row.duration_ms = result.duration_ms;
                row.exit_code = result.exit_code;
                row.output = output;
                row.error = result.error.clone();
                row.start_time = Some(result.start_time);
                row.end_time = Some(result.end_time);
                if let Err(err) = self.state.repo.save_task_log(&row).await {
                    error!(log_id = req.log_id, error = %err, "failed to finalize log row");
                }
            }
            Ok(None) => {
                warn!(log_id = req.log_id, "log row vanished before finalization");
            }
            Err(err) => {
                error!(log_id = req.log_id, error = %err, "failed to load log row");
            }
        }

        let _ = self
            .state
            .repo
            .update_task_meta(task_id, Some(result.end_time), None)
            .await;

        self.apply_retention(task_id).await;
        self.state.update_result(result.clone());
    }

    async fn on_task_failed(&self, req: &ExecutionRequest, err: &CapstanError) {
        if req.log_id == 0 {
            return;
        }
        let task_id = req.task_row_id().unwrap_or_default();
        if task_id > 0 {
            self.release_token(task_id, req).await;
        }

        let output = match self.state.livelogs.get(req.log_id) {
            Some(livelog) => {
                let _ = livelog.write(format!("\n[System Error] {err}").as_bytes());
                livelog.compress_and_cleanup().unwrap_or_default()
            }
            None => compress_to_base64(&format!("task execution failed: {err}"))
                .unwrap_or_default(),
        };

        let now = Utc::now();
        match self.state.repo.get_task_log(req.log_id).await {
            Ok(Some(mut row)) => {
                row.status = RunStatus::Failed;
                row.duration_ms = 0;
                row.exit_code = 1;
                row.output = output;
                row.error = err.to_string();
                row.end_time = Some(now);
                if let Err(save_err) = self.state.repo.save_task_log(&row).await {
                    error!(log_id = req.log_id, error = %save_err, "failed to save failed log row");
                }
            }
            _ => {
                warn!(log_id = req.log_id, "log row missing for failed run");
            }
        }

        if task_id > 0 {
            self.apply_retention(task_id).await;
        }

        let mut ring_entry = ExecutionResult::rejected(req.task_id.clone(), err.to_string());
        ring_entry.log_id = req.log_id;
        self.state.update_result(ring_entry);
    }

    async fn on_task_heartbeat(&self, req: &ExecutionRequest, elapsed_ms: i64) {
        if req.log_id > 0 {
            let _ = self
                .state
                .repo
                .update_log_duration(req.log_id, elapsed_ms)
                .await;
        }

        // Once a minute, remind the operator the task is still alive.
        if elapsed_ms >= 60_000 && elapsed_ms / 60_000 > (elapsed_ms - 3_000) / 60_000 {
            info!(
                task_id = %req.task_id,
                elapsed_s = elapsed_ms / 1000,
                "task still running"
            );
        }
    }

    async fn on_cron_next_run(&self, req: &ExecutionRequest, next_run: DateTime<FixedOffset>) {
        if let Some(task_id) = req.task_row_id() {
            let _ = self
                .state
                .repo
                .update_task_meta(task_id, None, Some(next_run.with_timezone(&Utc)))
                .await;
        }
    }
}
