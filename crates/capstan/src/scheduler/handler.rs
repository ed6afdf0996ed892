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

//! The event-handler capability injected into the scheduler.
//!
//! The control node and the agent implement this trait differently: the
//! control node's coordinator opens log rows and live collectors, the
//! agent streams frames back over its connection. The scheduler only ever
//! sees the capability, so no reference cycle exists between it and the
//! coordination layer.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use crate::error::CapstanError;
use crate::sink::SharedSink;

use super::{ExecutionRequest, ExecutionResult};

/// Scheduler lifecycle callbacks.
///
/// `on_task_completed` fires whenever the executor produced a result —
/// including failed, timed-out, and cancelled runs. `on_task_failed` fires
/// only when there is no result at all (the child never started, or the
/// pre-execution hook rejected the run). Exactly one of the two fires per
/// request that reaches a worker.
#[async_trait]
pub trait SchedulerEventHandler: Send + Sync {
    /// The request was accepted into the queue.
    async fn on_task_scheduled(&self, _req: &ExecutionRequest) {}

    /// The run is about to start: open the log row and return the output
    /// writers. Returning the *same* sink for stdout and stderr requests
    /// merged output (and enables PTY mode); returning `None` runs the
    /// command without any log.
    async fn on_task_executing(
        &self,
        _req: &mut ExecutionRequest,
    ) -> Result<Option<(SharedSink, SharedSink)>, CapstanError> {
        Ok(None)
    }

    /// The run cleared the queue and the rate limiter.
    async fn on_task_started(&self, _req: &ExecutionRequest) {}

    /// The executor produced a terminal result.
    async fn on_task_completed(&self, _req: &ExecutionRequest, _result: &ExecutionResult) {}

    /// The run produced no result (start failure or rejected hook).
    async fn on_task_failed(&self, _req: &ExecutionRequest, _error: &CapstanError) {}

    /// Periodic liveness signal while the child runs (every 3 s).
    async fn on_task_heartbeat(&self, _req: &ExecutionRequest, _elapsed_ms: i64) {}

    /// The cron dispatcher computed the next fire time for this task.
    async fn on_cron_next_run(&self, _req: &ExecutionRequest, _next_run: DateTime<FixedOffset>) {}
}
