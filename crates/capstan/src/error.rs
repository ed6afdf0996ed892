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

//! Error types for the Capstan engine.
//!
//! User-input errors (invalid cron, unknown agent) and coordination errors
//! (gate rejection, queue full) are surfaced synchronously through these
//! variants. Execution failures — a child exiting non-zero, a timeout — are
//! *not* errors: they are terminal [`RunStatus`](crate::scheduler::RunStatus)
//! values on the result.

use thiserror::Error;

/// Errors produced by the scheduling and coordination engine.
#[derive(Debug, Error)]
pub enum CapstanError {
    /// The bounded request queue is at capacity.
    #[error("task queue is full")]
    QueueFull,

    /// The scheduler has been stopped and accepts no new requests.
    #[error("scheduler is stopped")]
    SchedulerStopped,

    /// A cron expression failed to parse. Cron expressions use six fields
    /// (second minute hour day-of-month month day-of-week).
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// The referenced task does not exist.
    #[error("task {0} not found")]
    TaskNotFound(String),

    /// The referenced log row does not exist.
    #[error("task log #{0} not found")]
    LogNotFound(u64),

    /// The per-task concurrency gate refused a new run.
    #[error("task is already running, parallel execution refused")]
    AlreadyRunning,

    /// The run referenced by a stop request is not in flight.
    #[error("task is not currently running")]
    NotRunning,

    /// The referenced agent does not exist.
    #[error("agent #{0} not found")]
    AgentNotFound(u64),

    /// The referenced agent exists but is disabled.
    #[error("agent #{0} is disabled")]
    AgentDisabled(u64),

    /// The referenced agent holds no live connection.
    #[error("agent #{0} is not connected")]
    AgentNotConnected(u64),

    /// No result frame arrived within the task's timeout window.
    #[error("waiting for agent result timed out")]
    AgentResultTimeout,

    /// The child process could not be started.
    #[error("failed to start command: {0}")]
    SpawnFailed(String),

    /// A failure inside the execution path that is not a child exit status.
    #[error("execution error: {0}")]
    Execution(String),

    /// Storage-layer failure behind the repository contract.
    #[error("repository error: {0}")]
    Repository(String),

    /// Malformed configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
