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

//! Request and result value objects.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Fired by the cron dispatcher.
    Cron,
    /// Requested explicitly by a caller.
    Manual,
    /// Internal maintenance command with no task row.
    System,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    /// Whether this is a terminal state.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Timeout | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One intended run.
///
/// Created by the cron dispatcher or the coordinator and consumed by a
/// worker. After enqueue the only mutation is the pre-execution hook
/// assigning `log_id` and the run-token metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Task row id as a string; empty for system commands.
    pub task_id: String,
    /// Log row this run streams into; 0 until the pre-execution hook
    /// allocates one (and permanently 0 for untracked runs).
    #[serde(default)]
    pub log_id: u64,
    pub name: String,
    pub run_type: RunType,
    pub command: String,
    #[serde(default)]
    pub work_dir: String,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub envs: Vec<String>,
    /// Minutes; fractional values are honored, `<= 0` means the default.
    #[serde(default)]
    pub timeout_minutes: f64,
    /// Opaque bag for coordination state (e.g. the run token).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionRequest {
    pub fn system(command: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            log_id: 0,
            name: String::new(),
            run_type: RunType::System,
            command: command.into(),
            work_dir: String::new(),
            envs: Vec::new(),
            timeout_minutes: 0.0,
            metadata: HashMap::new(),
        }
    }

    /// Numeric task id, when the request is bound to a task row.
    pub fn task_row_id(&self) -> Option<u64> {
        self.task_id.parse().ok().filter(|id| *id > 0)
    }
}

/// Produced exactly once per request that reaches a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub log_id: u64,
    pub success: bool,
    /// Merged output; elided once the run reaches the bounded result ring
    /// in a finished state.
    pub output: String,
    pub error: String,
    pub status: RunStatus,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ExecutionResult {
    /// A result for a run that never started.
    pub fn rejected(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            log_id: 0,
            success: false,
            output: String::new(),
            error: error.into(),
            status: RunStatus::Failed,
            duration_ms: 0,
            exit_code: 1,
            start_time: now,
            end_time: now,
        }
    }

    /// A result for a run accepted into the queue.
    pub fn queued(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            log_id: 0,
            success: true,
            output: String::new(),
            error: String::new(),
            status: RunStatus::Queued,
            duration_ms: 0,
            exit_code: 0,
            start_time: now,
            end_time: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Timeout).unwrap(),
            r#""timeout""#
        );
        let parsed: RunStatus = serde_json::from_str(r#""cancelled""#).unwrap();
        assert_eq!(parsed, RunStatus::Cancelled);
    }

    #[test]
    fn finished_states_are_terminal() {
        assert!(RunStatus::Success.is_finished());
        assert!(RunStatus::Timeout.is_finished());
        assert!(!RunStatus::Queued.is_finished());
        assert!(!RunStatus::Running.is_finished());
    }

    #[test]
    fn task_row_id_parses_only_positive_numbers() {
        let mut req = ExecutionRequest::system("true");
        assert_eq!(req.task_row_id(), None);
        req.task_id = "42".into();
        assert_eq!(req.task_row_id(), Some(42));
        req.task_id = "0".into();
        assert_eq!(req.task_row_id(), None);
    }
}
