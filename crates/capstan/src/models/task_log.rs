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

//! Run history rows.
//!
//! One `TaskLog` row exists per attempted run. The row is created with
//! status `running` before execution starts and finalized at completion;
//! rows outlive their task. `output` holds base64(zlib(utf8)) of the
//! merged stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::RunStatus;

/// A persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: u64,
    pub task_id: u64,
    pub agent_id: Option<u64>,
    pub command: String,
    pub status: RunStatus,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// base64-of-zlib compressed merged output.
    pub output: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to open a new log row before execution starts.
#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: u64,
    pub agent_id: Option<u64>,
    pub command: String,
}

impl NewTaskLog {
    pub fn new(task_id: u64, command: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id: None,
            command: command.into(),
        }
    }
}
