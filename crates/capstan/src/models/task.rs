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

//! Task definitions.
//!
//! A task is either local (runs on the control node) or agent-bound
//! (`agent_id` set) — never both. Type-specific settings arrive from
//! storage as a JSON blob and are parsed exactly once on load into the
//! tagged [`TaskRunConfig`] / [`RepoSyncConfig`] shapes; dispatch never
//! re-parses JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of work the task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// A plain shell command.
    Task,
    /// A repository mirror task; the command is synthesized at dispatch
    /// time from [`RepoSyncConfig`].
    Repo,
}

/// What causes the task to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Fired by the cron dispatcher on its schedule.
    Cron,
    /// Fired once, shortly after the control node boots. The cron
    /// expression may be empty for these.
    Startup,
}

/// Per-task runtime settings (the `config` blob for `TaskKind::Task`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskRunConfig {
    /// 0 forbids parallel runs (the concurrency gate rejects a second
    /// in-flight run); 1 allows them.
    #[serde(default)]
    pub concurrency: u8,
}

/// Repository mirror settings (the `config` blob for `TaskKind::Repo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepoSyncConfig {
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub sparse_path: String,
    #[serde(default)]
    pub single_file: bool,
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub proxy_url: String,
    #[serde(default)]
    pub auth_token: String,
}

/// Log retention policy (the `clean_config` blob).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "lowercase")]
pub enum KeepPolicy {
    /// Keep the most recent N rows by creation order.
    Count(u32),
    /// Keep rows created within the last N days.
    Days(u32),
}

/// A persistent task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub name: String,
    pub command: String,
    pub kind: TaskKind,
    pub trigger: TriggerKind,
    /// Six-field cron expression (second minute hour dom month dow).
    pub schedule: String,
    /// Timeout in minutes; fractional values are honored, 0 means the
    /// 30-minute default.
    pub timeout_minutes: f64,
    pub work_dir: String,
    /// References into the environment-variable store, resolved at
    /// dispatch time.
    #[serde(default)]
    pub env_ids: Vec<u64>,
    /// Interpreter version pins carried alongside the command.
    #[serde(default)]
    pub language_pins: Vec<String>,
    /// Remote worker to run on; `None` means local execution.
    pub agent_id: Option<u64>,
    pub enabled: bool,
    #[serde(default)]
    pub run_config: TaskRunConfig,
    #[serde(default)]
    pub repo_config: Option<RepoSyncConfig>,
    #[serde(default)]
    pub clean_config: Option<KeepPolicy>,
    /// Tokens of in-flight runs, maintained transactionally by the store.
    #[serde(default)]
    pub running_tokens: Vec<i64>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether this task runs on a remote agent.
    pub fn is_agent_bound(&self) -> bool {
        matches!(self.agent_id, Some(id) if id > 0)
    }

    /// Whether the concurrency gate forbids parallel runs.
    pub fn is_exclusive(&self) -> bool {
        self.run_config.concurrency == 0
    }
}
