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

//! The storage contract.
//!
//! The engine never talks to a database directly; it reads and writes
//! through this trait. Any store with transactional row-level locking can
//! implement it. Run-slot operations (`acquire_run_slot` and friends) must
//! be atomic per task row — the check of the concurrency policy and the
//! append of the run token happen inside one lock so two racing runs can
//! never both pass an exclusive gate.
//!
//! [`MemoryRepository`] is the in-crate implementation used by tests and
//! by a control node running without external storage.

mod memory;

pub use memory::MemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CapstanError;
use crate::models::{Agent, KeepPolicy, NewAgent, NewTaskLog, Task, TaskLog};

/// Which tasks `list_tasks` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    /// Restrict to enabled tasks.
    pub enabled_only: bool,
    /// `Some(id)` restricts to tasks bound to that agent; `Some(0)` and
    /// `None` are treated below via [`TaskFilter::local_only`].
    pub agent_id: Option<u64>,
    /// Restrict to tasks with no agent binding.
    pub local_only: bool,
}

/// Scheduler tuning stored in the settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    pub queue_size: usize,
    pub rate_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 100,
            rate_interval_ms: 200,
        }
    }
}

/// Storage operations the engine depends on.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- tasks ---

    async fn get_task(&self, id: u64) -> Result<Option<Task>, CapstanError>;

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, CapstanError>;

    /// Updates scheduling metadata; `None` fields are left untouched.
    async fn update_task_meta(
        &self,
        id: u64,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), CapstanError>;

    /// Atomically checks the task's concurrency policy and appends a run
    /// token. Fails with [`CapstanError::AlreadyRunning`] when the task is
    /// exclusive and a run is in flight.
    async fn acquire_run_slot(&self, id: u64, token: i64) -> Result<(), CapstanError>;

    /// Removes a run token; unknown tokens are ignored.
    async fn release_run_slot(&self, id: u64, token: i64) -> Result<(), CapstanError>;

    /// Drops every run token on every task. Called once at boot to clear
    /// tokens left behind by a crash.
    async fn clear_run_slots(&self) -> Result<(), CapstanError>;

    // --- task logs ---

    /// Opens a log row with status `running` and returns it with its id
    /// assigned.
    async fn create_task_log(&self, log: NewTaskLog) -> Result<TaskLog, CapstanError>;

    async fn save_task_log(&self, log: &TaskLog) -> Result<(), CapstanError>;

    async fn get_task_log(&self, id: u64) -> Result<Option<TaskLog>, CapstanError>;

    /// Refreshes the running duration of an in-flight row.
    async fn update_log_duration(&self, id: u64, duration_ms: i64) -> Result<(), CapstanError>;

    /// Applies a retention policy; returns how many rows were deleted.
    async fn delete_old_logs(&self, task_id: u64, policy: KeepPolicy)
        -> Result<u64, CapstanError>;

    // --- agents ---

    async fn get_agent(&self, id: u64) -> Result<Option<Agent>, CapstanError>;

    async fn find_agent_by_token(&self, token: &str) -> Result<Option<Agent>, CapstanError>;

    /// Consumes a one-shot registration token. Returns whether the token
    /// was valid.
    async fn take_registration_token(&self, token: &str) -> Result<bool, CapstanError>;

    async fn register_agent(&self, agent: NewAgent) -> Result<Agent, CapstanError>;

    async fn save_agent(&self, agent: &Agent) -> Result<(), CapstanError>;

    // --- environment & settings ---

    /// Resolves environment references into `KEY=VALUE` pairs.
    async fn resolve_envs(&self, ids: &[u64]) -> Result<Vec<String>, CapstanError>;

    async fn get_setting(&self, section: &str, key: &str)
        -> Result<Option<String>, CapstanError>;

    /// Scheduler tuning with defaults applied.
    async fn scheduler_settings(&self) -> Result<SchedulerSettings, CapstanError> {
        let mut settings = SchedulerSettings::default();
        if let Some(v) = self.get_setting("scheduler", "worker_count").await? {
            if let Ok(n) = v.parse() {
                settings.worker_count = n;
            }
        }
        if let Some(v) = self.get_setting("scheduler", "queue_size").await? {
            if let Ok(n) = v.parse() {
                settings.queue_size = n;
            }
        }
        if let Some(v) = self.get_setting("scheduler", "rate_interval").await? {
            if let Ok(n) = v.parse() {
                settings.rate_interval_ms = n;
            }
        }
        Ok(settings)
    }
}

