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

//! In-memory repository.
//!
//! All state sits behind one async mutex, which trivially gives every
//! operation the row-level atomicity the contract requires.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::error::CapstanError;
use crate::models::{Agent, AgentStatus, KeepPolicy, NewAgent, NewTaskLog, Task, TaskLog};
use crate::scheduler::RunStatus;

use super::{Repository, TaskFilter};

#[derive(Default)]
struct State {
    tasks: HashMap<u64, Task>,
    logs: BTreeMap<u64, TaskLog>,
    agents: HashMap<u64, Agent>,
    registration_tokens: HashSet<String>,
    envs: HashMap<u64, (String, String)>,
    settings: HashMap<(String, String), String>,
    next_task_id: u64,
    next_log_id: u64,
    next_agent_id: u64,
    next_env_id: u64,
}

/// A [`Repository`] held entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task, assigning an id when the given one is zero.
    pub async fn insert_task(&self, mut task: Task) -> Task {
        let mut state = self.state.lock().await;
        if task.id == 0 {
            state.next_task_id += 1;
            task.id = state.next_task_id;
        } else {
            state.next_task_id = state.next_task_id.max(task.id);
        }
        state.tasks.insert(task.id, task.clone());
        task
    }

    pub async fn insert_agent(&self, mut agent: Agent) -> Agent {
        let mut state = self.state.lock().await;
        if agent.id == 0 {
            state.next_agent_id += 1;
            agent.id = state.next_agent_id;
        } else {
            state.next_agent_id = state.next_agent_id.max(agent.id);
        }
        state.agents.insert(agent.id, agent.clone());
        agent
    }

    pub async fn insert_env(&self, name: &str, value: &str) -> u64 {
        let mut state = self.state.lock().await;
        state.next_env_id += 1;
        let id = state.next_env_id;
        state.envs.insert(id, (name.to_string(), value.to_string()));
        id
    }

    pub async fn add_registration_token(&self, token: &str) {
        let mut state = self.state.lock().await;
        state.registration_tokens.insert(token.to_string());
    }

    pub async fn set_setting(&self, section: &str, key: &str, value: &str) {
        let mut state = self.state.lock().await;
        state
            .settings
            .insert((section.to_string(), key.to_string()), value.to_string());
    }

    /// All log rows for a task, oldest first. Test helper.
    pub async fn logs_for_task(&self, task_id: u64) -> Vec<TaskLog> {
        let state = self.state.lock().await;
        state
            .logs
            .values()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_task(&self, id: u64) -> Result<Option<Task>, CapstanError> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, CapstanError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| !filter.enabled_only || t.enabled)
            .filter(|t| match filter.agent_id {
                Some(agent_id) => t.agent_id == Some(agent_id),
                None => true,
            })
            .filter(|t| !filter.local_only || !t.is_agent_bound())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn update_task_meta(
        &self,
        id: u64,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CapstanError::TaskNotFound(id.to_string()))?;
        if last_run.is_some() {
            task.last_run = last_run;
        }
        if next_run.is_some() {
            task.next_run = next_run;
        }
        Ok(())
    }

    async fn acquire_run_slot(&self, id: u64, token: i64) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CapstanError::TaskNotFound(id.to_string()))?;
        if task.is_exclusive() && !task.running_tokens.is_empty() {
            return Err(CapstanError::AlreadyRunning);
        }
        task.running_tokens.push(token);
        Ok(())
    }

    async fn release_run_slot(&self, id: u64, token: i64) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&id) {
            task.running_tokens.retain(|t| *t != token);
        }
        Ok(())
    }

    async fn clear_run_slots(&self) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        for task in state.tasks.values_mut() {
            task.running_tokens.clear();
        }
        Ok(())
    }

    async fn create_task_log(&self, log: NewTaskLog) -> Result<TaskLog, CapstanError> {
        let mut state = self.state.lock().await;
        state.next_log_id += 1;
        let id = state.next_log_id;
        let row = TaskLog {
            id,
            task_id: log.task_id,
            agent_id: log.agent_id,
            command: log.command,
            status: RunStatus::Running,
            duration_ms: 0,
            exit_code: 0,
            start_time: Some(Utc::now()),
            end_time: None,
            output: String::new(),
            error: String::new(),
            created_at: Utc::now(),
        };
        state.logs.insert(id, row.clone());
        Ok(row)
    }

    async fn save_task_log(&self, log: &TaskLog) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        let mut log = log.clone();
        if log.id == 0 {
            state.next_log_id += 1;
            log.id = state.next_log_id;
        } else {
            state.next_log_id = state.next_log_id.max(log.id);
        }
        state.logs.insert(log.id, log);
        Ok(())
    }

    async fn get_task_log(&self, id: u64) -> Result<Option<TaskLog>, CapstanError> {
        Ok(self.state.lock().await.logs.get(&id).cloned())
    }

    async fn update_log_duration(&self, id: u64, duration_ms: i64) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        if let Some(log) = state.logs.get_mut(&id) {
            log.duration_ms = duration_ms;
        }
        Ok(())
    }

    async fn delete_old_logs(
        &self,
        task_id: u64,
        policy: KeepPolicy,
    ) -> Result<u64, CapstanError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<u64> = match policy {
            KeepPolicy::Count(keep) => {
                let mut ids: Vec<u64> = state
                    .logs
                    .values()
                    .filter(|l| l.task_id == task_id)
                    .map(|l| l.id)
                    .collect();
                ids.sort_unstable();
                let keep = keep as usize;
                if ids.len() > keep {
                    ids[..ids.len() - keep].to_vec()
                } else {
                    Vec::new()
                }
            }
            KeepPolicy::Days(days) => {
                let cutoff = Utc::now() - ChronoDuration::days(days as i64);
                state
                    .logs
                    .values()
                    .filter(|l| l.task_id == task_id && l.created_at < cutoff)
                    .map(|l| l.id)
                    .collect()
            }
        };
        for id in &doomed {
            state.logs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn get_agent(&self, id: u64) -> Result<Option<Agent>, CapstanError> {
        Ok(self.state.lock().await.agents.get(&id).cloned())
    }

    async fn find_agent_by_token(&self, token: &str) -> Result<Option<Agent>, CapstanError> {
        let state = self.state.lock().await;
        Ok(state.agents.values().find(|a| a.token == token).cloned())
    }

    async fn take_registration_token(&self, token: &str) -> Result<bool, CapstanError> {
        let mut state = self.state.lock().await;
        Ok(state.registration_tokens.remove(token))
    }

    async fn register_agent(&self, agent: NewAgent) -> Result<Agent, CapstanError> {
        let mut state = self.state.lock().await;
        state.next_agent_id += 1;
        let id = state.next_agent_id;
        let row = Agent {
            id,
            name: agent.name,
            token: agent.token,
            machine_id: agent.machine_id,
            status: AgentStatus::Online,
            last_seen: Some(Utc::now()),
            hostname: String::new(),
            os: String::new(),
            arch: String::new(),
            version: String::new(),
            enabled: true,
            force_update: false,
        };
        state.agents.insert(id, row.clone());
        Ok(row)
    }

    async fn save_agent(&self, agent: &Agent) -> Result<(), CapstanError> {
        let mut state = self.state.lock().await;
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn resolve_envs(&self, ids: &[u64]) -> Result<Vec<String>, CapstanError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.envs.get(id))
            .map(|(name, value)| format!("{name}={value}"))
            .collect())
    }

    async fn get_setting(
        &self,
        section: &str,
        key: &str,
    ) -> Result<Option<String>, CapstanError> {
        let state = self.state.lock().await;
        Ok(state
            .settings
            .get(&(section.to_string(), key.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskKind, TaskRunConfig, TriggerKind};

    fn task(concurrency: u8) -> Task {
        Task {
            id: 0,
            name: "t".into(),
            command: "true".into(),
            kind: TaskKind::Task,
            trigger: TriggerKind::Cron,
            schedule: "*/5 * * * * *".into(),
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

    #[tokio::test]
    async fn exclusive_gate_rejects_second_slot() {
        let repo = MemoryRepository::new();
        let t = repo.insert_task(task(0)).await;

        repo.acquire_run_slot(t.id, 1).await.unwrap();
        assert!(matches!(
            repo.acquire_run_slot(t.id, 2).await,
            Err(CapstanError::AlreadyRunning)
        ));

        repo.release_run_slot(t.id, 1).await.unwrap();
        repo.acquire_run_slot(t.id, 2).await.unwrap();
    }

    #[tokio::test]
    async fn parallel_gate_admits_concurrent_slots() {
        let repo = MemoryRepository::new();
        let t = repo.insert_task(task(1)).await;

        repo.acquire_run_slot(t.id, 1).await.unwrap();
        repo.acquire_run_slot(t.id, 2).await.unwrap();

        let loaded = repo.get_task(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.running_tokens, vec![1, 2]);
    }

    #[tokio::test]
    async fn clear_run_slots_drops_stale_tokens() {
        let repo = MemoryRepository::new();
        let t = repo.insert_task(task(0)).await;
        repo.acquire_run_slot(t.id, 7).await.unwrap();

        repo.clear_run_slots().await.unwrap();
        let loaded = repo.get_task(t.id).await.unwrap().unwrap();
        assert!(loaded.running_tokens.is_empty());
    }

    #[tokio::test]
    async fn retention_by_count_keeps_newest() {
        let repo = MemoryRepository::new();
        let t = repo.insert_task(task(1)).await;
        for _ in 0..5 {
            repo.create_task_log(NewTaskLog::new(t.id, "c")).await.unwrap();
        }

        let deleted = repo
            .delete_old_logs(t.id, KeepPolicy::Count(2))
            .await
            .unwrap();
        assert_eq!(deleted, 3);

        let remaining = repo.logs_for_task(t.id).await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|l| l.id >= 4));
    }

    #[tokio::test]
    async fn retention_by_days_keeps_recent() {
        let repo = MemoryRepository::new();
        let t = repo.insert_task(task(1)).await;

        let old = repo.create_task_log(NewTaskLog::new(t.id, "c")).await.unwrap();
        let mut aged = old.clone();
        aged.created_at = Utc::now() - ChronoDuration::days(30);
        repo.save_task_log(&aged).await.unwrap();
        repo.create_task_log(NewTaskLog::new(t.id, "c")).await.unwrap();

        let deleted = repo
            .delete_old_logs(t.id, KeepPolicy::Days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.logs_for_task(t.id).await.len(), 1);
    }

    #[tokio::test]
    async fn registration_tokens_are_single_use() {
        let repo = MemoryRepository::new();
        repo.add_registration_token("join-me").await;

        assert!(repo.take_registration_token("join-me").await.unwrap());
        assert!(!repo.take_registration_token("join-me").await.unwrap());
        assert!(!repo.take_registration_token("never-was").await.unwrap());
    }

    #[tokio::test]
    async fn env_resolution_preserves_order_and_skips_missing() {
        let repo = MemoryRepository::new();
        let a = repo.insert_env("A", "1").await;
        let b = repo.insert_env("B", "2").await;

        let envs = repo.resolve_envs(&[b, 999, a]).await.unwrap();
        assert_eq!(envs, vec!["B=2", "A=1"]);
    }

    #[tokio::test]
    async fn scheduler_settings_apply_defaults_and_overrides() {
        let repo = MemoryRepository::new();
        let defaults = repo.scheduler_settings().await.unwrap();
        assert_eq!(defaults.worker_count, 4);
        assert_eq!(defaults.queue_size, 100);
        assert_eq!(defaults.rate_interval_ms, 200);

        repo.set_setting("scheduler", "worker_count", "8").await;
        repo.set_setting("scheduler", "rate_interval", "50").await;
        let tuned = repo.scheduler_settings().await.unwrap();
        assert_eq!(tuned.worker_count, 8);
        assert_eq!(tuned.rate_interval_ms, 50);
    }
}
