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

//! Cron dispatcher.
//!
//! Expressions carry six fields — second minute hour day-of-month month
//! day-of-week — and are evaluated in a fixed +08:00 zone. Five-field
//! expressions are rejected. Each task id owns at most one entry;
//! re-adding replaces the old one.
//!
//! On each fire the dispatcher hands an [`ExecutionRequest`] to the
//! scheduler's `enqueue_or_execute` and reports the freshly computed next
//! fire time through `on_cron_next_run`. Firing itself never does heavy
//! work; everything expensive happens in the worker pool.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CapstanError;
use crate::executor::shell::parse_env_pairs;
use crate::scheduler::{ExecutionRequest, RunType, Scheduler, SchedulerEventHandler};

/// Everything the dispatcher needs to know about one scheduled task.
#[derive(Debug, Clone)]
pub struct CronJobSpec {
    pub task_id: String,
    pub name: String,
    pub command: String,
    /// Six-field cron expression.
    pub schedule: String,
    pub timeout_minutes: f64,
    pub work_dir: String,
    /// `KEY=VALUE,KEY2=V2` string, split at fire time.
    pub envs: String,
}

struct CronEntry {
    schedule: cron::Schedule,
    next: DateTime<FixedOffset>,
    spec: CronJobSpec,
}

struct CronInner {
    entries: StdMutex<HashMap<String, CronEntry>>,
    scheduler: Scheduler,
    handler: Arc<dyn SchedulerEventHandler>,
    wake: Notify,
    stop: CancellationToken,
}

/// The dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct CronDispatcher {
    inner: Arc<CronInner>,
}

/// The fixed evaluation zone (+08:00).
pub fn cron_zone() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("+08:00 is a valid offset")
}

fn now_in_zone() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&cron_zone())
}

/// Validates a cron expression without touching dispatcher state.
pub fn validate_cron(expression: &str) -> Result<(), CapstanError> {
    cron::Schedule::from_str(expression)
        .map(|_| ())
        .map_err(|e| CapstanError::InvalidCron(e.to_string()))
}

impl CronDispatcher {
    pub fn new(scheduler: Scheduler, handler: Arc<dyn SchedulerEventHandler>) -> Self {
        Self {
            inner: Arc::new(CronInner {
                entries: StdMutex::new(HashMap::new()),
                scheduler,
                handler,
                wake: Notify::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Starts the tick loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_loop(inner).await;
        });
        info!("cron dispatcher started");
    }

    /// Stops the tick loop. Entries are kept; `start` may not be called
    /// again on the same dispatcher.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        info!("cron dispatcher stopped");
    }

    /// Adds or replaces the entry for `spec.task_id`.
    pub async fn add_task(&self, spec: CronJobSpec) -> Result<(), CapstanError> {
        let schedule = cron::Schedule::from_str(&spec.schedule)
            .map_err(|e| CapstanError::InvalidCron(e.to_string()))?;

        let next = schedule
            .after(&now_in_zone())
            .next()
            .ok_or_else(|| CapstanError::InvalidCron("expression never fires".to_string()))?;

        let task_id = spec.task_id.clone();
        let name = spec.name.clone();
        {
            let mut entries = self.inner.entries.lock().expect("cron entries poisoned");
            entries.insert(
                task_id.clone(),
                CronEntry {
                    schedule,
                    next,
                    spec,
                },
            );
        }
        self.inner.wake.notify_one();

        info!(task_id = %task_id, name = %name, next = %next, "cron entry scheduled");

        // Tell the persistence layer about the initial next-run time.
        let req = ExecutionRequest {
            task_id: task_id.clone(),
            log_id: 0,
            name,
            run_type: RunType::Cron,
            command: String::new(),
            work_dir: String::new(),
            envs: Vec::new(),
            timeout_minutes: 0.0,
            metadata: Default::default(),
        };
        self.inner.handler.on_cron_next_run(&req, next).await;

        Ok(())
    }

    /// Removes the entry for a task id, if present.
    pub fn remove_task(&self, task_id: &str) {
        let removed = self
            .inner
            .entries
            .lock()
            .expect("cron entries poisoned")
            .remove(task_id)
            .is_some();
        if removed {
            self.inner.wake.notify_one();
            info!(task_id, "cron entry removed");
        }
    }

    /// Next fire time for a task id, if scheduled.
    pub fn next_run(&self, task_id: &str) -> Option<DateTime<FixedOffset>> {
        self.inner
            .entries
            .lock()
            .expect("cron entries poisoned")
            .get(task_id)
            .map(|e| e.next)
    }

    /// Number of scheduled entries.
    pub fn scheduled_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .expect("cron entries poisoned")
            .len()
    }
}

async fn run_loop(inner: Arc<CronInner>) {
    loop {
        if inner.stop.is_cancelled() {
            return;
        }

        // Collect everything due and the earliest future fire time. Map
        // mutations happen under the lock; dispatching happens after.
        let mut due: Vec<(ExecutionRequest, DateTime<FixedOffset>)> = Vec::new();
        let mut earliest: Option<DateTime<FixedOffset>> = None;
        {
            let now = now_in_zone();
            let mut entries = inner.entries.lock().expect("cron entries poisoned");
            let mut exhausted: Vec<String> = Vec::new();

            for (task_id, entry) in entries.iter_mut() {
                if entry.next <= now {
                    match entry.schedule.after(&now).next() {
                        Some(next) => {
                            debug!(task_id = %task_id, "cron entry fired");
                            due.push((fire_request(&entry.spec), next));
                            entry.next = next;
                        }
                        None => {
                            warn!(task_id = %task_id, "cron entry has no future fire time");
                            exhausted.push(task_id.clone());
                            continue;
                        }
                    }
                }
                earliest = match earliest {
                    Some(e) if e <= entry.next => Some(e),
                    _ => Some(entry.next),
                };
            }

            for task_id in exhausted {
                entries.remove(&task_id);
            }
        }

        for (req, next) in due {
            info!(task_id = %req.task_id, name = %req.name, "cron fire");
            inner.scheduler.enqueue_or_execute(req.clone()).await;
            inner.handler.on_cron_next_run(&req, next).await;
        }

        let sleep_for = match earliest {
            Some(at) => {
                let now = now_in_zone();
                (at - now).to_std().unwrap_or(Duration::ZERO)
            }
            // Nothing scheduled: park until woken.
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = inner.stop.cancelled() => return,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

fn fire_request(spec: &CronJobSpec) -> ExecutionRequest {
    ExecutionRequest {
        task_id: spec.task_id.clone(),
        log_id: 0,
        name: spec.name.clone(),
        run_type: RunType::Cron,
        command: spec.command.clone(),
        work_dir: spec.work_dir.clone(),
        envs: parse_env_pairs(&spec.envs),
        timeout_minutes: spec.timeout_minutes,
        metadata: Default::default(),
    }
}
