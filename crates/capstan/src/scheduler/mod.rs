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

//! Worker pool scheduler.
//!
//! Requests flow through a bounded queue into N identical workers; a
//! shared rate tick smooths bursts. The scheduler itself only manages
//! queueing, cancellation, and the run lifecycle — everything stateful
//! (log rows, concurrency policy, remote dispatch) happens behind the
//! [`SchedulerEventHandler`] capability and the injected executor, so the
//! same scheduler serves both the control node and the agent.
//!
//! Per request the state machine is
//! `queued → running → (success | failed | timeout | cancelled)`, and
//! exactly one of `on_task_completed` / `on_task_failed` fires per request
//! that reaches a worker.

mod handler;
mod types;

pub use handler::SchedulerEventHandler;
pub use types::{ExecutionRequest, ExecutionResult, RunStatus, RunType};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::CapstanError;
use crate::executor::{self, CommandResult, ExecuteHooks, ExecutorArgs};
use crate::sink::{BufferSink, SharedSink, TeeSink};

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub rate_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 100,
            rate_interval: Duration::from_millis(200),
        }
    }
}

impl SchedulerConfig {
    fn sanitized(mut self) -> Self {
        if self.worker_count == 0 {
            self.worker_count = 4;
        }
        if self.queue_size == 0 {
            self.queue_size = 100;
        }
        if self.rate_interval.is_zero() {
            self.rate_interval = Duration::from_millis(200);
        }
        self
    }
}

/// Signature of the injected execution function.
///
/// The default is [`executor::execute`]; the coordinator swaps in a
/// dispatcher that routes repo rewrites and agent-bound runs.
pub type DynExecutor = Arc<
    dyn Fn(ExecutorArgs) -> BoxFuture<'static, Result<CommandResult, CapstanError>> + Send + Sync,
>;

struct RunningTable {
    by_task: HashMap<String, CancellationToken>,
    by_log: HashMap<u64, CancellationToken>,
    /// How many requests per task id are sitting in the queue.
    queued: HashMap<String, usize>,
    /// Task ids whose next dequeued request is discarded instead of run.
    pending_cancel: HashSet<String>,
}

struct Core {
    config: SchedulerConfig,
    queue_tx: Option<mpsc::Sender<ExecutionRequest>>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

struct SchedulerInner {
    /// Identifies this scheduler instance in logs.
    instance_id: Uuid,
    handler: Arc<dyn SchedulerEventHandler>,
    executor: RwLock<DynExecutor>,
    core: Mutex<Core>,
    running: StdMutex<RunningTable>,
}

/// The worker pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, handler: Arc<dyn SchedulerEventHandler>) -> Self {
        let default_executor: DynExecutor = Arc::new(|args| executor::execute(args).boxed());
        Self {
            inner: Arc::new(SchedulerInner {
                instance_id: Uuid::new_v4(),
                handler,
                executor: RwLock::new(default_executor),
                core: Mutex::new(Core {
                    config: config.sanitized(),
                    queue_tx: None,
                    stop: CancellationToken::new(),
                    tracker: TaskTracker::new(),
                }),
                running: StdMutex::new(RunningTable {
                    by_task: HashMap::new(),
                    by_log: HashMap::new(),
                    queued: HashMap::new(),
                    pending_cancel: HashSet::new(),
                }),
            }),
        }
    }

    /// Replaces the execution function. Call before [`start`](Self::start).
    pub fn set_executor(&self, executor: DynExecutor) {
        *self
            .inner
            .executor
            .write()
            .expect("executor slot poisoned") = executor;
    }

    /// Spawns the workers.
    pub async fn start(&self) {
        let mut core = self.inner.core.lock().await;
        if core.queue_tx.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<ExecutionRequest>(core.config.queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let limiter = Arc::new(Mutex::new(tokio::time::interval(core.config.rate_interval)));
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();

        for worker_id in 0..core.config.worker_count {
            let inner = self.inner.clone();
            let rx = rx.clone();
            let limiter = limiter.clone();
            let stop = stop.clone();
            tracker.spawn(async move {
                worker_loop(inner, worker_id, rx, limiter, stop).await;
            });
        }

        core.queue_tx = Some(tx);
        core.stop = stop;
        core.tracker = tracker;
        info!(
            instance_id = %self.inner.instance_id,
            workers = core.config.worker_count,
            queue = core.config.queue_size,
            rate_ms = core.config.rate_interval.as_millis() as u64,
            "scheduler started"
        );
    }

    /// Stops the workers, waiting for in-flight runs to finish.
    pub async fn stop(&self) {
        let (stop, tracker) = {
            let mut core = self.inner.core.lock().await;
            core.queue_tx = None;
            (core.stop.clone(), core.tracker.clone())
        };
        stop.cancel();
        tracker.close();
        tracker.wait().await;
        info!("scheduler stopped");
    }

    /// Swaps config, dropping whatever sat in the queue, and restarts.
    pub async fn reload(&self, config: SchedulerConfig) {
        info!("reloading scheduler configuration");
        self.stop().await;
        {
            let mut core = self.inner.core.lock().await;
            core.config = config.sanitized();
        }
        self.start().await;
    }

    pub async fn config(&self) -> SchedulerConfig {
        self.inner.core.lock().await.config
    }

    /// Non-blocking enqueue; fails when the queue is at capacity.
    pub async fn enqueue(&self, req: ExecutionRequest) -> Result<(), CapstanError> {
        let tx = {
            let core = self.inner.core.lock().await;
            core.queue_tx
                .clone()
                .ok_or(CapstanError::SchedulerStopped)?
        };

        let preview = req.clone();
        match tx.try_send(req) {
            Ok(()) => {
                self.note_queued(&preview.task_id);
                self.inner.handler.on_task_scheduled(&preview).await;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!(task_id = %req.task_id, "task queue is full");
                Err(CapstanError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CapstanError::SchedulerStopped),
        }
    }

    /// Enqueues, or — when the queue is full — degrades to an immediate
    /// spawned run so cron fires are never lost.
    pub async fn enqueue_or_execute(&self, req: ExecutionRequest) {
        let tx = {
            let core = self.inner.core.lock().await;
            match core.queue_tx.clone() {
                Some(tx) => tx,
                None => {
                    warn!(task_id = %req.task_id, "scheduler stopped, dropping request");
                    return;
                }
            }
        };

        let preview = req.clone();
        match tx.try_send(req) {
            Ok(()) => {
                self.note_queued(&preview.task_id);
                self.inner.handler.on_task_scheduled(&preview).await;
            }
            Err(mpsc::error::TrySendError::Full(req))
            | Err(mpsc::error::TrySendError::Closed(req)) => {
                warn!(
                    task_id = %req.task_id,
                    "task queue is full, executing immediately"
                );
                let scheduler = self.clone();
                let tracker = { self.inner.core.lock().await.tracker.clone() };
                tracker.spawn(async move {
                    let _ = scheduler.run_guarded(req).await;
                });
            }
        }
    }

    /// Runs a request immediately, bypassing queue and rate limiter.
    pub async fn execute_sync(
        &self,
        req: ExecutionRequest,
    ) -> Result<ExecutionResult, CapstanError> {
        self.execute_task(req).await
    }

    /// Cancels the run with this task id. A running task's context is
    /// cancelled; a queued-but-unstarted request is discarded when it
    /// reaches a worker, with no lifecycle events. Returns whether a run
    /// was found either way.
    pub fn stop_task(&self, task_id: &str) -> bool {
        let mut table = self.inner.running.lock().expect("running table poisoned");
        if let Some(token) = table.by_task.get(task_id) {
            token.cancel();
            info!(task_id, "stop requested for running task");
            return true;
        }
        if table.queued.get(task_id).copied().unwrap_or(0) > 0 {
            table.pending_cancel.insert(task_id.to_string());
            info!(task_id, "queued request marked for discard");
            return true;
        }
        false
    }

    /// Cancels the running task with this log id. Returns whether one was
    /// found.
    pub fn stop_log(&self, log_id: u64) -> bool {
        let table = self.inner.running.lock().expect("running table poisoned");
        match table.by_log.get(&log_id) {
            Some(token) => {
                token.cancel();
                info!(log_id, "stop requested for running task");
                true
            }
            None => false,
        }
    }

    /// Number of requests currently executing.
    pub fn running_count(&self) -> usize {
        self.inner
            .running
            .lock()
            .expect("running table poisoned")
            .by_task
            .len()
    }

    /// Task ids currently executing.
    pub fn running_task_ids(&self) -> Vec<String> {
        self.inner
            .running
            .lock()
            .expect("running table poisoned")
            .by_task
            .keys()
            .cloned()
            .collect()
    }

    async fn run_guarded(&self, req: ExecutionRequest) -> Option<ExecutionResult> {
        let task_id = req.task_id.clone();
        let fut = std::panic::AssertUnwindSafe(self.execute_task(req));
        match fut.catch_unwind().await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => None,
            Err(_) => {
                error!(task_id = %task_id, "panic while executing task");
                None
            }
        }
    }

    /// Drives one request through its full lifecycle.
    async fn execute_task(
        &self,
        mut req: ExecutionRequest,
    ) -> Result<ExecutionResult, CapstanError> {
        let handler = self.inner.handler.clone();

        info!(
            task_id = %req.task_id,
            name = %req.name,
            run_type = ?req.run_type,
            "executing task"
        );

        // 1. Pre-execution: the handler opens the log row and hands back
        //    the live output writers (None when it wants no log).
        let sinks = match handler.on_task_executing(&mut req).await {
            Ok(sinks) => sinks,
            Err(err) => {
                warn!(task_id = %req.task_id, error = %err, "pre-execution hook rejected task");
                handler.on_task_failed(&req, &err).await;
                return Err(err);
            }
        };

        // 2. Combined capture buffer. When the handler returned one sink
        //    for both streams, a single tee preserves the merged identity
        //    so the executor can pick PTY mode.
        let capture = Arc::new(BufferSink::new());
        let (stdout, stderr): (SharedSink, SharedSink) = match sinks {
            Some((out, err)) if Arc::ptr_eq(&out, &err) => {
                let tee: SharedSink = Arc::new(TeeSink::new(capture.clone(), Some(out)));
                (tee.clone(), tee)
            }
            Some((out, err)) => (
                Arc::new(TeeSink::new(capture.clone(), Some(out))),
                Arc::new(TeeSink::new(capture.clone(), Some(err))),
            ),
            None => {
                let tee: SharedSink = Arc::new(TeeSink::new(capture.clone(), None));
                (tee.clone(), tee)
            }
        };

        // 3. Past the queue and the rate limiter.
        handler.on_task_started(&req).await;

        // 4. Cancellation handle, registered under both keys.
        let cancel = CancellationToken::new();
        self.register_run(&req, cancel.clone());

        let hooks: Arc<dyn ExecuteHooks> = Arc::new(HandlerHooks {
            handler: handler.clone(),
            req: req.clone(),
        });

        let exec = self
            .inner
            .executor
            .read()
            .expect("executor slot poisoned")
            .clone();

        let exec_result = exec(ExecutorArgs {
            request: req.clone(),
            stdout,
            stderr,
            cancel: cancel.clone(),
            hooks: Some(hooks),
        })
        .await;

        self.deregister_run(&req);

        // 5. Assemble the terminal result.
        match exec_result {
            Ok(cmd) => {
                let result = ExecutionResult {
                    task_id: req.task_id.clone(),
                    log_id: req.log_id,
                    success: cmd.status == RunStatus::Success,
                    output: capture.contents_string(),
                    error: cmd.error.clone().unwrap_or_default(),
                    status: cmd.status,
                    duration_ms: cmd.duration_ms,
                    exit_code: cmd.exit_code,
                    start_time: cmd.start_time,
                    end_time: cmd.end_time,
                };
                handler.on_task_completed(&req, &result).await;
                info!(
                    task_id = %req.task_id,
                    status = ?result.status,
                    duration_ms = result.duration_ms,
                    "task finished"
                );
                Ok(result)
            }
            Err(err) => {
                // No result at all: the child never ran.
                handler.on_task_failed(&req, &err).await;
                error!(task_id = %req.task_id, error = %err, "task failed to execute");
                Err(err)
            }
        }
    }

    fn note_queued(&self, task_id: &str) {
        if task_id.is_empty() {
            return;
        }
        let mut table = self.inner.running.lock().expect("running table poisoned");
        *table.queued.entry(task_id.to_string()).or_insert(0) += 1;
    }

    /// Called by a worker when it takes a request off the queue. Returns
    /// `true` when the request was cancelled while queued and must be
    /// discarded.
    fn note_dequeued(&self, task_id: &str) -> bool {
        if task_id.is_empty() {
            return false;
        }
        let mut table = self.inner.running.lock().expect("running table poisoned");
        if let Some(count) = table.queued.get_mut(task_id) {
            *count -= 1;
            if *count == 0 {
                table.queued.remove(task_id);
            }
        }
        table.pending_cancel.remove(task_id)
    }

    fn register_run(&self, req: &ExecutionRequest, token: CancellationToken) {
        let mut table = self.inner.running.lock().expect("running table poisoned");
        if !req.task_id.is_empty() {
            table.by_task.insert(req.task_id.clone(), token.clone());
        }
        if req.log_id > 0 {
            table.by_log.insert(req.log_id, token);
        }
    }

    fn deregister_run(&self, req: &ExecutionRequest) {
        let mut table = self.inner.running.lock().expect("running table poisoned");
        if !req.task_id.is_empty() {
            table.by_task.remove(&req.task_id);
        }
        if req.log_id > 0 {
            table.by_log.remove(&req.log_id);
        }
    }
}

async fn worker_loop(
    inner: Arc<SchedulerInner>,
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<ExecutionRequest>>>,
    limiter: Arc<Mutex<tokio::time::Interval>>,
    stop: CancellationToken,
) {
    tracing::debug!(worker_id, "worker started");
    loop {
        let req = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = stop.cancelled() => return,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            }
        };

        let scheduler = Scheduler {
            inner: inner.clone(),
        };

        // A request cancelled while still queued is dropped silently: no
        // lifecycle events, no rate ticket, no side effects.
        if scheduler.note_dequeued(&req.task_id) {
            info!(task_id = %req.task_id, "discarding request cancelled while queued");
            continue;
        }

        // Rate limit: one dispatch per shared tick.
        {
            let mut limiter = limiter.lock().await;
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = limiter.tick() => {}
            }
        }

        // Failures and panics are logged inside; the worker never dies.
        let _ = scheduler.run_guarded(req).await;
    }
}

/// Adapts the executor heartbeat to the scheduler handler.
struct HandlerHooks {
    handler: Arc<dyn SchedulerEventHandler>,
    req: ExecutionRequest,
}

#[async_trait::async_trait]
impl ExecuteHooks for HandlerHooks {
    async fn on_heartbeat(&self, _log_id: u64, elapsed_ms: i64) {
        self.handler.on_task_heartbeat(&self.req, elapsed_ms).await;
    }
}
