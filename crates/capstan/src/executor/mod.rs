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

//! Command executor.
//!
//! Runs one shell command with timeout supervision and captures its merged
//! output. On POSIX, when stdout and stderr resolve to the same sink, the
//! child is attached to a pseudo-terminal so line-buffered interpreters
//! stay interactive; otherwise OS pipes are used. A heartbeat hook fires
//! every three seconds while the child runs.
//!
//! Failing to *start* the child is an error returned from [`execute`].
//! A child that starts and exits non-zero is not an error — the result
//! carries `RunStatus::Failed` and the exit code.

pub mod shell;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CapstanError;
use crate::scheduler::{ExecutionRequest, RunStatus};
use crate::sink::SharedSink;

use transport::{ChildTransport, SpawnSpec};

/// Default timeout when a request carries none.
pub const DEFAULT_TIMEOUT_MINUTES: f64 = 30.0;

/// Interval between heartbeat hook invocations.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Grace period between the termination signal and a hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment forced into every child to defeat block-buffering of
/// common interpreters.
const FORCED_ENV: [(&str, &str); 3] = [
    ("TERM", "xterm"),
    ("PYTHONUNBUFFERED", "1"),
    ("NODE_NO_WARNINGS", "1"),
];

/// Outcome of one command run.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: RunStatus,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Callbacks invoked while a command runs.
#[async_trait]
pub trait ExecuteHooks: Send + Sync {
    /// Fired every three seconds with the elapsed wall time. A panicking
    /// or slow hook never aborts the run.
    async fn on_heartbeat(&self, log_id: u64, elapsed_ms: i64);
}

/// Everything [`execute`] needs for one run.
pub struct ExecutorArgs {
    pub request: ExecutionRequest,
    pub stdout: SharedSink,
    pub stderr: SharedSink,
    pub cancel: CancellationToken,
    pub hooks: Option<Arc<dyn ExecuteHooks>>,
}

enum WaitOutcome {
    Exited(i32),
    Cancelled,
    TimedOut,
}

/// Runs one command to completion.
pub async fn execute(args: ExecutorArgs) -> Result<CommandResult, CapstanError> {
    let start_wall = Utc::now();
    let started = Instant::now();
    let request = args.request;
    let log_id = request.log_id;

    let timeout = effective_timeout(request.timeout_minutes);
    let (program, shell_args) = shell::shell_command(&request.command);

    let mut envs: Vec<(String, String)> = request
        .envs
        .iter()
        .map(|pair| shell::split_env_pair(pair))
        .collect();
    for (key, value) in FORCED_ENV {
        envs.push((key.to_string(), value.to_string()));
    }

    let merged = Arc::ptr_eq(&args.stdout, &args.stderr);
    let prefer_pty = cfg!(unix) && merged && !args.stdout.is_null();

    let spawn_spec = SpawnSpec {
        program: &program,
        args: &shell_args,
        work_dir: request.work_dir.trim(),
        envs: &envs,
        log_id,
    };

    let transport = transport::start_child(&spawn_spec, merged, prefer_pty)?;

    let heartbeat_stop = CancellationToken::new();
    let heartbeat_task = args.hooks.clone().map(|hooks| {
        tokio::spawn(heartbeat_loop(
            hooks,
            log_id,
            started,
            heartbeat_stop.child_token(),
        ))
    });

    let (exit_code, outcome) = match transport {
        #[cfg(unix)]
        ChildTransport::Pty {
            child,
            master,
            reader,
        } => {
            debug!(log_id = log_id, "child started in PTY mode");
            let copier = spawn_blocking_copier(reader, args.stdout.clone());
            let result = wait_pty(child, &args.cancel, timeout).await;
            drop(master);
            let _ = copier.await;
            result
        }
        ChildTransport::Merged { child, reader } => {
            debug!(log_id = log_id, "child started in pipe mode (merged)");
            let copier = spawn_blocking_copier(Box::new(reader), args.stdout.clone());
            let result = wait_pipe(child, &args.cancel, timeout).await;
            let _ = copier.await;
            result
        }
        ChildTransport::Split { mut child } => {
            debug!(log_id = log_id, "child started in pipe mode (split)");
            let out_copier = child
                .stdout
                .take()
                .map(|r| spawn_async_copier(r, args.stdout.clone()));
            let err_copier = child
                .stderr
                .take()
                .map(|r| spawn_async_copier(r, args.stderr.clone()));
            let result = wait_pipe(child, &args.cancel, timeout).await;
            if let Some(c) = out_copier {
                let _ = c.await;
            }
            if let Some(c) = err_copier {
                let _ = c.await;
            }
            result
        }
    };

    heartbeat_stop.cancel();
    if let Some(task) = heartbeat_task {
        let _ = task.await;
    }

    let end_wall = Utc::now();
    let duration_ms = started.elapsed().as_millis() as i64;

    let (status, error, exit_code) = match outcome {
        WaitOutcome::Exited(_) | WaitOutcome::Cancelled | WaitOutcome::TimedOut
            if exit_code == 0 =>
        {
            // A cancellation or deadline that races a clean natural exit
            // is a no-op.
            (RunStatus::Success, None, 0)
        }
        WaitOutcome::Exited(code) => (
            RunStatus::Failed,
            Some(format!("exit status {code}")),
            code,
        ),
        WaitOutcome::Cancelled => (
            RunStatus::Cancelled,
            Some("task cancelled".to_string()),
            exit_code,
        ),
        WaitOutcome::TimedOut => (
            RunStatus::Timeout,
            Some(format!(
                "deadline exceeded after {:.1} minutes",
                timeout.as_secs_f64() / 60.0
            )),
            exit_code,
        ),
    };

    if status == RunStatus::Success {
        info!(
            log_id = log_id,
            duration_ms, "command completed successfully"
        );
    } else {
        info!(
            log_id = log_id,
            status = ?status,
            exit_code,
            duration_ms,
            "command finished"
        );
    }

    Ok(CommandResult {
        status,
        error,
        duration_ms,
        exit_code,
        start_time: start_wall,
        end_time: end_wall,
    })
}

fn effective_timeout(minutes: f64) -> Duration {
    let minutes = if minutes > 0.0 {
        minutes
    } else {
        DEFAULT_TIMEOUT_MINUTES
    };
    Duration::from_secs_f64(minutes * 60.0)
}

async fn heartbeat_loop(
    hooks: Arc<dyn ExecuteHooks>,
    log_id: u64,
    started: Instant,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; swallow it so heartbeats start
    // one interval after launch.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                let elapsed_ms = started.elapsed().as_millis() as i64;
                let call = std::panic::AssertUnwindSafe(hooks.on_heartbeat(log_id, elapsed_ms));
                if call.catch_unwind().await.is_err() {
                    warn!(log_id, "heartbeat hook panicked");
                }
            }
        }
    }
}

async fn wait_pipe(
    mut child: tokio::process::Child,
    cancel: &CancellationToken,
    timeout: Duration,
) -> (i32, WaitOutcome) {
    enum First {
        Exited(i32),
        Cancelled,
        TimedOut,
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let first = tokio::select! {
        res = child.wait() => First::Exited(pipe_exit_code(res)),
        _ = cancel.cancelled() => First::Cancelled,
        _ = &mut deadline => First::TimedOut,
    };

    match first {
        First::Exited(code) => (code, WaitOutcome::Exited(code)),
        First::Cancelled => (terminate_pipe(&mut child).await, WaitOutcome::Cancelled),
        First::TimedOut => (terminate_pipe(&mut child).await, WaitOutcome::TimedOut),
    }
}

/// Sends the platform termination sequence and reaps the child: SIGTERM on
/// POSIX with a hard-kill escalation after the grace period, a straight
/// kill elsewhere.
async fn terminate_pipe(child: &mut tokio::process::Child) -> i32 {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(res) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return pipe_exit_code(res);
        }
    }

    let _ = child.start_kill();
    pipe_exit_code(child.wait().await)
}

fn pipe_exit_code(res: std::io::Result<std::process::ExitStatus>) -> i32 {
    match res {
        // Killed by signal: code() is None.
        Ok(status) => status.code().unwrap_or(1),
        Err(_) => 1,
    }
}

#[cfg(unix)]
async fn wait_pty(
    child: Box<dyn portable_pty::Child + Send + Sync>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> (i32, WaitOutcome) {
    let pid = child.process_id();
    let mut killer = child.clone_killer();
    let mut join = spawn_pty_wait(child);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        res = &mut join => {
            let code = pty_exit_code(res);
            return (code, WaitOutcome::Exited(code));
        }
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
        _ = &mut deadline => WaitOutcome::TimedOut,
    };

    if let Some(pid) = pid {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(res) = tokio::time::timeout(KILL_GRACE, &mut join).await {
            return (pty_exit_code(res), outcome);
        }
    }

    let _ = killer.kill();
    (pty_exit_code(join.await), outcome)
}

#[cfg(unix)]
fn spawn_pty_wait(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
) -> JoinHandle<std::io::Result<portable_pty::ExitStatus>> {
    tokio::task::spawn_blocking(move || child.wait())
}

#[cfg(unix)]
fn pty_exit_code(
    res: Result<std::io::Result<portable_pty::ExitStatus>, tokio::task::JoinError>,
) -> i32 {
    match res {
        Ok(Ok(status)) => status.exit_code() as i32,
        _ => 1,
    }
}

fn spawn_blocking_copier(
    mut reader: Box<dyn std::io::Read + Send>,
    sink: SharedSink,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => sink.write_chunk(&buf[..n]),
                // A PTY master reports EIO once the child side is gone.
                Err(_) => break,
            }
        }
    })
}

fn spawn_async_copier(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    sink: SharedSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => sink.write_chunk(&buf[..n]),
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BufferSink, NullSink};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn test_request(command: &str, timeout_minutes: f64) -> ExecutionRequest {
        let mut request = ExecutionRequest::system(command);
        request.timeout_minutes = timeout_minutes;
        request
    }

    fn args_for(command: &str, timeout_minutes: f64) -> (ExecutorArgs, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        let shared: SharedSink = sink.clone();
        (
            ExecutorArgs {
                request: test_request(command, timeout_minutes),
                stdout: shared.clone(),
                stderr: shared,
                cancel: CancellationToken::new(),
                hooks: None,
            },
            sink,
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_succeeds_and_captures_output() {
        let (args, sink) = args_for("echo hello", 1.0);
        let result = execute(args).await.unwrap();

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert!(result.duration_ms < 2000);
        // PTY mode may translate \n to \r\n; normalize before asserting.
        let output = sink.contents_string().replace('\r', "");
        assert!(output.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_failed_not_error() {
        let (args, _sink) = args_for("exit 3", 1.0);
        let result = execute(args).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.exit_code, 3);
        assert!(result.error.unwrap().contains("3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_produces_timeout_status() {
        // 0.02 minutes = 1.2 seconds.
        let (args, _sink) = args_for("sleep 5", 0.02);
        let result = execute(args).await.unwrap();

        assert_eq!(result.status, RunStatus::Timeout);
        assert_ne!(result.exit_code, 0);
        assert!(result.duration_ms >= 1100 && result.duration_ms < 3000);
        assert!(result.error.unwrap().contains("deadline"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_produces_cancelled_status() {
        let (args, _sink) = args_for("sleep 5", 1.0);
        let cancel = args.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let result = execute(args).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_ne!(result.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forced_env_reaches_child() {
        let (args, sink) = args_for("echo term=$TERM unbuffered=$PYTHONUNBUFFERED", 1.0);
        let result = execute(args).await.unwrap();

        assert_eq!(result.status, RunStatus::Success);
        let output = sink.contents_string();
        assert!(output.contains("term=xterm"));
        assert!(output.contains("unbuffered=1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn split_sinks_run_in_pipe_mode() {
        let out = Arc::new(BufferSink::new());
        let err = Arc::new(BufferSink::new());
        let args = ExecutorArgs {
            request: test_request("echo to-out; echo to-err >&2", 1.0),
            stdout: out.clone(),
            stderr: err.clone(),
            cancel: CancellationToken::new(),
            hooks: None,
        };

        let result = execute(args).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert!(out.contents_string().contains("to-out"));
        assert!(err.contents_string().contains("to-err"));
    }

    #[tokio::test]
    async fn spawn_failure_is_returned_as_error() {
        let sink: SharedSink = Arc::new(NullSink);
        let mut request = test_request("echo hi", 1.0);
        request.work_dir = "/definitely/not/a/real/directory".to_string();
        let args = ExecutorArgs {
            request,
            stdout: sink.clone(),
            stderr: sink,
            cancel: CancellationToken::new(),
            hooks: None,
        };

        assert!(execute(args).await.is_err());
    }

    struct CountingHooks {
        beats: AtomicI64,
    }

    #[async_trait]
    impl ExecuteHooks for CountingHooks {
        async fn on_heartbeat(&self, _log_id: u64, _elapsed_ms: i64) {
            self.beats.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn heartbeats_fire_while_child_runs() {
        let hooks = Arc::new(CountingHooks {
            beats: AtomicI64::new(0),
        });
        let sink: SharedSink = Arc::new(BufferSink::new());
        let args = ExecutorArgs {
            request: test_request("sleep 4", 1.0),
            stdout: sink.clone(),
            stderr: sink,
            cancel: CancellationToken::new(),
            hooks: Some(hooks.clone()),
        };

        let result = execute(args).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert!(hooks.beats.load(Ordering::SeqCst) >= 1);
    }
}
