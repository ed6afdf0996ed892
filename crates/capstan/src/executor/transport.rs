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

//! Child-process transports.
//!
//! `start_child` is the single place that knows how to attach a child to a
//! pseudo-terminal or to pipes; downstream code only ever sees a reader.
//! PTY allocation failure is not an error — the child silently runs in
//! pipe mode instead.

use std::process::Stdio;

use tracing::warn;

use crate::error::CapstanError;

/// A started child process plus the means to read its output.
pub enum ChildTransport {
    /// POSIX pseudo-terminal; the child's stdout and stderr are the same
    /// terminal device and arrive through one reader.
    #[cfg(unix)]
    Pty {
        child: Box<dyn portable_pty::Child + Send + Sync>,
        /// Kept open while the reader drains; dropped after the child
        /// exits so the reader sees EOF.
        master: Box<dyn portable_pty::MasterPty + Send>,
        reader: Box<dyn std::io::Read + Send>,
    },
    /// stdout and stderr share a single OS pipe, preserving interleaving.
    Merged {
        child: tokio::process::Child,
        reader: std::io::PipeReader,
    },
    /// stdout and stderr each get their own pipe.
    Split { child: tokio::process::Child },
}

/// Fully-resolved spawn parameters.
pub struct SpawnSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub work_dir: &'a str,
    /// Final environment pairs appended to the inherited environment.
    pub envs: &'a [(String, String)],
    pub log_id: u64,
}

/// Starts the child, preferring a PTY when asked for merged output.
pub fn start_child(
    spec: &SpawnSpec<'_>,
    merged: bool,
    prefer_pty: bool,
) -> Result<ChildTransport, CapstanError> {
    #[cfg(unix)]
    if prefer_pty {
        match start_pty(spec) {
            Ok(transport) => return Ok(transport),
            Err(err) => {
                warn!(
                    log_id = spec.log_id,
                    error = %err,
                    "PTY allocation failed, falling back to pipe mode"
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = prefer_pty;

    if merged {
        start_merged_pipe(spec)
    } else {
        start_split_pipe(spec)
    }
}

#[cfg(unix)]
fn start_pty(spec: &SpawnSpec<'_>) -> Result<ChildTransport, CapstanError> {
    use portable_pty::{native_pty_system, CommandBuilder, PtySize};

    let pty = native_pty_system();
    let pair = pty
        .openpty(PtySize {
            rows: 24,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| CapstanError::Execution(format!("openpty: {e}")))?;

    let mut cmd = CommandBuilder::new(spec.program);
    for arg in spec.args {
        cmd.arg(arg);
    }
    if !spec.work_dir.is_empty() {
        cmd.cwd(spec.work_dir);
    }
    for (key, value) in spec.envs {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| CapstanError::SpawnFailed(e.to_string()))?;
    // Close our copy of the slave end so the master reader sees EOF when
    // the child exits.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| CapstanError::Execution(format!("pty reader: {e}")))?;

    Ok(ChildTransport::Pty {
        child,
        master: pair.master,
        reader,
    })
}

fn start_merged_pipe(spec: &SpawnSpec<'_>) -> Result<ChildTransport, CapstanError> {
    let (reader, writer) = std::io::pipe()?;
    let writer_clone = writer.try_clone()?;

    let mut cmd = base_command(spec);
    cmd.stdout(Stdio::from(writer_clone));
    cmd.stderr(Stdio::from(writer));

    let child = cmd
        .spawn()
        .map_err(|e| CapstanError::SpawnFailed(e.to_string()))?;

    Ok(ChildTransport::Merged { child, reader })
}

fn start_split_pipe(spec: &SpawnSpec<'_>) -> Result<ChildTransport, CapstanError> {
    let mut cmd = base_command(spec);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let child = cmd
        .spawn()
        .map_err(|e| CapstanError::SpawnFailed(e.to_string()))?;

    Ok(ChildTransport::Split { child })
}

fn base_command(spec: &SpawnSpec<'_>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(spec.program);
    cmd.args(spec.args);
    if !spec.work_dir.is_empty() {
        cmd.current_dir(spec.work_dir);
    }
    for (key, value) in spec.envs {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}
