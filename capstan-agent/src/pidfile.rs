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

//! Pid-file bookkeeping for `start` / `stop` / `status`.
//!
//! The pid file lives next to the configuration file.

use std::path::{Path, PathBuf};

use anyhow::Result;

fn pid_path(config_path: &Path) -> PathBuf {
    let dir = config_path.parent().unwrap_or(Path::new("."));
    dir.join("agent.pid")
}

pub fn write(config_path: &Path) -> Result<()> {
    std::fs::write(pid_path(config_path), std::process::id().to_string())?;
    Ok(())
}

pub fn remove(config_path: &Path) {
    let _ = std::fs::remove_file(pid_path(config_path));
}

fn read(config_path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(pid_path(config_path)).ok()?;
    contents.trim().parse().ok()
}

#[cfg(unix)]
fn is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn is_alive(_pid: i32) -> bool {
    // No cheap liveness probe; trust the pid file.
    true
}

pub fn stop(config_path: &Path) -> Result<()> {
    let Some(pid) = read(config_path) else {
        println!("agent is not running");
        return Ok(());
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            println!("failed to stop pid {pid}: {err}");
            remove(config_path);
            return Ok(());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status();
    }

    println!("agent stopped (pid {pid})");
    remove(config_path);
    Ok(())
}

pub fn status(config_path: &Path) {
    match read(config_path) {
        Some(pid) if is_alive(pid) => println!("status: running (pid {pid})"),
        Some(_) => {
            println!("status: not running");
            remove(config_path);
        }
        None => println!("status: not running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.ini");

        write(&config).unwrap();
        assert_eq!(read(&config), Some(std::process::id() as i32));

        remove(&config);
        assert_eq!(read(&config), None);
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(is_alive(std::process::id() as i32));
        // A pid far beyond pid_max is never alive.
        assert!(!is_alive(999_999_999));
    }
}
