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

//! Shell resolution and environment-pair parsing.

use std::path::{Path, PathBuf};

/// Returns the shell to run commands under.
///
/// On Windows this is always `cmd`. Elsewhere the user's `SHELL` is
/// preferred when it points at an existing file, then `bash`, `zsh`, and
/// `sh` are probed on `PATH`, then a short list of well-known absolute
/// paths. The final fallback is a bare `sh`.
pub fn resolve_shell() -> String {
    if cfg!(windows) {
        return "cmd".to_string();
    }

    if let Ok(env_shell) = std::env::var("SHELL") {
        if !env_shell.is_empty() && Path::new(&env_shell).exists() {
            return env_shell;
        }
    }

    for candidate in ["bash", "zsh", "sh"] {
        if let Some(found) = find_in_path(candidate) {
            return found.to_string_lossy().into_owned();
        }
    }

    for fallback in ["/bin/bash", "/usr/bin/bash", "/bin/sh"] {
        if Path::new(fallback).exists() {
            return fallback.to_string();
        }
    }

    "sh".to_string()
}

/// Returns the program and argument vector that runs `command` in a shell.
pub fn shell_command(command: &str) -> (String, Vec<String>) {
    let shell = resolve_shell();
    if cfg!(windows) {
        (shell, vec!["/c".to_string(), command.to_string()])
    } else {
        (shell, vec!["-c".to_string(), command.to_string()])
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Parses an environment string of the form `KEY1=VALUE1,KEY2=VALUE2`.
///
/// Values containing literal commas or equals signs are stored with the
/// placeholders `{{COMMA}}` and `{{EQUAL}}`, decoded here.
pub fn parse_env_pairs(env_str: &str) -> Vec<String> {
    if env_str.is_empty() {
        return Vec::new();
    }

    env_str
        .split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.replace("{{COMMA}}", ",").replace("{{EQUAL}}", "="))
        .collect()
}

/// Splits a `KEY=VALUE` pair; pairs without `=` map to an empty value.
pub fn split_env_pair(pair: &str) -> (String, String) {
    match pair.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (pair.to_string(), String::new()),
    }
}
