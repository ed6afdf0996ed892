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

//! Repository mirror tool.
//!
//! Invoked as a child process by repo-type tasks. Mirrors a git
//! repository (full, sparse, or single file) or downloads a plain URL
//! into the target path. Child git output is scrubbed of ANSI escapes and
//! carriage-return progress lines before reaching the task log.
//!
//! Exits 1 on missing required flags or any download/clone failure.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::cli::ReposyncArgs;

pub fn run(args: ReposyncArgs) -> Result<()> {
    if args.source_url.is_empty() || args.target_path.is_empty() {
        eprintln!("error: --source-url and --target-path are required");
        std::process::exit(1);
    }

    let outcome = if args.source_type == "git" {
        sync_git(&args)
    } else {
        sync_url(&args)
    };

    if let Err(err) = outcome {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn sync_git(args: &ReposyncArgs) -> Result<()> {
    // Raw-file URLs are really downloads, whatever the caller said.
    if is_raw_file_url(&args.source_url) {
        println!("raw file URL detected, switching to URL download mode");
        return sync_url(args);
    }

    let mut envs: Vec<(String, String)> = Vec::new();
    if !args.http_proxy.is_empty() {
        envs.push(("http_proxy".into(), args.http_proxy.clone()));
        envs.push(("https_proxy".into(), args.http_proxy.clone()));
    }

    let mut repo_url = build_proxy_url(&args.source_url, &args.proxy, &args.proxy_url);
    if !args.auth_token.is_empty() && repo_url.starts_with("https://") {
        repo_url = repo_url.replacen("https://", &format!("https://{}@", args.auth_token), 1);
    }

    if !args.path.is_empty() && args.single_file {
        return sync_git_file(args, &repo_url, &envs);
    }

    let mut dest = PathBuf::from(&args.target_path);

    // If the target exists and is a non-empty directory without a .git
    // inside, append the repository basename.
    let git_dir = dest.join(".git");
    if dest.is_dir() && !git_dir.exists() && !is_dir_empty(&dest) {
        dest = dest.join(repo_name(&args.source_url));
        println!("appending repository name to target: {}", dest.display());
    }

    if dest.join(".git").exists() {
        println!("existing repository detected, running git pull");
        if !args.branch.is_empty() {
            run_cmd(&["git", "checkout", &args.branch], Some(&dest), &envs)?;
        }
        run_cmd(&["git", "pull"], Some(&dest), &envs)?;
    } else {
        println!("running git clone");
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if dest.exists() && !is_dir_empty(&dest) {
            bail!(
                "target directory '{}' exists and is not empty; clear it or pick a new one",
                dest.display()
            );
        }

        let dest_str = dest.to_string_lossy().into_owned();
        if !args.path.is_empty() {
            let mut clone: Vec<&str> = vec!["git", "clone", "--depth", "1"];
            if !args.branch.is_empty() {
                clone.extend(["-b", &args.branch]);
            }
            clone.extend(["--filter=blob:none", "--no-checkout", &repo_url, &dest_str]);
            run_cmd(&clone, None, &envs)?;
            run_cmd(
                &["git", "sparse-checkout", "init", "--cone"],
                Some(&dest),
                &envs,
            )?;
            run_cmd(
                &["git", "sparse-checkout", "set", &args.path],
                Some(&dest),
                &envs,
            )?;
            run_cmd(&["git", "checkout"], Some(&dest), &envs)?;
        } else {
            let mut clone: Vec<&str> = vec!["git", "clone", "--depth", "1"];
            if !args.branch.is_empty() {
                clone.extend(["-b", &args.branch]);
            }
            clone.extend([repo_url.as_str(), dest_str.as_str()]);
            run_cmd(&clone, None, &envs)?;
        }
    }

    println!("sync complete");
    Ok(())
}

fn sync_url(args: &ReposyncArgs) -> Result<()> {
    let url = build_proxy_url(&args.source_url, &args.proxy, &args.proxy_url);
    let mut dest = PathBuf::from(&args.target_path);

    if dest.is_dir() || args.target_path.ends_with('/') {
        let url_path = args.source_url.split('?').next().unwrap_or_default();
        let filename = url_path.rsplit('/').next().filter(|f| !f.is_empty());
        dest = dest.join(filename.unwrap_or("downloaded_file"));
        println!("target file: {}", dest.display());
    }

    download_file(&url, &dest, &args.auth_token)
}

fn sync_git_file(args: &ReposyncArgs, repo_url: &str, envs: &[(String, String)]) -> Result<()> {
    let mut dest = PathBuf::from(&args.target_path);
    if dest.is_dir() || args.target_path.ends_with('/') {
        let filename = Path::new(&args.path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "downloaded_file".to_string());
        dest = dest.join(filename);
        println!("target path is a directory, corrected to {}", dest.display());
    }

    let branch = if args.branch.is_empty() {
        remote_default_branch(repo_url, envs)
    } else {
        args.branch.clone()
    };

    let clean_url = args.source_url.trim_end_matches(".git");
    let raw_url = if args.source_url.contains("github.com") {
        let base = clean_url.replacen("github.com", "raw.githubusercontent.com", 1);
        format!("{base}/{branch}/{}", args.path)
    } else if args.source_url.contains("gitlab.com") {
        format!("{clean_url}/-/raw/{branch}/{}", args.path)
    } else {
        format!("{clean_url}/raw/{branch}/{}", args.path)
    };

    let raw_url = build_proxy_url(&raw_url, &args.proxy, &args.proxy_url);
    download_file(&raw_url, &dest, &args.auth_token)
}

fn remote_default_branch(repo_url: &str, envs: &[(String, String)]) -> String {
    println!("detecting remote default branch: {repo_url}");
    let mut cmd = Command::new("git");
    cmd.args(["ls-remote", "--symref", repo_url, "HEAD"]);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    if let Ok(output) = cmd.output() {
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 && parts[0] == "ref:" {
                if let Some(branch) = parts[1].strip_prefix("refs/heads/") {
                    println!("default branch: {branch}");
                    return branch.to_string();
                }
            }
        }
    }

    println!("default branch not detected, falling back to 'main'");
    "main".to_string()
}

fn build_proxy_url(url: &str, proxy: &str, proxy_url: &str) -> String {
    if proxy.is_empty() || proxy == "none" {
        return url.to_string();
    }

    let base = match proxy {
        "ghproxy" => "https://gh-proxy.com/".to_string(),
        "mirror" => "https://mirror.ghproxy.com/".to_string(),
        "custom" if !proxy_url.is_empty() => format!("{}/", proxy_url.trim_end_matches('/')),
        _ => String::new(),
    };

    if !base.is_empty() && url.starts_with("http") {
        format!("{base}{url}")
    } else {
        url.to_string()
    }
}

fn download_file(url: &str, dest: &Path, auth_token: &str) -> Result<()> {
    println!("download url: {url}");
    println!("target path: {}", dest.display());

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .user_agent("Mozilla/5.0 (compatible; reposync)")
        .build()?;

    let mut request = client.get(url);
    if !auth_token.is_empty() {
        request = request.header("Authorization", format!("token {auth_token}"));
    }

    let mut response = request.send().context("download request failed")?;
    if !response.status().is_success() {
        bail!("download failed with HTTP {}", response.status().as_u16());
    }

    let mut out = std::fs::File::create(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    let written = response.copy_to(&mut out).context("writing download")?;

    println!("{written} bytes written");
    println!("download complete");
    Ok(())
}

fn is_raw_file_url(url: &str) -> bool {
    ["raw.githubusercontent.com", "/raw/", "/-/raw/", "/blob/"]
        .iter()
        .any(|p| url.contains(p))
}

fn repo_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

fn is_dir_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn run_cmd(argv: &[&str], dir: Option<&Path>, envs: &[(String, String)]) -> Result<()> {
    println!(">> {}", argv.join(" "));
    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .with_context(|| format!("running {}", argv[0]))?;

    let mut writer = CleanWriter::new(std::io::stdout());
    writer.write_all(&output.stdout)?;
    writer.write_all(&output.stderr)?;
    writer.flush_tail()?;

    if !output.status.success() {
        bail!("command failed: {}", argv.join(" "));
    }
    Ok(())
}

/// Filters child output: strips ANSI escapes and drops `\r`-terminated
/// terminal progress overwrites, keeping only settled lines.
struct CleanWriter<W: Write> {
    out: W,
    buf: Vec<u8>,
    ansi: Regex,
}

impl<W: Write> CleanWriter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            buf: Vec::new(),
            ansi: Regex::new("\x1b\\[[0-9;]*[a-zA-Z]").expect("static regex"),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);

        loop {
            let Some(idx) = self.buf.iter().position(|&b| b == b'\r' || b == b'\n') else {
                break;
            };
            // A trailing \r may be half of a \r\n split across chunks.
            if self.buf[idx] == b'\r' && idx == self.buf.len() - 1 {
                break;
            }

            let mut terminator = self.buf[idx];
            let line: Vec<u8> = self.buf.drain(..idx + 1).collect();
            let line = &line[..line.len() - 1];

            if terminator == b'\r' && self.buf.first() == Some(&b'\n') {
                self.buf.remove(0);
                terminator = b'\n';
            }

            if terminator == b'\r' {
                // Progress overwrite; drop it.
                continue;
            }

            let text = String::from_utf8_lossy(line);
            let cleaned = self.ansi.replace_all(&text, "");
            if !cleaned.is_empty() {
                writeln!(self.out, "{cleaned}")?;
            }
        }
        Ok(())
    }

    fn flush_tail(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let tail = std::mem::take(&mut self.buf);
        let mut text = String::from_utf8_lossy(&tail).into_owned();
        if text.ends_with('\r') {
            text.pop();
        }
        let cleaned = self.ansi.replace_all(&text, "");
        if !cleaned.is_empty() {
            writeln!(self.out, "{cleaned}")?;
        }
        Ok(())
    }
}
