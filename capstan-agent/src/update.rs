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

//! Self-update.
//!
//! Downloads the published tar.gz for this platform, extracts the agent
//! binary, atomically swaps it in place via rename (keeping a `.bak` of
//! the previous version), and restarts — `exec` on POSIX,
//! spawn-and-exit on Windows.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{error, info};

use crate::runtime::AgentShared;

const BINARY_NAME: &str = if cfg!(windows) {
    "capstan-agent.exe"
} else {
    "capstan-agent"
};

/// Runs the whole update sequence, logging (not propagating) failures —
/// a broken update must never take the running agent down.
pub async fn self_update(shared: Arc<AgentShared>) {
    if let Err(err) = try_self_update(&shared).await {
        error!(error = %err, "self-update failed");
    }
}

async fn try_self_update(shared: &Arc<AgentShared>) -> Result<()> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let exe = std::path::absolute(&exe).unwrap_or(exe);

    let url = format!(
        "{}/api/agent/download?os={}&arch={}",
        shared.config.server_url,
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    info!(url = %url, "downloading update");

    let response = shared
        .http
        .get(&url)
        .header("Authorization", format!("Bearer {}", shared.config.token))
        .timeout(Duration::from_secs(300))
        .send()
        .await
        .context("downloading update archive")?;
    if !response.status().is_success() {
        bail!("download failed with HTTP {}", response.status().as_u16());
    }
    let archive_bytes = response.bytes().await.context("reading update archive")?;

    let new_binary = extract_binary(&archive_bytes, BINARY_NAME)
        .with_context(|| format!("extracting {BINARY_NAME}"))?;

    swap_binary(&exe, &new_binary).context("replacing executable")?;

    info!("update installed, restarting");
    restart(&exe);
    Ok(())
}

/// Pulls the named file out of a tar.gz archive.
fn extract_binary(archive_bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let decoder = GzDecoder::new(archive_bytes);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let path = entry.path().context("reading entry path")?;
        let matches = path
            .file_name()
            .and_then(|f| f.to_str())
            .is_some_and(|f| f == name);
        if matches {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    bail!("{name} not found in update archive")
}

fn swap_binary(exe: &Path, new_binary: &[u8]) -> Result<()> {
    let staged = exe.with_extension("new");
    std::fs::write(&staged, new_binary)
        .with_context(|| format!("writing {}", staged.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))?;
    }

    let backup = exe.with_extension("bak");
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(exe, &backup).context("backing up current binary")?;

    if let Err(err) = std::fs::rename(&staged, exe) {
        // Put the old binary back before giving up.
        let _ = std::fs::rename(&backup, exe);
        return Err(err).context("installing new binary");
    }
    Ok(())
}

fn restart(exe: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(exe).arg("start").exec();
        // exec only returns on failure.
        error!(error = %err, "exec into new binary failed");
    }
    #[cfg(not(unix))]
    {
        match std::process::Command::new(exe).arg("start").spawn() {
            Ok(_) => std::process::exit(0),
            Err(err) => error!(error = %err, "spawning new binary failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_gz_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracts_the_named_binary() {
        let archive = tar_gz_with("capstan-agent", b"#!fake-binary");
        let bytes = extract_binary(&archive, "capstan-agent").unwrap();
        assert_eq!(bytes, b"#!fake-binary");
    }

    #[test]
    fn missing_binary_is_an_error() {
        let archive = tar_gz_with("README.md", b"docs only");
        assert!(extract_binary(&archive, "capstan-agent").is_err());
    }

    #[test]
    fn swap_replaces_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("agent");
        let mut file = std::fs::File::create(&exe).unwrap();
        file.write_all(b"old").unwrap();
        drop(file);

        swap_binary(&exe, b"new").unwrap();

        assert_eq!(std::fs::read(&exe).unwrap(), b"new");
        assert_eq!(std::fs::read(exe.with_extension("bak")).unwrap(), b"old");
        assert!(!exe.with_extension("new").exists());
    }
}
