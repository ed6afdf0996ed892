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

//! Capstan agent binary.
//!
//! A worker node that keeps a persistent channel to the control node,
//! runs the tasks bound to it (cron-scheduled locally, or pushed with an
//! `execute` frame), streams output back in real time, and can replace
//! its own binary when the control node publishes an update.

mod config;
mod machine;
mod outbound;
mod pidfile;
mod runtime;
mod update;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use runtime::AgentRuntime;

#[derive(Parser)]
#[command(name = "capstan-agent", version, about = "Capstan worker node")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.ini")]
    config: PathBuf,

    /// Log file path
    #[arg(short = 'l', long, global = true, default_value = "logs/agent.log")]
    log: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent in the foreground
    Start,
    /// Stop a running agent via its pid file
    Stop,
    /// Show whether the agent is running
    Status,
    /// Install as a system service
    Install,
    /// Remove the system service
    Uninstall,
    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_start(&cli))
        }
        Command::Stop => pidfile::stop(&cli.config),
        Command::Status => {
            pidfile::status(&cli.config);
            Ok(())
        }
        Command::Install | Command::Uninstall => {
            // Service management is delegated to the platform's own
            // tooling; the agent only runs in the foreground.
            bail!(
                "service installation is managed externally; run `capstan-agent start` \
                 under your service manager of choice"
            );
        }
        Command::Version => {
            println!("capstan-agent v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn cmd_start(cli: &Cli) -> Result<()> {
    init_logging(&cli.log)?;

    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if config.server_url.is_empty() {
        bail!("server_url is not set; add it to the [agent] section of the config file");
    }
    if config.token.is_empty() {
        bail!("token is not set; add it to the [agent] section of the config file");
    }

    let machine_id = machine::machine_id();
    info!(version = env!("CARGO_PKG_VERSION"), "capstan agent starting");
    info!(server = %config.server_url, name = %config.name, "configuration loaded");
    info!(machine_id = %&machine_id[..16.min(machine_id.len())], "machine identity derived");

    pidfile::write(&cli.config)?;

    let runtime = Arc::new(AgentRuntime::new(config, machine_id));
    runtime.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    runtime.stop().await;
    pidfile::remove(&cli.config);
    Ok(())
}

fn init_logging(log_path: &std::path::Path) -> Result<()> {
    if let Some(dir) = log_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(TeeMakeWriter { file })
        .with_ansi(false)
        .init();
    Ok(())
}

/// Duplicates log lines to stdout and the log file.
struct TeeMakeWriter {
    file: std::fs::File,
}

struct TeeWriter {
    file: std::fs::File,
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stdout().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stdout().flush();
        self.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.try_clone().expect("log file clone"),
        }
    }
}
