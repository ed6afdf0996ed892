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

//! The panel server: boots the coordination engine and serves the agent
//! gateway until interrupted.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use capstan::config::ControlConfig;
use capstan::coordinator::TaskCoordinator;
use capstan::gateway::AgentGateway;
use capstan::livelog::LiveLogRegistry;
use capstan::repository::{MemoryRepository, Repository};

pub async fn run(config_path: &Path, verbose: bool) -> Result<()> {
    init_tracing(verbose);

    let config = ControlConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        config = %config_path.display(),
        bind = %config.bind_addr(),
        "starting capstan server"
    );

    // Storage behind the repository contract. The in-memory store keeps
    // the engine fully functional without external persistence; a
    // relational implementation plugs in here through the same trait.
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    let livelogs = LiveLogRegistry::new();
    let gateway = AgentGateway::new(repo.clone(), livelogs.clone());
    let coordinator = TaskCoordinator::new(repo, livelogs, gateway.clone())
        .await
        .context("building coordinator")?;

    coordinator.start().await.context("starting coordinator")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    info!(addr = %config.bind_addr(), "agent gateway listening");

    let app = gateway.router();
    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("serving agent gateway")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    coordinator.stop().await;
    info!("server stopped");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
