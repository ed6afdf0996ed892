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

//! Control binary: `server` runs the panel, `reposync` is invoked as a
//! child by repository mirror tasks.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Server) {
        Commands::Server => {
            // The server owns its runtime; reposync stays synchronous so
            // it can be exec'd cheaply from task commands.
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::server::run(&cli.config, cli.verbose))
        }
        Commands::Reposync(args) => commands::reposync::run(args),
    }
}
