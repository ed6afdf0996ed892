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

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "capstan-ctl",
    version,
    about = "Capstan control node",
    long_about = "Runs the Capstan panel server and the repository sync tool used by repo tasks"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.ini")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the panel server (default)
    Server,
    /// Mirror a repository or file into the scripts directory
    Reposync(ReposyncArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReposyncArgs {
    /// Source type: git or url
    #[arg(long, default_value = "git")]
    pub source_type: String,

    /// Source URL
    #[arg(long, default_value = "")]
    pub source_url: String,

    /// Target path
    #[arg(long, default_value = "")]
    pub target_path: String,

    /// Branch to check out
    #[arg(long, default_value = "")]
    pub branch: String,

    /// Sparse-checkout path
    #[arg(long, default_value = "")]
    pub path: String,

    /// Download a single file instead of the whole tree
    #[arg(long)]
    pub single_file: bool,

    /// Proxy type: none, ghproxy, mirror, or custom
    #[arg(long, default_value = "none")]
    pub proxy: String,

    /// Custom proxy URL (with --proxy custom)
    #[arg(long, default_value = "")]
    pub proxy_url: String,

    /// Auth token for private sources
    #[arg(long, default_value = "")]
    pub auth_token: String,

    /// HTTP proxy for git operations
    #[arg(long, default_value = "")]
    pub http_proxy: String,
}
