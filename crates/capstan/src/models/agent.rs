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

//! Registered worker nodes.
//!
//! A `(token, machine_id)` pair uniquely identifies a physical worker;
//! reconnecting with the same pair is never a re-registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// A registered worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: u64,
    pub name: String,
    pub token: String,
    /// Bound on first connection; later connections must present the same
    /// value.
    pub machine_id: String,
    pub status: AgentStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub enabled: bool,
    /// When set, the control node instructs the agent to update even if
    /// the agent's own auto-update setting is off.
    pub force_update: bool,
}

/// Fields needed to register a previously unseen worker.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub token: String,
    pub machine_id: String,
}
