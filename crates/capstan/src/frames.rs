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

//! Wire protocol between control node and agents.
//!
//! One long-lived text-frame channel per agent carries JSON envelopes of
//! the form `{ "type": "<name>", "data": <payload> }`. The connect URL
//! carries `token` and `machine_id` query parameters; the HTTP fallback
//! uses `Authorization: Bearer <token>` and `X-Machine-ID` headers.

use serde::{Deserialize, Serialize};

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    // agent → control
    Heartbeat,
    FetchTasks,
    TaskResult,
    TaskLog,
    TaskHeartbeat,
    // control → agent
    Connected,
    HeartbeatAck,
    Tasks,
    Execute,
    Stop,
    Disabled,
    Enabled,
    Update,
}

/// The JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new<T: Serialize>(kind: FrameKind, data: &T) -> Self {
        Self {
            kind,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            data: serde_json::Value::Null,
        }
    }

    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// `connected` payload: handshake reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub agent_id: u64,
    pub name: String,
    pub is_new_agent: bool,
    pub machine_id: String,
    pub scheduler_config: SchedulerConfigPayload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfigPayload {
    pub worker_count: usize,
    pub queue_size: usize,
    /// Milliseconds.
    pub rate_interval: u64,
}

/// `heartbeat` payload: agent liveness plus host facts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub auto_update: bool,
}

/// `heartbeat_ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatAckPayload {
    pub agent_id: u64,
    pub name: String,
    #[serde(default)]
    pub need_update: bool,
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub latest_version: String,
}

/// One task entry in a `tasks` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskSpec {
    pub id: u64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub timeout: f64,
    #[serde(default)]
    pub work_dir: String,
    /// `KEY=VALUE,KEY2=V2` string.
    #[serde(default)]
    pub envs: String,
    pub enabled: bool,
}

/// `tasks` payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TasksPayload {
    pub tasks: Vec<AgentTaskSpec>,
}

/// `execute` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub task_id: u64,
    pub log_id: u64,
}

/// `stop` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StopPayload {
    pub log_id: u64,
}

/// `task_log` payload: one raw UTF-8 output chunk (may contain ANSI
/// escapes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogPayload {
    pub log_id: u64,
    pub content: String,
}

/// `task_heartbeat` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskHeartbeatPayload {
    pub log_id: u64,
    /// Milliseconds since the run started.
    pub duration: i64,
}

/// `task_result` payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskResultPayload {
    pub task_id: u64,
    pub log_id: u64,
    /// Filled by the control node on the HTTP fallback path.
    #[serde(default)]
    pub agent_id: u64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    pub status: String,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub exit_code: i32,
    /// Unix seconds.
    #[serde(default)]
    pub start_time: i64,
    /// Unix seconds.
    #[serde(default)]
    pub end_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let frame = Frame::new(
            FrameKind::Execute,
            &ExecutePayload {
                task_id: 7,
                log_id: 42,
            },
        );
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"execute""#));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, FrameKind::Execute);
        let payload: ExecutePayload = parsed.parse_data().unwrap();
        assert_eq!(payload.task_id, 7);
        assert_eq!(payload.log_id, 42);
    }

    #[test]
    fn frame_kinds_use_snake_case_names() {
        assert_eq!(
            serde_json::to_string(&FrameKind::HeartbeatAck).unwrap(),
            r#""heartbeat_ack""#
        );
        assert_eq!(
            serde_json::to_string(&FrameKind::FetchTasks).unwrap(),
            r#""fetch_tasks""#
        );
        assert_eq!(
            serde_json::to_string(&FrameKind::TaskHeartbeat).unwrap(),
            r#""task_heartbeat""#
        );
    }

    #[test]
    fn bare_frames_omit_data() {
        let json = serde_json::to_string(&Frame::bare(FrameKind::FetchTasks)).unwrap();
        assert_eq!(json, r#"{"type":"fetch_tasks"}"#);

        let parsed: Frame = serde_json::from_str(r#"{"type":"disabled"}"#).unwrap();
        assert_eq!(parsed.kind, FrameKind::Disabled);
    }

    #[test]
    fn result_payload_tolerates_missing_fields() {
        let payload: TaskResultPayload =
            serde_json::from_str(r#"{"task_id":1,"log_id":2,"status":"success"}"#).unwrap();
        assert_eq!(payload.status, "success");
        assert_eq!(payload.exit_code, 0);
        assert!(payload.output.is_empty());
    }
}
