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

//! Agent configuration: an INI file with one `[agent]` section, with
//! `AGENT_SERVER` / `AGENT_NAME` environment overrides.

use std::path::Path;

use anyhow::Result;
use ini::Ini;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub name: String,
    pub token: String,
    /// Heartbeat interval, seconds.
    pub interval: u64,
    pub auto_update: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            name: String::new(),
            token: String::new(),
            interval: 30,
            auto_update: false,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();

        if path.exists() {
            let ini = Ini::load_from_file(path)?;
            if let Some(section) = ini.section(Some("agent")) {
                if let Some(url) = section.get("server_url") {
                    config.server_url = url.trim_end_matches('/').to_string();
                }
                if let Some(name) = section.get("name") {
                    config.name = name.to_string();
                }
                if let Some(token) = section.get("token") {
                    config.token = token.to_string();
                }
                if let Some(interval) = section.get("interval") {
                    if let Ok(secs) = interval.parse::<u64>() {
                        if secs > 0 {
                            config.interval = secs;
                        }
                    }
                }
                if let Some(auto) = section.get("auto_update") {
                    config.auto_update = auto == "true" || auto == "1";
                }
            }
        }

        if let Ok(server) = std::env::var("AGENT_SERVER") {
            if !server.is_empty() {
                config.server_url = server.trim_end_matches('/').to_string();
            }
        }
        if let Ok(name) = std::env::var("AGENT_NAME") {
            if !name.is_empty() {
                config.name = name;
            }
        }

        if config.name.is_empty() {
            config.name = gethostname::gethostname().to_string_lossy().into_owned();
        }

        Ok(config)
    }

    /// The WebSocket connect URL, with credentials as query parameters.
    pub fn ws_url(&self, machine_id: &str) -> String {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.server_url)
        };
        format!(
            "{base}/api/agent/ws?token={}&machine_id={}",
            urlencode(&self.token),
            urlencode(machine_id)
        )
    }
}

/// Minimal percent-encoding for query values.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_agent_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[agent]\nserver_url = http://panel.example.com/\nname = worker-1\ntoken = tok\ninterval = 15\nauto_update = true"
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.server_url, "http://panel.example.com");
        assert_eq!(config.name, "worker-1");
        assert_eq!(config.token, "tok");
        assert_eq!(config.interval, 15);
        assert!(config.auto_update);
    }

    #[test]
    fn missing_file_yields_defaults_with_hostname() {
        let config = AgentConfig::load(Path::new("/no/such/config.ini")).unwrap();
        assert_eq!(config.interval, 30);
        assert!(!config.name.is_empty());
    }

    #[test]
    fn ws_url_translates_scheme_and_encodes() {
        let config = AgentConfig {
            server_url: "https://panel.example.com".into(),
            token: "a b+c".into(),
            ..Default::default()
        };
        let url = config.ws_url("machine/1");
        assert!(url.starts_with("wss://panel.example.com/api/agent/ws?token=a%20b%2Bc"));
        assert!(url.ends_with("machine_id=machine%2F1"));
    }
}
