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

//! Control-node configuration.
//!
//! An INI file with `server`, `database`, and `security` sections, every
//! key overridable through `BH_<SECTION>_<KEY>` environment variables
//! (`BH_SERVER_PORT=9090`). Scheduler tuning does not live here — it is
//! read through the settings contract so it can change at runtime.

use std::path::Path;

use ini::Ini;
use serde::{Deserialize, Serialize};

use crate::error::CapstanError;

/// Environment variable prefix.
const ENV_PREFIX: &str = "BH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub url_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8188,
            url_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// `sqlite`, `mysql`, `postgres`, or empty for in-memory.
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    /// File path for sqlite.
    pub path: String,
    pub table_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    pub secret: String,
}

/// The full control-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
}

impl ControlConfig {
    /// Loads the file (when present), then applies environment
    /// overrides. A missing file is not an error — everything can come
    /// from the environment.
    pub fn load(path: &Path) -> Result<Self, CapstanError> {
        let mut config = Self::default();

        if path.exists() {
            let ini = Ini::load_from_file(path)
                .map_err(|e| CapstanError::Config(format!("{}: {e}", path.display())))?;
            config.apply_ini(&ini)?;
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_ini(&mut self, ini: &Ini) -> Result<(), CapstanError> {
        if let Some(section) = ini.section(Some("server")) {
            if let Some(host) = section.get("host") {
                self.server.host = host.to_string();
            }
            if let Some(port) = section.get("port") {
                self.server.port = parse_port(port)?;
            }
            if let Some(prefix) = section.get("url_prefix") {
                self.server.url_prefix = prefix.to_string();
            }
        }

        if let Some(section) = ini.section(Some("database")) {
            let mut set = |key: &str, target: &mut String| {
                if let Some(value) = section.get(key) {
                    *target = value.to_string();
                }
            };
            set("type", &mut self.database.kind);
            set("host", &mut self.database.host);
            set("user", &mut self.database.user);
            set("password", &mut self.database.password);
            set("dbname", &mut self.database.dbname);
            set("path", &mut self.database.path);
            set("table_prefix", &mut self.database.table_prefix);
            if let Some(port) = section.get("port") {
                self.database.port = parse_port(port)?;
            }
        }

        if let Some(section) = ini.section(Some("security")) {
            if let Some(secret) = section.get("secret") {
                self.security.secret = secret.to_string();
            }
        }

        Ok(())
    }

    /// Applies `BH_<SECTION>_<KEY>` overrides via the given lookup
    /// (injected for testability).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), CapstanError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |section: &str, key: &str| {
            lookup(&format!(
                "{ENV_PREFIX}_{}_{}",
                section.to_uppercase(),
                key.to_uppercase()
            ))
        };

        if let Some(host) = var("server", "host") {
            self.server.host = host;
        }
        if let Some(port) = var("server", "port") {
            self.server.port = parse_port(&port)?;
        }
        if let Some(prefix) = var("server", "url_prefix") {
            self.server.url_prefix = prefix;
        }

        if let Some(kind) = var("database", "type") {
            self.database.kind = kind;
        }
        if let Some(host) = var("database", "host") {
            self.database.host = host;
        }
        if let Some(port) = var("database", "port") {
            self.database.port = parse_port(&port)?;
        }
        if let Some(user) = var("database", "user") {
            self.database.user = user;
        }
        if let Some(password) = var("database", "password") {
            self.database.password = password;
        }
        if let Some(dbname) = var("database", "dbname") {
            self.database.dbname = dbname;
        }
        if let Some(path) = var("database", "path") {
            self.database.path = path;
        }
        if let Some(prefix) = var("database", "table_prefix") {
            self.database.table_prefix = prefix;
        }

        if let Some(secret) = var("security", "secret") {
            self.security.secret = secret;
        }

        Ok(())
    }

    /// The address the server binds.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_port(value: &str) -> Result<u16, CapstanError> {
    value
        .parse()
        .map_err(|_| CapstanError::Config(format!("invalid port: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_file() {
        let config = ControlConfig::load(Path::new("/nonexistent/config.ini")).unwrap();
        assert_eq!(config.server.port, 8188);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn ini_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nhost = 127.0.0.1\nport = 9001\n\n[database]\ntype = sqlite\npath = data.db\n\n[security]\nsecret = hush"
        )
        .unwrap();

        let config = ControlConfig::load(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.database.kind, "sqlite");
        assert_eq!(config.database.path, "data.db");
        assert_eq!(config.security.secret, "hush");
        assert_eq!(config.bind_addr(), "127.0.0.1:9001");
    }

    #[test]
    fn env_overrides_beat_ini() {
        let mut config = ControlConfig::default();
        config
            .apply_env(|key| match key {
                "BH_SERVER_PORT" => Some("7777".to_string()),
                "BH_DATABASE_TYPE" => Some("postgres".to_string()),
                "BH_SECURITY_SECRET" => Some("env-secret".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.server.port, 7777);
        assert_eq!(config.database.kind, "postgres");
        assert_eq!(config.security.secret, "env-secret");
    }

    #[test]
    fn bad_port_is_a_config_error() {
        let mut config = ControlConfig::default();
        let result = config.apply_env(|key| {
            (key == "BH_SERVER_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(CapstanError::Config(_))));
    }
}
