// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use fedlytics_coordinator::CoordinatorConfig;
use fedlytics_core::CipherConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fedlytics Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:47200")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Enable CORS
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,

    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub log_json: bool,

    /// How often overdue rounds are swept, in seconds
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

/// In-process client agents with synthetic data, for demos and smoke tests
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Number of simulated clients registered at startup (0 = none)
    #[serde(default)]
    pub clients: usize,

    #[serde(default = "default_records_per_client")]
    pub records_per_client: usize,

    #[serde(default = "default_simulation_seed")]
    pub seed: u64,
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:47200".to_string()
}

fn default_enable_cors() -> bool {
    true
}

fn default_reaper_interval() -> u64 {
    5
}

fn default_records_per_client() -> usize {
    5
}

fn default_simulation_seed() -> u64 {
    42
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            enable_cors: default_enable_cors(),
            log_json: false,
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clients: 0,
            records_per_client: default_records_per_client(),
            seed: default_simulation_seed(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - FEDLYTICS_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:47200)
    /// - FEDLYTICS_MIN_CLIENTS: Contributions required per round (default: 2)
    /// - FEDLYTICS_LEARNING_RATE: Gradient step size (default: 0.01)
    /// - FEDLYTICS_ROUND_TIMEOUT: Round deadline in seconds (default: 30)
    /// - FEDLYTICS_MODEL_DIR: Directory for model snapshots (default: memory only)
    /// - FEDLYTICS_CIPHER_BACKEND: `mock_ckks` or `ckks` (default: mock_ckks)
    /// - FEDLYTICS_LOG_JSON: JSON log output (default: false)
    /// - FEDLYTICS_SIMULATED_CLIENTS: Simulated clients at startup (default: 0)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        Self::apply_env(&mut config);
        config
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        // Override with environment variables
        Self::apply_env(&mut config);

        Ok(config)
    }

    /// Overwrite fields whose environment variable is set and parses.
    fn apply_env(config: &mut Self) {
        if let Ok(addr) = std::env::var("FEDLYTICS_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Some(val) = env_parse("FEDLYTICS_LOG_JSON") {
            config.server.log_json = val;
        }

        if let Some(val) = env_parse("FEDLYTICS_MIN_CLIENTS") {
            config.coordinator.min_clients_per_round = val;
        }

        if let Some(val) = env_parse("FEDLYTICS_LEARNING_RATE") {
            config.coordinator.learning_rate = val;
        }

        if let Some(val) = env_parse("FEDLYTICS_ROUND_TIMEOUT") {
            config.coordinator.round_timeout_secs = val;
        }

        if let Ok(dir) = std::env::var("FEDLYTICS_MODEL_DIR") {
            config.coordinator.model_dir = Some(PathBuf::from(dir));
        }

        if let Some(val) = env_parse("FEDLYTICS_CIPHER_BACKEND") {
            config.cipher.backend = val;
        }

        if let Some(val) = env_parse("FEDLYTICS_SIMULATED_CLIENTS") {
            config.simulation.clients = val;
        }
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.server.reaper_interval_secs.max(1))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        self.coordinator.validate()?;
        self.cipher.validate()?;

        if let Some(dir) = &self.coordinator.model_dir {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(val) => Some(val),
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
