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

//! Coordinator configuration

use fedlytics_core::DEFAULT_FEATURES;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FederatedError, FederatedResult};

/// Configuration for rounds, training and query processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Distinct client contributions required to commit a round
    #[serde(default = "default_min_clients")]
    pub min_clients_per_round: usize,

    /// Gradient-descent step size
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Seconds a round may stay active before it is failed
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: u64,

    /// Upper bound on rounds a single training query may request
    #[serde(default = "default_max_rounds_per_query")]
    pub max_rounds_per_query: u32,

    /// Model versions kept in history (0 = unlimited)
    #[serde(default = "default_max_model_versions")]
    pub max_model_versions: usize,

    /// Closed rounds kept in history (0 = unlimited)
    #[serde(default = "default_max_round_history")]
    pub max_round_history: usize,

    /// Clients seen within this window count as active
    #[serde(default = "default_activity_window")]
    pub client_activity_window_secs: u64,

    /// Directory for model version snapshots (None = memory only)
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// Model input features
    #[serde(default = "default_features")]
    pub features: Vec<String>,
}

fn default_min_clients() -> usize {
    2
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_round_timeout() -> u64 {
    30
}

fn default_max_rounds_per_query() -> u32 {
    100
}

fn default_max_model_versions() -> usize {
    100
}

fn default_max_round_history() -> usize {
    1_000
}

fn default_activity_window() -> u64 {
    300
}

fn default_features() -> Vec<String> {
    DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_clients_per_round: default_min_clients(),
            learning_rate: default_learning_rate(),
            round_timeout_secs: default_round_timeout(),
            max_rounds_per_query: default_max_rounds_per_query(),
            max_model_versions: default_max_model_versions(),
            max_round_history: default_max_round_history(),
            client_activity_window_secs: default_activity_window(),
            model_dir: None,
            features: default_features(),
        }
    }
}

impl CoordinatorConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.client_activity_window_secs)
    }

    pub fn validate(&self) -> FederatedResult<()> {
        if self.min_clients_per_round == 0 {
            return Err(FederatedError::InvalidParameter(
                "min_clients_per_round must be at least 1".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(FederatedError::InvalidParameter(format!(
                "learning_rate must be positive (got {})",
                self.learning_rate
            )));
        }
        if self.round_timeout_secs == 0 {
            return Err(FederatedError::InvalidParameter(
                "round_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.features.is_empty() {
            return Err(FederatedError::InvalidParameter(
                "at least one model feature is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_clients_per_round, 2);
        assert_eq!(config.round_timeout(), Duration::from_secs(30));
        assert_eq!(config.features.len(), 4);
    }

    #[test]
    fn test_rejects_zero_quorum() {
        let config = CoordinatorConfig {
            min_clients_per_round: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_learning_rate() {
        let config = CoordinatorConfig {
            learning_rate: -0.5,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
