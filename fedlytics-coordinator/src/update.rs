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

//! Encrypted contributions exchanged between client agents and the
//! coordinator. Nothing in this module carries plaintext participant data.

use chrono::{DateTime, Utc};
use fedlytics_core::{Ciphertext, EmissionScope};
use serde::{Deserialize, Serialize};

/// A client's encrypted gradient for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedUpdate {
    pub client_id: String,
    pub round_id: u64,
    /// Model version the gradient was computed against
    pub model_version: u64,
    /// Slot layout of `weight_gradients`
    pub feature_names: Vec<String>,
    pub weight_gradients: Ciphertext,
    pub bias_gradient: Ciphertext,
    pub submitted_at: DateTime<Utc>,
}

/// Homomorphic mean of a round's updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedAggregate {
    pub round_id: u64,
    pub feature_names: Vec<String>,
    pub weight_gradients: Ciphertext,
    pub bias_gradient: Ciphertext,
    pub contributors: usize,
}

/// A client's encrypted local emissions sum and record count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedStatistic {
    pub client_id: String,
    pub scope: EmissionScope,
    pub emissions_sum: Ciphertext,
    pub record_count: Ciphertext,
}

/// Homomorphic sum of statistics across clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedStatisticAggregate {
    pub scope: EmissionScope,
    pub emissions_sum: Ciphertext,
    pub record_count: Ciphertext,
    pub contributors: usize,
}
