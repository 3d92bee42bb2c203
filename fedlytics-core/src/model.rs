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

//! Global ESG emissions model.
//!
//! A linear regressor over named features. Versions are immutable: every
//! update produces a new `EsgModel` and the previous one stays valid for any
//! client still holding it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CryptoError, CryptoResult};

/// Features the model is initialised with.
pub const DEFAULT_FEATURES: [&str; 4] = [
    "revenue",
    "energy_consumption",
    "employees",
    "renewable_share",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsgModel {
    /// Weight per feature. `BTreeMap` keeps packing order stable.
    pub weights: BTreeMap<String, f64>,
    pub bias: f64,
    pub version: u64,
    /// Round that produced this version (0 for the initial model)
    pub training_round: u64,
    pub created_at: DateTime<Utc>,
}

impl EsgModel {
    /// Initial model: zero weights, version 1.
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            weights: features.into_iter().map(|f| (f.into(), 0.0)).collect(),
            bias: 0.0,
            version: 1,
            training_round: 0,
            created_at: Utc::now(),
        }
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    pub fn weight_vector(&self) -> Vec<f64> {
        self.weights.values().copied().collect()
    }

    /// Plaintext prediction.
    pub fn predict(&self, features: &BTreeMap<String, f64>) -> f64 {
        self.weights
            .iter()
            .map(|(name, w)| w * features.get(name).copied().unwrap_or(0.0))
            .sum::<f64>()
            + self.bias
    }

    /// Gradient-descent step producing the next version.
    pub fn with_update(
        &self,
        weight_gradients: &[f64],
        bias_gradient: f64,
        learning_rate: f64,
        round_id: u64,
    ) -> CryptoResult<EsgModel> {
        if weight_gradients.len() != self.weights.len() {
            return Err(CryptoError::ShapeMismatch {
                lhs: self.weights.len(),
                rhs: weight_gradients.len(),
            });
        }

        let weights = self
            .weights
            .iter()
            .zip(weight_gradients)
            .map(|((name, w), g)| (name.clone(), w - learning_rate * g))
            .collect();

        Ok(EsgModel {
            weights,
            bias: self.bias - learning_rate * bias_gradient,
            version: self.version + 1,
            training_round: round_id,
            created_at: Utc::now(),
        })
    }

    pub fn snapshot(&self, round_id: Option<u64>) -> ModelSnapshot {
        ModelSnapshot {
            weights: self.weights.clone(),
            bias: self.bias,
            version: self.version,
            round_id,
        }
    }
}

impl Default for EsgModel {
    fn default() -> Self {
        Self::new(DEFAULT_FEATURES)
    }
}

/// What a client downloads: the model plus the round it should train for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub weights: BTreeMap<String, f64>,
    pub bias: f64,
    pub version: u64,
    /// Active round at download time, if any
    pub round_id: Option<u64>,
}

impl ModelSnapshot {
    pub fn feature_names(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    pub fn weight_vector(&self) -> Vec<f64> {
        self.weights.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model() {
        let model = EsgModel::default();
        assert_eq!(model.version, 1);
        assert_eq!(model.weights.len(), DEFAULT_FEATURES.len());
        assert!(model.weight_vector().iter().all(|w| *w == 0.0));
    }

    #[test]
    fn test_update_is_copy_on_write() {
        let model = EsgModel::new(["a", "b"]);
        let next = model.with_update(&[1.0, -2.0], 0.5, 0.1, 3).unwrap();

        assert_eq!(model.version, 1);
        assert_eq!(model.weights["a"], 0.0);

        assert_eq!(next.version, 2);
        assert_eq!(next.training_round, 3);
        assert!((next.weights["a"] + 0.1).abs() < 1e-12);
        assert!((next.weights["b"] - 0.2).abs() < 1e-12);
        assert!((next.bias + 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_update_rejects_wrong_width() {
        let model = EsgModel::new(["a", "b"]);
        assert!(model.with_update(&[1.0], 0.0, 0.1, 1).is_err());
    }

    #[test]
    fn test_predict() {
        let mut model = EsgModel::new(["a", "b"]);
        model.weights.insert("a".to_string(), 2.0);
        model.bias = 1.0;
        let features = BTreeMap::from([("a".to_string(), 3.0)]);
        assert_eq!(model.predict(&features), 7.0);
    }
}
