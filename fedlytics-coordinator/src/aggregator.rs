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

//! Homomorphic aggregation of client contributions.
//!
//! Everything here runs on ciphertexts through a [`HomomorphicEvaluator`];
//! the aggregator has no decryption capability.

use fedlytics_core::HomomorphicEvaluator;
use tracing::debug;

use crate::error::{FederatedError, FederatedResult};
use crate::update::{
    EncryptedAggregate, EncryptedStatistic, EncryptedStatisticAggregate, EncryptedUpdate,
};

pub struct Aggregator<'a> {
    evaluator: &'a dyn HomomorphicEvaluator,
}

impl<'a> Aggregator<'a> {
    pub fn new(evaluator: &'a dyn HomomorphicEvaluator) -> Self {
        Self { evaluator }
    }

    /// Encrypted mean of the updates: homomorphic sum scaled by an encrypted
    /// `1/N`.
    pub fn aggregate(&self, updates: &[EncryptedUpdate]) -> FederatedResult<EncryptedAggregate> {
        let (first, rest) = updates.split_first().ok_or(FederatedError::AggregationEmpty)?;

        if let Some(other) = rest.iter().find(|u| u.feature_names != first.feature_names) {
            return Err(FederatedError::InvalidParameter(format!(
                "client {} uses a different feature layout than {}",
                other.client_id, first.client_id
            )));
        }
        if let Some(other) = rest.iter().find(|u| u.round_id != first.round_id) {
            return Err(FederatedError::StaleRound {
                submitted: other.round_id,
                active: first.round_id,
            });
        }

        let mut weights = first.weight_gradients.clone();
        let mut bias = first.bias_gradient.clone();
        for update in rest {
            weights = self.evaluator.add(&weights, &update.weight_gradients)?;
            bias = self.evaluator.add(&bias, &update.bias_gradient)?;
        }

        let inverse_n = self.evaluator.encrypt_scalar(1.0 / updates.len() as f64)?;
        let weight_gradients = self.evaluator.multiply(&weights, &inverse_n)?;
        let bias_gradient = self.evaluator.multiply(&bias, &inverse_n)?;

        debug!(
            round_id = first.round_id,
            contributors = updates.len(),
            level = weight_gradients.level(),
            "Aggregated encrypted updates"
        );

        Ok(EncryptedAggregate {
            round_id: first.round_id,
            feature_names: first.feature_names.clone(),
            weight_gradients,
            bias_gradient,
            contributors: updates.len(),
        })
    }

    /// Encrypted sums of emissions and record counts. Means are formed only
    /// after the requesting party decrypts both totals.
    pub fn aggregate_statistics(
        &self,
        statistics: &[EncryptedStatistic],
    ) -> FederatedResult<EncryptedStatisticAggregate> {
        let (first, rest) = statistics
            .split_first()
            .ok_or(FederatedError::AggregationEmpty)?;

        if let Some(other) = rest.iter().find(|s| s.scope != first.scope) {
            return Err(FederatedError::InvalidParameter(format!(
                "client {} reported scope {} instead of {}",
                other.client_id, other.scope, first.scope
            )));
        }

        let mut emissions_sum = first.emissions_sum.clone();
        let mut record_count = first.record_count.clone();
        for stat in rest {
            emissions_sum = self.evaluator.add(&emissions_sum, &stat.emissions_sum)?;
            record_count = self.evaluator.add(&record_count, &stat.record_count)?;
        }

        Ok(EncryptedStatisticAggregate {
            scope: first.scope,
            emissions_sum,
            record_count,
            contributors: statistics.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fedlytics_core::{
        CipherBackend, CipherConfig, CipherContext, CryptoError, EmissionScope,
    };
    use proptest::prelude::*;
    use std::sync::Arc;

    fn context() -> Arc<dyn CipherContext> {
        CipherBackend::MockCkks
            .create_context(&CipherConfig::default())
            .unwrap()
    }

    fn update(ctx: &Arc<dyn CipherContext>, client: &str, weights: &[f64], bias: f64) -> EncryptedUpdate {
        EncryptedUpdate {
            client_id: client.to_string(),
            round_id: 1,
            model_version: 1,
            feature_names: (0..weights.len()).map(|i| format!("f{}", i)).collect(),
            weight_gradients: ctx.encrypt(weights).unwrap(),
            bias_gradient: ctx.encrypt_scalar(bias).unwrap(),
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_aggregation_rejected() {
        let ctx = context();
        let aggregator = Aggregator::new(ctx.as_evaluator());
        assert!(matches!(
            aggregator.aggregate(&[]),
            Err(FederatedError::AggregationEmpty)
        ));
        assert!(matches!(
            aggregator.aggregate_statistics(&[]),
            Err(FederatedError::AggregationEmpty)
        ));
    }

    #[test]
    fn test_single_contribution_is_identity() {
        let ctx = context();
        let aggregator = Aggregator::new(ctx.as_evaluator());
        let agg = aggregator
            .aggregate(&[update(&ctx, "a", &[1.5, -3.0], 0.25)])
            .unwrap();

        let weights = ctx.decrypt(&agg.weight_gradients).unwrap();
        assert!((weights[0] - 1.5).abs() < 1e-6);
        assert!((weights[1] + 3.0).abs() < 1e-6);
        assert!((ctx.decrypt(&agg.bias_gradient).unwrap()[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let ctx = context();
        let aggregator = Aggregator::new(ctx.as_evaluator());
        let a = update(&ctx, "a", &[1.0, 2.0], 0.0);
        let mut b = update(&ctx, "b", &[1.0, 2.0], 0.0);
        b.feature_names.reverse();
        assert!(matches!(
            aggregator.aggregate(&[a, b]),
            Err(FederatedError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_foreign_context_rejected() {
        let ctx = context();
        let other = CipherBackend::MockCkks
            .create_context(&CipherConfig {
                seed: Some(99),
                ..CipherConfig::default()
            })
            .unwrap();
        let aggregator = Aggregator::new(ctx.as_evaluator());
        let a = update(&ctx, "a", &[1.0], 0.0);
        let b = update(&other, "b", &[1.0], 0.0);
        assert!(matches!(
            aggregator.aggregate(&[a, b]),
            Err(FederatedError::Crypto(CryptoError::ContextMismatch { .. }))
        ));
    }

    #[test]
    fn test_statistics_sum() {
        let ctx = context();
        let aggregator = Aggregator::new(ctx.as_evaluator());
        let stats: Vec<_> = [(175.0, 1.0), (350.0, 1.0), (265.0, 1.0)]
            .iter()
            .enumerate()
            .map(|(i, (sum, count))| EncryptedStatistic {
                client_id: format!("c{}", i),
                scope: EmissionScope::Total,
                emissions_sum: ctx.encrypt_scalar(*sum).unwrap(),
                record_count: ctx.encrypt_scalar(*count).unwrap(),
            })
            .collect();

        let agg = aggregator.aggregate_statistics(&stats).unwrap();
        assert_eq!(agg.contributors, 3);
        assert!((ctx.decrypt(&agg.emissions_sum).unwrap()[0] - 790.0).abs() < 1e-3);
        assert!((ctx.decrypt(&agg.record_count).unwrap()[0] - 3.0).abs() < 1e-6);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_aggregate_is_mean(
            grads in prop::collection::vec(prop::collection::vec(-100.0f64..100.0, 3), 1..8)
        ) {
            let ctx = context();
            let aggregator = Aggregator::new(ctx.as_evaluator());
            let updates: Vec<_> = grads
                .iter()
                .enumerate()
                .map(|(i, g)| update(&ctx, &format!("c{}", i), g, g[0]))
                .collect();

            let agg = aggregator.aggregate(&updates).unwrap();
            let decrypted = ctx.decrypt(&agg.weight_gradients).unwrap();
            let n = grads.len() as f64;
            for slot in 0..3 {
                let expected = grads.iter().map(|g| g[slot]).sum::<f64>() / n;
                prop_assert!((decrypted[slot] - expected).abs() < 1e-3);
            }
        }
    }
}
