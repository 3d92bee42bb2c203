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

//! Client Agent - Participant-Side Training
//!
//! Owns the participant's plaintext dataset and an evaluator built from the
//! coordinator's public material. Every value that leaves the agent is a
//! ciphertext: gradients are computed homomorphically on encrypted features,
//! encrypted targets and the encrypted global model.

use chrono::Utc;
use fedlytics_core::{
    Ciphertext, ClientDataset, EmissionScope, HomomorphicEvaluator, ModelSnapshot, RetryPolicy,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FederatedError, FederatedResult};
use crate::transport::{CoordinatorTransport, UpdateReceipt};
use crate::update::{EncryptedStatistic, EncryptedUpdate};

pub struct ClientAgent {
    client_id: String,
    dataset: ClientDataset,
    transport: Arc<dyn CoordinatorTransport>,
    evaluator: Option<Arc<dyn HomomorphicEvaluator>>,
    /// Version of the model this agent last contributed to
    model_version: u64,
    retry: RetryPolicy,
}

impl ClientAgent {
    pub fn new(
        client_id: impl Into<String>,
        dataset: ClientDataset,
        transport: Arc<dyn CoordinatorTransport>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            dataset,
            transport,
            evaluator: None,
            model_version: 0,
            retry: RetryPolicy::exponential(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn model_version(&self) -> u64 {
        self.model_version
    }

    pub fn is_registered(&self) -> bool {
        self.evaluator.is_some()
    }

    /// Register with the coordinator and build the local evaluator from the
    /// returned public material. Returns whether the client was new.
    pub async fn register(&mut self) -> FederatedResult<bool> {
        let transport = self.transport.clone();
        let client_id = self.client_id.clone();
        let data_size = self.dataset.len();

        let receipt = self
            .retry
            .retry(
                || transport.register(&client_id, data_size),
                |e: &FederatedError| e.is_transient(),
            )
            .await?;

        self.evaluator = Some(receipt.public_material.evaluator()?);
        info!(
            client_id = %self.client_id,
            context_id = %receipt.public_material.context_id,
            records = data_size,
            "Registered with coordinator"
        );
        Ok(receipt.newly_registered)
    }

    pub async fn download_global_model(&self) -> FederatedResult<ModelSnapshot> {
        let transport = self.transport.clone();
        self.retry
            .retry(
                || transport.download_global_model(),
                |e: &FederatedError| e.is_transient(),
            )
            .await
    }

    /// Mean squared-error gradient over the local records, computed on
    /// ciphertexts and scaled by `1/n`.
    pub fn compute_local_update(&self, snapshot: &ModelSnapshot) -> FederatedResult<EncryptedUpdate> {
        let evaluator = self.evaluator()?;
        let round_id = snapshot.round_id.ok_or(FederatedError::NoActiveRound)?;
        if self.dataset.is_empty() {
            return Err(FederatedError::InvalidParameter(format!(
                "client {} has no local records",
                self.client_id
            )));
        }

        let features = snapshot.feature_names();
        let weights = evaluator.encrypt(&snapshot.weight_vector())?;
        let bias = evaluator.encrypt_scalar(snapshot.bias)?;

        let mut weight_sum: Option<Ciphertext> = None;
        let mut bias_sum: Option<Ciphertext> = None;
        for record in self.dataset.records() {
            let x = evaluator.encrypt(&record.feature_vector(&features))?;
            let y = evaluator.encrypt_scalar(record.total_emissions())?;

            let dot = evaluator.sum_slots(&evaluator.multiply(&x, &weights)?)?;
            let residual = evaluator.sub(&evaluator.add(&dot, &bias)?, &y)?;
            let gradient = evaluator.multiply(&x, &residual)?;

            weight_sum = Some(accumulate(evaluator.as_ref(), weight_sum, gradient)?);
            bias_sum = Some(accumulate(evaluator.as_ref(), bias_sum, residual)?);
        }

        let (Some(weight_sum), Some(bias_sum)) = (weight_sum, bias_sum) else {
            return Err(FederatedError::AggregationEmpty);
        };
        let inverse_n = evaluator.encrypt_scalar(1.0 / self.dataset.len() as f64)?;

        debug!(
            client_id = %self.client_id,
            round_id,
            records = self.dataset.len(),
            "Computed encrypted local gradient"
        );

        Ok(EncryptedUpdate {
            client_id: self.client_id.clone(),
            round_id,
            model_version: snapshot.version,
            feature_names: features,
            weight_gradients: evaluator.multiply(&weight_sum, &inverse_n)?,
            bias_gradient: evaluator.multiply(&bias_sum, &inverse_n)?,
            submitted_at: Utc::now(),
        })
    }

    /// Send an update. Returns `false` if the coordinator dropped it.
    pub async fn submit_update(&mut self, update: EncryptedUpdate) -> FederatedResult<bool> {
        let transport = self.transport.clone();
        let version = update.model_version;
        let round_id = update.round_id;

        let receipt = self
            .retry
            .retry(
                || transport.submit_update(update.clone()),
                |e: &FederatedError| e.is_transient(),
            )
            .await?;

        match receipt {
            UpdateReceipt::Accepted { .. } => {
                self.model_version = version;
                debug!(client_id = %self.client_id, round_id, "Update accepted");
                Ok(true)
            }
            UpdateReceipt::Rejected { reason } => {
                debug!(client_id = %self.client_id, round_id, "Update rejected: {}", reason);
                Ok(false)
            }
        }
    }

    /// Download, train and submit for the active round. Returns `false` if
    /// there is no active round or the update was dropped.
    pub async fn participate(&mut self) -> FederatedResult<bool> {
        let snapshot = self.download_global_model().await?;
        if snapshot.round_id.is_none() {
            debug!(client_id = %self.client_id, "No active round to participate in");
            return Ok(false);
        }
        let update = self.compute_local_update(&snapshot)?;
        self.submit_update(update).await
    }

    /// Encrypted emissions sum and record count for `scope`.
    pub fn compute_statistic(&self, scope: EmissionScope) -> FederatedResult<EncryptedStatistic> {
        let evaluator = self.evaluator()?;
        if self.dataset.is_empty() {
            return Err(FederatedError::InvalidParameter(format!(
                "client {} has no local records",
                self.client_id
            )));
        }

        let mut sum: Option<Ciphertext> = None;
        for record in self.dataset.records() {
            let value = evaluator.encrypt_scalar(record.emissions(scope))?;
            sum = Some(accumulate(evaluator.as_ref(), sum, value)?);
        }
        let emissions_sum = sum.ok_or(FederatedError::AggregationEmpty)?;

        Ok(EncryptedStatistic {
            client_id: self.client_id.clone(),
            scope,
            emissions_sum,
            record_count: evaluator.encrypt_scalar(self.dataset.len() as f64)?,
        })
    }

    fn evaluator(&self) -> FederatedResult<&Arc<dyn HomomorphicEvaluator>> {
        self.evaluator.as_ref().ok_or_else(|| {
            FederatedError::Registration(format!("client {} is not registered", self.client_id))
        })
    }
}

fn accumulate(
    evaluator: &dyn HomomorphicEvaluator,
    acc: Option<Ciphertext>,
    value: Ciphertext,
) -> FederatedResult<Ciphertext> {
    match acc {
        Some(acc) => Ok(evaluator.add(&acc, &value)?),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::federation::FederationServer;
    use crate::transport::LocalTransport;
    use fedlytics_core::{CipherBackend, CipherConfig, EmissionRecord};

    fn server(min_clients: usize) -> Arc<FederationServer> {
        let context = CipherBackend::MockCkks
            .create_context(&CipherConfig::default())
            .unwrap();
        let config = CoordinatorConfig {
            min_clients_per_round: min_clients,
            ..CoordinatorConfig::default()
        };
        Arc::new(FederationServer::new(config, context).unwrap())
    }

    fn dataset() -> ClientDataset {
        ClientDataset::new(vec![
            EmissionRecord::new("c1", 10.0, 5.0, 1.0)
                .with_feature("revenue", 2.0)
                .with_feature("employees", 1.0),
            EmissionRecord::new("c2", 20.0, 5.0, 3.0)
                .with_feature("revenue", 4.0)
                .with_feature("energy_consumption", 0.5),
        ])
    }

    #[tokio::test]
    async fn test_encrypted_gradient_matches_plaintext() {
        let server = server(2);
        let mut agent = ClientAgent::new("bank_a", dataset(), Arc::new(LocalTransport::new(server.clone())));
        assert!(agent.register().await.unwrap());
        server.start_round().unwrap();

        let snapshot = agent.download_global_model().await.unwrap();
        let update = agent.compute_local_update(&snapshot).unwrap();

        // Zero model: residual = -y, gradient = mean(-y * x)
        let records = dataset();
        let features = snapshot.feature_names();
        let n = records.len() as f64;
        let mut expected = vec![0.0; features.len()];
        let mut expected_bias = 0.0;
        for r in records.records() {
            let x = r.feature_vector(&features);
            for (e, xi) in expected.iter_mut().zip(x) {
                *e += -r.total_emissions() * xi / n;
            }
            expected_bias += -r.total_emissions() / n;
        }

        let context = server.context();
        let grads = context.decrypt(&update.weight_gradients).unwrap();
        for (g, e) in grads.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-4, "{} vs {}", g, e);
        }
        let bias = context.decrypt(&update.bias_gradient).unwrap()[0];
        assert!((bias - expected_bias).abs() < 1e-4);
        assert_eq!(update.feature_names, features);
    }

    #[tokio::test]
    async fn test_unregistered_agent_cannot_train() {
        let server = server(1);
        let agent = ClientAgent::new("bank_a", dataset(), Arc::new(LocalTransport::new(server.clone())));
        server.start_round().unwrap();
        let snapshot = server.global_model();
        assert!(matches!(
            agent.compute_local_update(&snapshot),
            Err(FederatedError::Registration(_))
        ));
    }

    #[tokio::test]
    async fn test_participate_without_round() {
        let server = server(1);
        let mut agent = ClientAgent::new("bank_a", dataset(), Arc::new(LocalTransport::new(server)));
        agent.register().await.unwrap();
        assert!(!agent.participate().await.unwrap());
    }

    #[tokio::test]
    async fn test_participate_commits_single_client_round() {
        let server = server(1);
        let mut agent = ClientAgent::new("bank_a", dataset(), Arc::new(LocalTransport::new(server.clone())));
        agent.register().await.unwrap();
        server.start_round().unwrap();

        assert!(agent.participate().await.unwrap());
        assert_eq!(agent.model_version(), 1);
        assert_eq!(server.pipeline().current().version, 2);

        // Second submission for the closed round is dropped
        server.start_round().unwrap();
        let stale = agent.compute_local_update(&fedlytics_core::ModelSnapshot {
            round_id: Some(1),
            ..server.global_model()
        });
        assert!(!agent.submit_update(stale.unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_statistic_sums_locally() {
        let server = server(1);
        let mut agent = ClientAgent::new("bank_a", dataset(), Arc::new(LocalTransport::new(server.clone())));
        agent.register().await.unwrap();

        let stat = agent.compute_statistic(EmissionScope::Scope1).unwrap();
        let context = server.context();
        assert!((context.decrypt(&stat.emissions_sum).unwrap()[0] - 30.0).abs() < 1e-6);
        assert!((context.decrypt(&stat.record_count).unwrap()[0] - 2.0).abs() < 1e-6);
    }
}
