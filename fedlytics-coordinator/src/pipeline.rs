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

//! Encrypted training pipeline.
//!
//! Holds the current global model behind an `Arc` swap: readers clone the
//! `Arc` and keep a consistent version for as long as they need it, and
//! [`TrainingPipeline::commit`] is the only way a new version is installed.
//!
//! `commit` only touches memory. Snapshot files for committed versions are
//! queued and written by [`TrainingPipeline::flush`], which callers run once
//! they no longer hold the round lock.

use fedlytics_core::{Ciphertext, CipherContext, CryptoError, EsgModel, HomomorphicEvaluator};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{FederatedError, FederatedResult};
use crate::model_store::{ModelStore, PendingSnapshot};
use crate::update::EncryptedAggregate;

pub struct TrainingPipeline {
    current: RwLock<Arc<EsgModel>>,
    store: Mutex<ModelStore>,
    unwritten: Mutex<Vec<PendingSnapshot>>,
    /// Serializes flushes so snapshots land on disk in version order
    writer: Mutex<()>,
}

impl TrainingPipeline {
    pub fn new(initial: EsgModel, mut store: ModelStore) -> FederatedResult<Self> {
        if store.latest().map(|m| m.version) != Some(initial.version) {
            store.record(&initial)?;
        }
        Ok(Self {
            current: RwLock::new(Arc::new(initial)),
            store: Mutex::new(store),
            unwritten: Mutex::new(Vec::new()),
            writer: Mutex::new(()),
        })
    }

    /// Build from configuration, resuming from the newest persisted version
    /// when a model directory is configured.
    pub fn from_config(config: &CoordinatorConfig) -> FederatedResult<Self> {
        let store = match &config.model_dir {
            Some(dir) => ModelStore::open(dir, config.max_model_versions)?,
            None => ModelStore::in_memory(config.max_model_versions),
        };

        let initial = match store.latest() {
            Some(model) if model.feature_names() == sorted(&config.features) => {
                info!("Resuming from persisted model v{}", model.version);
                model.clone()
            }
            Some(model) => {
                warn!(
                    "Persisted model v{} has different features; starting a fresh model",
                    model.version
                );
                EsgModel {
                    version: model.version + 1,
                    ..EsgModel::new(config.features.iter().cloned())
                }
            }
            None => EsgModel::new(config.features.iter().cloned()),
        };

        Self::new(initial, store)
    }

    pub fn current(&self) -> Arc<EsgModel> {
        self.current.read().clone()
    }

    /// Decrypt the aggregate and take one gradient step from `current`.
    ///
    /// Only the aggregate is decrypted; the result is a candidate version
    /// that is not visible until [`commit`](Self::commit).
    pub fn apply_aggregate(
        &self,
        context: &dyn CipherContext,
        current: &EsgModel,
        aggregate: &EncryptedAggregate,
        learning_rate: f64,
    ) -> FederatedResult<EsgModel> {
        if aggregate.feature_names != current.feature_names() {
            return Err(FederatedError::InvalidParameter(format!(
                "aggregate features {:?} do not match model features {:?}",
                aggregate.feature_names,
                current.feature_names()
            )));
        }

        let width = aggregate.feature_names.len();
        let weights = context.decrypt(&aggregate.weight_gradients)?;
        if weights.len() < width {
            return Err(CryptoError::ShapeMismatch {
                lhs: width,
                rhs: weights.len(),
            }
            .into());
        }
        let bias = context
            .decrypt(&aggregate.bias_gradient)?
            .first()
            .copied()
            .ok_or_else(|| CryptoError::Malformed("empty bias gradient".to_string()))?;

        Ok(current.with_update(&weights[..width], bias, learning_rate, aggregate.round_id)?)
    }

    /// Install `model` as the current version. It must be exactly one
    /// version ahead of the current model.
    pub fn commit(&self, model: EsgModel) -> FederatedResult<Arc<EsgModel>> {
        let mut current = self.current.write();
        if model.version != current.version + 1 {
            return Err(FederatedError::InvalidParameter(format!(
                "model version {} does not follow current version {}",
                model.version, current.version
            )));
        }

        if let Some(pending) = self.store.lock().stage(&model) {
            self.unwritten.lock().push(pending);
        }

        let installed = Arc::new(model);
        *current = installed.clone();
        info!(
            version = installed.version,
            round_id = installed.training_round,
            "Installed new global model"
        );
        Ok(installed)
    }

    /// Write snapshots of committed versions to the model directory.
    /// Returns how many were written. A failed write is logged and dropped;
    /// the version stays available in memory.
    pub fn flush(&self) -> usize {
        let _writer = self.writer.lock();
        let batch = std::mem::take(&mut *self.unwritten.lock());

        let mut written = 0;
        for pending in batch {
            let version = pending.version();
            match pending.write() {
                Ok(()) => written += 1,
                Err(e) => warn!("Failed to persist model v{}: {}", version, e),
            }
        }
        written
    }

    /// Encrypted prediction: `sum(features * weights) + bias` evaluated on
    /// the caller's ciphertext. Features must be packed in model order.
    pub fn predict_encrypted(
        &self,
        evaluator: &dyn HomomorphicEvaluator,
        encrypted_features: &Ciphertext,
    ) -> FederatedResult<Ciphertext> {
        let model = self.current();
        let weights = model.weight_vector();
        if encrypted_features.len() != weights.len() {
            return Err(CryptoError::ShapeMismatch {
                lhs: weights.len(),
                rhs: encrypted_features.len(),
            }
            .into());
        }

        let encrypted_weights = evaluator.encrypt(&weights)?;
        let products = evaluator.multiply(encrypted_features, &encrypted_weights)?;
        let dot = evaluator.sum_slots(&products)?;
        let bias = evaluator.encrypt_scalar(model.bias)?;
        Ok(evaluator.add(&dot, &bias)?)
    }

    pub fn version(&self, version: u64) -> Option<EsgModel> {
        self.store.lock().get(version).cloned()
    }

    /// Retained versions, oldest first.
    pub fn history(&self) -> Vec<EsgModel> {
        self.store.lock().models().cloned().collect()
    }
}

impl Drop for TrainingPipeline {
    fn drop(&mut self) {
        self.flush();
    }
}

fn sorted(features: &[String]) -> Vec<String> {
    let mut names = features.to_vec();
    names.sort();
    names.dedup();
    names
}
