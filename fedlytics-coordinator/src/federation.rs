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

//! Federation Server
//!
//! The coordinator side of the client protocol: registration, model
//! distribution, update intake with threshold commit, and status. This is
//! the only component that holds the decryption capability, and it only
//! ever decrypts round aggregates.

use fedlytics_core::{
    CipherContext, CryptoError, EsgModel, ModelSnapshot, PublicMaterial,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::config::CoordinatorConfig;
use crate::error::{FederatedError, FederatedResult};
use crate::pipeline::TrainingPipeline;
use crate::registry::{ClientRecord, ClientRegistry};
use crate::round::{RoundCommit, RoundManager, RoundStatus, SubmissionOutcome, TrainingRound};
use crate::update::EncryptedUpdate;

/// Multiplications the aggregator applies to a client gradient (the scale by
/// an encrypted `1/N`).
const AGGREGATION_DEPTH: u32 = 1;

/// Returned to a client on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    pub client_id: String,
    pub newly_registered: bool,
    /// Everything the client needs to encrypt and evaluate
    pub public_material: PublicMaterial,
}

/// Aggregate federation status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationStatus {
    /// Clients seen within the activity window
    pub active_clients: usize,
    pub total_clients: usize,
    pub current_round: Option<u64>,
    /// Status of the current round, or of the last closed one
    pub round_status: Option<RoundStatus>,
    pub total_rounds: u64,
    pub model_version: u64,
}

/// Full coordinator state, as stored in memory.
#[derive(Debug, Clone, Serialize)]
pub struct FederationSnapshot {
    pub status: FederationStatus,
    pub clients: Vec<ClientRecord>,
    pub rounds: Vec<TrainingRound>,
    pub models: Vec<EsgModel>,
}

pub struct FederationServer {
    config: CoordinatorConfig,
    context: Arc<dyn CipherContext>,
    registry: ClientRegistry,
    rounds: RoundManager,
    pipeline: TrainingPipeline,
}

impl FederationServer {
    pub fn new(config: CoordinatorConfig, context: Arc<dyn CipherContext>) -> FederatedResult<Self> {
        config.validate()?;
        let pipeline = TrainingPipeline::from_config(&config)?;
        let last_round = pipeline
            .history()
            .iter()
            .map(|m| m.training_round)
            .max()
            .unwrap_or(0);
        let rounds = RoundManager::new(
            config.min_clients_per_round,
            config.round_timeout(),
            config.max_round_history,
        )
        .starting_at(last_round + 1);

        info!(
            context_id = %context.context_id(),
            min_clients = config.min_clients_per_round,
            model_version = pipeline.current().version,
            next_round = last_round + 1,
            "Federation server ready"
        );

        Ok(Self {
            config,
            context,
            registry: ClientRegistry::new(),
            rounds,
            pipeline,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<dyn CipherContext> {
        &self.context
    }

    pub fn pipeline(&self) -> &TrainingPipeline {
        &self.pipeline
    }

    pub fn rounds(&self) -> &RoundManager {
        &self.rounds
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn public_material(&self) -> PublicMaterial {
        self.context.public_material()
    }

    pub fn register(&self, client_id: &str, data_size: usize) -> FederatedResult<RegistrationReceipt> {
        let (record, newly_registered) = self.registry.register(client_id, data_size)?;
        if newly_registered {
            info!(client_id = %record.client_id, data_size, "Client registered");
        } else {
            debug!(client_id = %record.client_id, "Client re-registered");
        }

        Ok(RegistrationReceipt {
            client_id: record.client_id,
            newly_registered,
            public_material: self.context.public_material(),
        })
    }

    /// Current model plus the round clients should train for.
    pub fn global_model(&self) -> ModelSnapshot {
        let model = self.pipeline.current();
        model.snapshot(self.rounds.current_round_id())
    }

    /// Open a training round at the configured learning rate.
    pub fn start_round(&self) -> FederatedResult<TrainingRound> {
        self.start_round_with(self.config.learning_rate)
    }

    pub fn start_round_with(&self, learning_rate: f64) -> FederatedResult<TrainingRound> {
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(FederatedError::InvalidParameter(format!(
                "learning_rate must be positive (got {})",
                learning_rate
            )));
        }
        let round = self.rounds.open_round(learning_rate)?;
        self.registry.mark_all_training();
        Ok(round)
    }

    /// Validate and record an update. The submission that reaches quorum
    /// aggregates, decrypts the aggregate and installs the next model.
    pub fn submit_update(&self, update: EncryptedUpdate) -> FederatedResult<SubmissionOutcome> {
        if !self.registry.contains(&update.client_id) {
            return Err(FederatedError::UnknownClient(update.client_id));
        }
        self.registry.touch(&update.client_id);
        self.validate_update(&update)?;

        let client_id = update.client_id.clone();
        let model_version = update.model_version;

        let outcome = self.rounds.submit(update, |round, updates| {
            let aggregate = Aggregator::new(self.context.as_evaluator()).aggregate(updates)?;
            let current = self.pipeline.current();
            let next = self.pipeline.apply_aggregate(
                self.context.as_ref(),
                &current,
                &aggregate,
                round.learning_rate,
            )?;
            let installed = self.pipeline.commit(next)?;
            Ok(RoundCommit {
                aggregate,
                model_version: installed.version,
            })
        });

        match &outcome {
            Ok(outcome) => {
                self.registry.record_submission(&client_id, model_version);
                if matches!(outcome, SubmissionOutcome::Committed { .. }) {
                    self.registry.mark_all_idle();
                    self.pipeline.flush();
                }
            }
            Err(FederatedError::RoundFailed { .. }) => self.registry.mark_all_idle(),
            Err(e) => debug!(client_id = %client_id, "Update rejected: {}", e),
        }
        outcome
    }

    /// Reject anything that would make the round's aggregation fail, so one
    /// bad update never costs the other participants their round.
    fn validate_update(&self, update: &EncryptedUpdate) -> FederatedResult<()> {
        let max_level = self.context.params().max_level();
        for ct in [&update.weight_gradients, &update.bias_gradient] {
            self.context.validate(ct)?;
            if ct.level() + AGGREGATION_DEPTH > max_level {
                return Err(CryptoError::DepthExhausted { max_level }.into());
            }
        }

        let model = self.pipeline.current();
        let features = model.feature_names();
        if update.feature_names != features {
            return Err(FederatedError::InvalidParameter(format!(
                "update features {:?} do not match model features {:?}",
                update.feature_names, features
            )));
        }
        if update.weight_gradients.len() != features.len() {
            return Err(CryptoError::ShapeMismatch {
                lhs: features.len(),
                rhs: update.weight_gradients.len(),
            }
            .into());
        }
        if update.bias_gradient.len() != 1 {
            return Err(CryptoError::ShapeMismatch {
                lhs: 1,
                rhs: update.bias_gradient.len(),
            }
            .into());
        }
        Ok(())
    }

    pub fn fail_round(&self, round_id: u64, reason: &str) -> FederatedResult<TrainingRound> {
        let round = self.rounds.fail_round(round_id, reason)?;
        self.registry.mark_all_idle();
        Ok(round)
    }

    /// Fail the active round if it is past its deadline.
    pub fn expire_overdue_round(&self) -> Option<TrainingRound> {
        let expired = self.rounds.expire_overdue()?;
        self.registry.mark_all_idle();
        warn!(round_id = expired.round_id, "Expired overdue round");
        Some(expired)
    }

    pub async fn wait_for_round(&self, round_id: u64) -> Option<RoundStatus> {
        self.rounds.wait_for_terminal(round_id).await
    }

    pub fn status(&self) -> FederationStatus {
        let current = self.rounds.current();
        let round_status = current
            .as_ref()
            .map(|r| r.status)
            .or_else(|| self.rounds.last_closed().map(|r| r.status));

        FederationStatus {
            active_clients: self.registry.active_count(self.config.activity_window()),
            total_clients: self.registry.len(),
            current_round: current.map(|r| r.round_id),
            round_status,
            total_rounds: self.rounds.total_rounds(),
            model_version: self.pipeline.current().version,
        }
    }

    pub fn snapshot(&self) -> FederationSnapshot {
        FederationSnapshot {
            status: self.status(),
            clients: self.registry.list(),
            rounds: self.rounds.history(),
            models: self.pipeline.history(),
        }
    }
}
