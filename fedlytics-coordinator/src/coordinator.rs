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

//! Analytics Coordinator
//!
//! Accepts analytics queries, runs each one on its own task and records the
//! result. Training queries go through a single training lane so that
//! coordinator-driven rounds never overlap; statistic and prediction queries
//! run concurrently with training and with each other.
//!
//! ```text
//!  submit_analytics_query ──► tokio::spawn ──► process_query
//!                                                 │
//!          ┌──────────────────────────────────────┼─────────────────────────┐
//!          ▼                                      ▼                         ▼
//!   train_esg_model                  compute_emissions_aggregate   predict_company_emissions
//!   (training lane, N rounds)        (agent statistics, quorum)    (encrypted dot product)
//! ```

use chrono::Utc;
use dashmap::DashMap;
use fedlytics_core::{Ciphertext, CipherContext, ClientDataset};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::client::{ClientAgent, ClientAgentHandle};
use crate::error::{FederatedError, FederatedResult};
use crate::federation::FederationServer;
use crate::query::{
    parse_params, AggregateParams, AnalyticsQuery, AnalyticsResult, PredictParams, QueryStatus,
    QueryType, TrainParams,
};
use crate::round::{RoundStatus, TrainingRound};
use crate::transport::{CoordinatorTransport, LocalTransport};

struct QueryEntry {
    query: AnalyticsQuery,
    status: watch::Sender<QueryStatus>,
}

struct QueryOutput {
    result_type: &'static str,
    encrypted_result: Option<Value>,
    decrypted_result: Value,
    participating_clients: usize,
}

struct CoordinatorInner {
    federation: Arc<FederationServer>,
    transport: Arc<dyn CoordinatorTransport>,
    agents: DashMap<String, ClientAgentHandle>,
    queries: DashMap<String, QueryEntry>,
    results: DashMap<String, AnalyticsResult>,
    /// Held for the full duration of coordinator-driven training
    training_lane: AsyncMutex<()>,
}

#[derive(Clone)]
pub struct AnalyticsCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl AnalyticsCoordinator {
    pub fn new(federation: Arc<FederationServer>) -> Self {
        let transport: Arc<dyn CoordinatorTransport> =
            Arc::new(LocalTransport::new(federation.clone()));
        Self {
            inner: Arc::new(CoordinatorInner {
                federation,
                transport,
                agents: DashMap::new(),
                queries: DashMap::new(),
                results: DashMap::new(),
                training_lane: AsyncMutex::new(()),
            }),
        }
    }

    pub fn federation(&self) -> &Arc<FederationServer> {
        &self.inner.federation
    }

    /// Spawn an in-process client agent that owns `dataset` and register it.
    /// Re-registering an id replaces its agent.
    pub async fn register_client(&self, client_id: &str, dataset: ClientDataset) -> FederatedResult<bool> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(FederatedError::Registration(
                "client_id must not be empty".to_string(),
            ));
        }

        let handle = ClientAgent::new(client_id, dataset, self.inner.transport.clone()).spawn();
        let newly_registered = handle.register().await?;
        self.inner.agents.insert(client_id.to_string(), handle);
        Ok(newly_registered)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Record a query and start processing it in the background.
    pub fn submit_analytics_query(&self, query_type: QueryType, parameters: Value) -> String {
        let query_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let (status, _) = watch::channel(QueryStatus::Pending);

        self.inner.queries.insert(
            query_id.clone(),
            QueryEntry {
                query: AnalyticsQuery {
                    query_id: query_id.clone(),
                    query_type,
                    parameters: parameters.clone(),
                    created_at: now,
                    updated_at: now,
                    status: QueryStatus::Pending,
                    error: None,
                },
                status,
            },
        );
        info!(query_id = %query_id, query_type = %query_type, "Query submitted");

        let coordinator = self.clone();
        let id = query_id.clone();
        tokio::spawn(async move {
            coordinator.process_query(id, query_type, parameters).await;
        });

        query_id
    }

    pub fn get_query(&self, query_id: &str) -> Option<AnalyticsQuery> {
        self.inner.queries.get(query_id).map(|e| e.query.clone())
    }

    pub fn get_query_status(&self, query_id: &str) -> Option<QueryStatus> {
        self.inner.queries.get(query_id).map(|e| e.query.status)
    }

    pub fn get_query_result(&self, query_id: &str) -> Option<AnalyticsResult> {
        self.inner.results.get(query_id).map(|r| r.clone())
    }

    /// Queries ordered by submission time.
    pub fn list_queries(&self) -> Vec<AnalyticsQuery> {
        let mut queries: Vec<_> = self.inner.queries.iter().map(|e| e.query.clone()).collect();
        queries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        queries
    }

    /// Wait until the query completes or fails, or `timeout` passes. Returns
    /// the status at that point, or `None` for an unknown id.
    pub async fn wait_for_query(&self, query_id: &str, timeout: Duration) -> Option<QueryStatus> {
        let mut rx = self.inner.queries.get(query_id)?.status.subscribe();

        let terminal = async {
            loop {
                let status = *rx.borrow_and_update();
                if status.is_terminal() || rx.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, terminal).await;

        self.get_query_status(query_id)
    }

    /// Run one round with every in-process agent. Returns whether the round
    /// completed; a round that misses its deadline is failed, never
    /// committed below quorum.
    pub async fn run_federated_learning_round(&self) -> FederatedResult<bool> {
        let _lane = self.inner.training_lane.lock().await;
        let learning_rate = self.federation().config().learning_rate;
        let round = self.run_round(learning_rate).await?;
        Ok(round.status == RoundStatus::Completed)
    }

    async fn run_round(&self, learning_rate: f64) -> FederatedResult<TrainingRound> {
        let federation = self.federation();
        let opened = federation.start_round_with(learning_rate)?;
        let round_id = opened.round_id;

        let handles = self.agent_handles();
        if handles.is_empty() {
            info!(round_id, "No in-process agents; waiting for remote clients");
        }

        let replies = join_all(handles.iter().map(|h| h.participate())).await;
        for (handle, reply) in handles.iter().zip(replies) {
            match reply {
                Ok(true) => debug!(round_id, client_id = %handle.client_id(), "Agent contributed"),
                Ok(false) => debug!(round_id, client_id = %handle.client_id(), "Agent update dropped"),
                Err(e) => warn!(round_id, client_id = %handle.client_id(), "Agent failed: {}", e),
            }
        }

        let remaining = (opened.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if tokio::time::timeout(remaining, federation.wait_for_round(round_id))
            .await
            .is_err()
        {
            match federation.fail_round(round_id, "deadline expired before quorum") {
                Ok(_) | Err(FederatedError::RoundClosed(_)) => {}
                Err(e) => return Err(e),
            }
        }

        federation.rounds().round(round_id).ok_or(FederatedError::RoundFailed {
            round_id,
            reason: "round no longer in history".to_string(),
        })
    }

    fn agent_handles(&self) -> Vec<ClientAgentHandle> {
        self.inner
            .agents
            .iter()
            .filter(|e| e.value().is_alive())
            .map(|e| e.value().clone())
            .collect()
    }

    async fn process_query(&self, query_id: String, query_type: QueryType, parameters: Value) {
        self.set_status(&query_id, QueryStatus::Processing, None);
        let started = Instant::now();

        let outcome = match query_type {
            QueryType::TrainEsgModel => self.train_esg_model(&parameters).await,
            QueryType::ComputeEmissionsAggregate => self.compute_emissions_aggregate(&parameters).await,
            QueryType::PredictCompanyEmissions => self.predict_company_emissions(&parameters),
        };

        match outcome {
            Ok(output) => {
                let computation_time = started.elapsed().as_secs_f64();
                self.inner.results.insert(
                    query_id.clone(),
                    AnalyticsResult {
                        query_id: query_id.clone(),
                        result_type: output.result_type.to_string(),
                        encrypted_result: output.encrypted_result,
                        decrypted_result: Some(output.decrypted_result),
                        participating_clients: output.participating_clients,
                        computation_time,
                        completed_at: Utc::now(),
                    },
                );
                self.set_status(&query_id, QueryStatus::Completed, None);
                info!(
                    query_id = %query_id,
                    query_type = %query_type,
                    participants = output.participating_clients,
                    "Query completed in {:.3}s",
                    computation_time
                );
            }
            Err(e) => {
                error!(query_id = %query_id, query_type = %query_type, "Query failed: {}", e);
                self.set_status(&query_id, QueryStatus::Failed, Some(e.to_string()));
            }
        }
    }

    fn set_status(&self, query_id: &str, next: QueryStatus, error: Option<String>) {
        let Some(mut entry) = self.inner.queries.get_mut(query_id) else {
            return;
        };
        if !entry.query.status.can_transition_to(next) {
            warn!(
                query_id,
                "Ignoring query transition {:?} -> {:?}", entry.query.status, next
            );
            return;
        }
        entry.query.status = next;
        entry.query.updated_at = Utc::now();
        entry.query.error = error;
        entry.status.send_replace(next);
    }

    async fn train_esg_model(&self, parameters: &Value) -> FederatedResult<QueryOutput> {
        let params: TrainParams = parse_params(parameters)?;
        let federation = self.federation();
        let config = federation.config();
        if params.rounds == 0 || params.rounds > config.max_rounds_per_query {
            return Err(FederatedError::InvalidParameter(format!(
                "rounds must be between 1 and {} (got {})",
                config.max_rounds_per_query, params.rounds
            )));
        }
        let learning_rate = params.learning_rate.unwrap_or(config.learning_rate);

        let _lane = self.inner.training_lane.lock().await;
        let mut completed = Vec::with_capacity(params.rounds as usize);
        for _ in 0..params.rounds {
            let round = self.run_round(learning_rate).await?;
            if round.status != RoundStatus::Completed {
                let received = round.participating_clients.len();
                let required = config.min_clients_per_round;
                return Err(if received < required {
                    FederatedError::QuorumNotReached { received, required }
                } else {
                    FederatedError::RoundFailed {
                        round_id: round.round_id,
                        reason: round.failure_reason.unwrap_or_default(),
                    }
                });
            }
            completed.push(round);
        }

        let last = completed.last().ok_or(FederatedError::AggregationEmpty)?;
        let model = federation.pipeline().current();

        Ok(QueryOutput {
            result_type: "model_training",
            encrypted_result: Some(serde_json::to_value(&last.aggregated_update)?),
            decrypted_result: json!({
                "model_version": model.version,
                "weights": model.weights,
                "bias": model.bias,
                "rounds_completed": completed.len(),
                "round_ids": completed.iter().map(|r| r.round_id).collect::<Vec<_>>(),
            }),
            participating_clients: last.participating_clients.len(),
        })
    }

    async fn compute_emissions_aggregate(&self, parameters: &Value) -> FederatedResult<QueryOutput> {
        let params: AggregateParams = parse_params(parameters)?;
        let federation = self.federation();

        let handles = self.agent_handles();
        let replies = join_all(handles.iter().map(|h| h.compute_statistic(params.scope))).await;
        let mut statistics = Vec::with_capacity(replies.len());
        for (handle, reply) in handles.iter().zip(replies) {
            match reply {
                Ok(stat) => statistics.push(stat),
                Err(e) => warn!(client_id = %handle.client_id(), "Statistic unavailable: {}", e),
            }
        }

        let required = federation.config().min_clients_per_round;
        if statistics.len() < required {
            return Err(FederatedError::QuorumNotReached {
                received: statistics.len(),
                required,
            });
        }

        let context = federation.context();
        let aggregate = Aggregator::new(context.as_evaluator()).aggregate_statistics(&statistics)?;
        let total = decrypt_scalar(context.as_ref(), &aggregate.emissions_sum)?;
        let records = decrypt_scalar(context.as_ref(), &aggregate.record_count)?.round();
        let mean = if records > 0.0 { total / records } else { 0.0 };

        Ok(QueryOutput {
            result_type: "emissions_aggregate",
            encrypted_result: Some(serde_json::to_value(&aggregate)?),
            decrypted_result: json!({
                "scope": params.scope,
                "total_emissions": total,
                "mean_emissions": mean,
                "record_count": records as u64,
                "participating_clients": aggregate.contributors,
            }),
            participating_clients: aggregate.contributors,
        })
    }

    fn predict_company_emissions(&self, parameters: &Value) -> FederatedResult<QueryOutput> {
        let params: PredictParams = parse_params(parameters)?;
        let federation = self.federation();
        let model = federation.pipeline().current();

        if let Some(unknown) = params.features.keys().find(|k| !model.weights.contains_key(*k)) {
            return Err(FederatedError::InvalidParameter(format!(
                "unknown feature '{}'",
                unknown
            )));
        }
        let values: Vec<f64> = model
            .weights
            .keys()
            .map(|name| params.features.get(name).copied().unwrap_or(0.0))
            .collect();

        let context = federation.context();
        let encrypted_features = context.encrypt(&values)?;
        let prediction = federation
            .pipeline()
            .predict_encrypted(context.as_evaluator(), &encrypted_features)?;
        let predicted = decrypt_scalar(context.as_ref(), &prediction)?;

        let participating_clients = federation
            .rounds()
            .round(model.training_round)
            .map(|r| r.participating_clients.len())
            .unwrap_or(0);

        Ok(QueryOutput {
            result_type: "emissions_prediction",
            encrypted_result: Some(serde_json::to_value(&prediction)?),
            decrypted_result: json!({
                "company_id": params.company_id,
                "predicted_emissions": predicted,
                "model_version": model.version,
            }),
            participating_clients,
        })
    }
}

fn decrypt_scalar(context: &dyn CipherContext, value: &Ciphertext) -> FederatedResult<f64> {
    context
        .decrypt(value)?
        .first()
        .copied()
        .ok_or_else(|| FederatedError::Serialization("empty ciphertext".to_string()))
}
