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

//! Client-facing federation endpoints: registration, model download,
//! encrypted update upload, round control and status.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use fedlytics_coordinator::{EncryptedUpdate, FederationStatus, UpdateReceipt};
use fedlytics_core::{Ciphertext, ModelSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{ApiError, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_id: String,
    /// Declared number of local records
    #[serde(default)]
    pub data_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// `registered` or `already_registered`
    pub status: String,
    pub client_id: String,
    /// Base64 of the bincode-encoded public cipher material
    pub fhe_public_key: String,
}

/// Ciphertext payload of an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub feature_names: Vec<String>,
    pub weight_gradients: Ciphertext,
    pub bias_gradient: Ciphertext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub client_id: String,
    pub round_id: u64,
    pub model_version: u64,
    pub encrypted_update: EncryptedPayload,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl From<EncryptedUpdate> for UpdateRequest {
    fn from(update: EncryptedUpdate) -> Self {
        Self {
            client_id: update.client_id,
            round_id: update.round_id,
            model_version: update.model_version,
            encrypted_update: EncryptedPayload {
                feature_names: update.feature_names,
                weight_gradients: update.weight_gradients,
                bias_gradient: update.bias_gradient,
            },
            submitted_at: Some(update.submitted_at),
        }
    }
}

impl From<UpdateRequest> for EncryptedUpdate {
    fn from(req: UpdateRequest) -> Self {
        Self {
            client_id: req.client_id,
            round_id: req.round_id,
            model_version: req.model_version,
            feature_names: req.encrypted_update.feature_names,
            weight_gradients: req.encrypted_update.weight_gradients,
            bias_gradient: req.encrypted_update.bias_gradient,
            submitted_at: req.submitted_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub model: ModelSnapshot,
    /// Round clients should train for, if one is active
    pub round_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRoundResponse {
    pub status: String,
    pub round_id: u64,
    pub deadline: DateTime<Utc>,
    pub learning_rate: f64,
}

/// POST /register - Register a client and hand out public cipher material
pub async fn register_client(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let receipt = state.federation().register(&req.client_id, req.data_size)?;
    let key_bytes = receipt
        .public_material
        .to_bytes()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(RegisterResponse {
        status: if receipt.newly_registered {
            "registered".to_string()
        } else {
            "already_registered".to_string()
        },
        client_id: receipt.client_id,
        fhe_public_key: STANDARD.encode(key_bytes),
    }))
}

/// POST /update - Accept an encrypted gradient for the active round
///
/// Rejected updates (stale, closed, duplicate, unknown client) answer 409
/// with a receipt body so clients can tell a drop from a failure.
pub async fn submit_update(
    State(state): State<AppState>,
    Json(req): Json<UpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let update = EncryptedUpdate::from(req);
    let client_id = update.client_id.clone();

    // The quorum submission aggregates, decrypts and snapshots the model
    let federation = state.federation().clone();
    let result = tokio::task::spawn_blocking(move || federation.submit_update(update))
        .await
        .map_err(|e| ApiError::Internal(format!("update task failed: {}", e)))?;

    match result {
        Ok(outcome) => Ok((StatusCode::OK, Json(UpdateReceipt::Accepted { outcome }))),
        Err(e) if e.is_rejection() => {
            warn!(client_id = %client_id, "Update rejected: {}", e);
            Ok((
                StatusCode::CONFLICT,
                Json(UpdateReceipt::Rejected {
                    reason: e.to_string(),
                }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /model - Current global model
pub async fn get_model(State(state): State<AppState>) -> Json<ModelResponse> {
    let model = state.federation().global_model();
    let round_id = model.round_id;
    Json(ModelResponse { model, round_id })
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<FederationStatus> {
    Json(state.federation().status())
}

/// POST /start_round - Open a round at the configured learning rate
pub async fn start_round(
    State(state): State<AppState>,
) -> Result<Json<StartRoundResponse>, ApiError> {
    let round = state.federation().start_round()?;
    info!(round_id = round.round_id, "Round opened over HTTP");

    Ok(Json(StartRoundResponse {
        status: "started".to_string(),
        round_id: round.round_id,
        deadline: round.deadline,
        learning_rate: round.learning_rate,
    }))
}
