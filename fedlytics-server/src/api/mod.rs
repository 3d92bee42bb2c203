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

//! HTTP/JSON API handlers

pub mod federation;
pub mod health;
pub mod queries;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fedlytics_coordinator::{AnalyticsCoordinator, FederatedError, FederationServer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use federation::{
    get_model, get_status, register_client, start_round, submit_update, ModelResponse,
    RegisterRequest, RegisterResponse, UpdateRequest,
};
pub use health::health_check;
pub use queries::{get_query, get_query_result, list_queries, submit_query, SubmitQueryRequest};

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request is well-formed but conflicts with round state
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<FederatedError> for ApiError {
    fn from(e: FederatedError) -> Self {
        match &e {
            FederatedError::UnknownClient(_) => ApiError::NotFound(e.to_string()),
            FederatedError::Registration(_)
            | FederatedError::InvalidParameter(_)
            | FederatedError::UnsupportedQuery(_)
            | FederatedError::Crypto(_) => ApiError::BadRequest(e.to_string()),
            FederatedError::Storage(_)
            | FederatedError::Serialization(_)
            | FederatedError::Transport(_) => {
                tracing::error!("Request failed: {}", e);
                ApiError::Internal(e.to_string())
            }
            _ => ApiError::Conflict(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: AnalyticsCoordinator,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(coordinator: AnalyticsCoordinator) -> Self {
        Self {
            coordinator,
            started_at: Instant::now(),
        }
    }

    pub fn federation(&self) -> &Arc<FederationServer> {
        self.coordinator.federation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (FederatedError::UnknownClient("x".into()), StatusCode::NOT_FOUND),
            (FederatedError::InvalidParameter("x".into()), StatusCode::BAD_REQUEST),
            (FederatedError::RoundAlreadyActive(4), StatusCode::CONFLICT),
            (FederatedError::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }
}
