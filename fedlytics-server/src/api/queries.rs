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

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use fedlytics_coordinator::{AnalyticsQuery, AnalyticsResult, QueryStatus, QueryType};
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitQueryRequest {
    pub query_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitQueryResponse {
    pub query_id: String,
    pub status: QueryStatus,
}

/// POST /queries - Submit an analytics query for background processing
pub async fn submit_query(
    State(state): State<AppState>,
    Json(req): Json<SubmitQueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let query_type: QueryType = req.query_type.parse()?;
    let query_id = state
        .coordinator
        .submit_analytics_query(query_type, req.parameters);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitQueryResponse {
            query_id,
            status: QueryStatus::Pending,
        }),
    ))
}

/// GET /queries
pub async fn list_queries(State(state): State<AppState>) -> Json<Vec<AnalyticsQuery>> {
    Json(state.coordinator.list_queries())
}

/// GET /queries/:id
pub async fn get_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Result<Json<AnalyticsQuery>, ApiError> {
    state
        .coordinator
        .get_query(&query_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Query {} not found", query_id)))
}

/// GET /queries/:id/result
///
/// 404 for unknown queries, 409 while the query has no result (still
/// running, or failed).
pub async fn get_query_result(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Result<Json<AnalyticsResult>, ApiError> {
    let query = state
        .coordinator
        .get_query(&query_id)
        .ok_or_else(|| ApiError::NotFound(format!("Query {} not found", query_id)))?;

    match state.coordinator.get_query_result(&query_id) {
        Some(result) => Ok(Json(result)),
        None => Err(ApiError::Conflict(match query.error {
            Some(error) => format!("Query {} failed: {}", query_id, error),
            None => format!("Query {} has no result yet", query_id),
        })),
    }
}
