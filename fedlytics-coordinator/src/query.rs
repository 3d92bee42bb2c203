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

//! Analytics queries and their results.

use chrono::{DateTime, Utc};
use fedlytics_core::EmissionScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FederatedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    TrainEsgModel,
    ComputeEmissionsAggregate,
    PredictCompanyEmissions,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::TrainEsgModel => "train_esg_model",
            QueryType::ComputeEmissionsAggregate => "compute_emissions_aggregate",
            QueryType::PredictCompanyEmissions => "predict_company_emissions",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = FederatedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train_esg_model" => Ok(QueryType::TrainEsgModel),
            "compute_emissions_aggregate" => Ok(QueryType::ComputeEmissionsAggregate),
            "predict_company_emissions" => Ok(QueryType::PredictCompanyEmissions),
            other => Err(FederatedError::UnsupportedQuery(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Completed | QueryStatus::Failed)
    }

    /// Pending -> Processing -> Completed | Failed. A pending query may also
    /// fail directly.
    pub fn can_transition_to(self, next: QueryStatus) -> bool {
        use QueryStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Pending, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub query_id: String,
    pub query_type: QueryType,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: QueryStatus,
    /// Set when the query failed
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsResult {
    pub query_id: String,
    pub result_type: String,
    /// Serialized ciphertexts the result was decrypted from
    pub encrypted_result: Option<serde_json::Value>,
    pub decrypted_result: Option<serde_json::Value>,
    pub participating_clients: usize,
    /// Seconds from processing start to completion
    pub computation_time: f64,
    pub completed_at: DateTime<Utc>,
}

/// Parameters for `train_esg_model`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainParams {
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default)]
    pub learning_rate: Option<f64>,
}

fn default_rounds() -> u32 {
    1
}

/// Parameters for `compute_emissions_aggregate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateParams {
    #[serde(default = "default_scope")]
    pub scope: EmissionScope,
}

fn default_scope() -> EmissionScope {
    EmissionScope::Total
}

/// Parameters for `predict_company_emissions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictParams {
    #[serde(default)]
    pub company_id: Option<String>,
    pub features: BTreeMap<String, f64>,
}

/// Parse query parameters; `null` means "all defaults".
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
) -> Result<T, FederatedError> {
    let value = if value.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value).map_err(|e| FederatedError::InvalidParameter(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_type_parsing() {
        assert_eq!(
            "train_esg_model".parse::<QueryType>().unwrap(),
            QueryType::TrainEsgModel
        );
        assert!(matches!(
            "delete_everything".parse::<QueryType>(),
            Err(FederatedError::UnsupportedQuery(_))
        ));
        assert_eq!(
            serde_json::to_value(QueryType::PredictCompanyEmissions).unwrap(),
            json!("predict_company_emissions")
        );
    }

    #[test]
    fn test_status_transitions() {
        assert!(QueryStatus::Pending.can_transition_to(QueryStatus::Processing));
        assert!(QueryStatus::Processing.can_transition_to(QueryStatus::Completed));
        assert!(!QueryStatus::Completed.can_transition_to(QueryStatus::Processing));
        assert!(!QueryStatus::Failed.can_transition_to(QueryStatus::Completed));
    }

    #[test]
    fn test_param_defaults() {
        let train: TrainParams = parse_params(&serde_json::Value::Null).unwrap();
        assert_eq!(train.rounds, 1);
        assert!(train.learning_rate.is_none());

        let agg: AggregateParams = parse_params(&json!({"scope": "scope2"})).unwrap();
        assert_eq!(agg.scope, EmissionScope::Scope2);

        let bad: Result<PredictParams, _> = parse_params(&json!({}));
        assert!(matches!(bad, Err(FederatedError::InvalidParameter(_))));
    }
}
