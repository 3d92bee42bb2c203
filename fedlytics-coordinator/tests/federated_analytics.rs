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

//! End-to-end tests for query processing over in-process client agents

use fedlytics_coordinator::{
    AnalyticsCoordinator, CoordinatorConfig, FederationServer, QueryStatus, QueryType,
    RoundStatus,
};
use fedlytics_core::{CipherBackend, CipherConfig, ClientDataset, EmissionRecord};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

fn coordinator(config: CoordinatorConfig) -> AnalyticsCoordinator {
    let context = CipherBackend::MockCkks
        .create_context(&CipherConfig::default())
        .unwrap();
    AnalyticsCoordinator::new(Arc::new(FederationServer::new(config, context).unwrap()))
}

fn company(id: &str, scope1: f64, scope2: f64, scope3: f64) -> ClientDataset {
    ClientDataset::new(vec![EmissionRecord::new(id, scope1, scope2, scope3)
        .with_feature("revenue", scope3 / 25.0)
        .with_feature("energy_consumption", scope2 / 100.0)
        .with_feature("employees", 1.0)
        .with_feature("renewable_share", 0.3)])
}

async fn with_three_banks(config: CoordinatorConfig) -> AnalyticsCoordinator {
    let coordinator = coordinator(config);
    coordinator
        .register_client("bank_a", company("acme", 100.0, 50.0, 25.0))
        .await
        .unwrap();
    coordinator
        .register_client("bank_b", company("globex", 200.0, 100.0, 50.0))
        .await
        .unwrap();
    coordinator
        .register_client("bank_c", company("initech", 150.0, 75.0, 40.0))
        .await
        .unwrap();
    coordinator
}

/// Three clients, one record each: totals 175, 350 and 265
#[tokio::test]
async fn test_emissions_aggregate_scenario() {
    let coordinator = with_three_banks(CoordinatorConfig::default()).await;

    let query_id =
        coordinator.submit_analytics_query(QueryType::ComputeEmissionsAggregate, json!({}));
    assert_eq!(
        coordinator.wait_for_query(&query_id, WAIT).await,
        Some(QueryStatus::Completed)
    );

    let result = coordinator.get_query_result(&query_id).unwrap();
    assert_eq!(result.result_type, "emissions_aggregate");
    assert_eq!(result.participating_clients, 3);

    let decrypted = result.decrypted_result.unwrap();
    let total = decrypted["total_emissions"].as_f64().unwrap();
    let mean = decrypted["mean_emissions"].as_f64().unwrap();
    assert!((total - 790.0).abs() < 1e-3, "total was {}", total);
    assert!((mean - 263.333).abs() < 1e-2, "mean was {}", mean);
    assert_eq!(decrypted["record_count"], 3);
    assert!(result.encrypted_result.is_some());
}

#[tokio::test]
async fn test_scoped_aggregate() {
    let coordinator = with_three_banks(CoordinatorConfig::default()).await;
    let query_id = coordinator
        .submit_analytics_query(QueryType::ComputeEmissionsAggregate, json!({"scope": "scope1"}));
    coordinator.wait_for_query(&query_id, WAIT).await;

    let decrypted = coordinator
        .get_query_result(&query_id)
        .unwrap()
        .decrypted_result
        .unwrap();
    assert!((decrypted["total_emissions"].as_f64().unwrap() - 450.0).abs() < 1e-3);
    assert_eq!(decrypted["scope"], "scope1");
}

#[tokio::test]
async fn test_training_query_advances_model() {
    let coordinator = with_three_banks(CoordinatorConfig::default()).await;

    let query_id = coordinator.submit_analytics_query(QueryType::TrainEsgModel, json!({"rounds": 2}));
    assert_eq!(
        coordinator.wait_for_query(&query_id, WAIT).await,
        Some(QueryStatus::Completed)
    );

    let result = coordinator.get_query_result(&query_id).unwrap();
    let decrypted = result.decrypted_result.unwrap();
    assert_eq!(decrypted["model_version"], 3);
    assert_eq!(decrypted["rounds_completed"], 2);
    // The round commits as soon as the quorum of 2 is reached
    assert!((2..=3).contains(&result.participating_clients));

    let federation = coordinator.federation();
    let model = federation.pipeline().current();
    assert_eq!(model.version, 3);
    assert!(model.weight_vector().iter().any(|w| *w != 0.0));

    let rounds = federation.rounds().history();
    assert_eq!(rounds.len(), 2);
    assert!(rounds.iter().all(|r| r.status == RoundStatus::Completed));
    assert!(rounds.iter().all(|r| r.aggregated_update.is_some()));
}

#[tokio::test]
async fn test_prediction_matches_plaintext_model() {
    let coordinator = with_three_banks(CoordinatorConfig::default()).await;
    assert!(coordinator.run_federated_learning_round().await.unwrap());

    let features = json!({"revenue": 2.0, "energy_consumption": 0.8, "employees": 1.0});
    let query_id = coordinator.submit_analytics_query(
        QueryType::PredictCompanyEmissions,
        json!({"company_id": "newco", "features": features}),
    );
    assert_eq!(
        coordinator.wait_for_query(&query_id, WAIT).await,
        Some(QueryStatus::Completed)
    );

    let decrypted = coordinator
        .get_query_result(&query_id)
        .unwrap()
        .decrypted_result
        .unwrap();
    let predicted = decrypted["predicted_emissions"].as_f64().unwrap();

    let plain: BTreeMap<String, f64> = serde_json::from_value(features).unwrap();
    let expected = coordinator.federation().pipeline().current().predict(&plain);
    assert!((predicted - expected).abs() < 1e-4);
    assert_eq!(decrypted["company_id"], "newco");
    assert_eq!(decrypted["model_version"], 2);
}

#[tokio::test]
async fn test_quorum_not_reached_fails_query() {
    let config = CoordinatorConfig {
        min_clients_per_round: 2,
        round_timeout_secs: 1,
        ..CoordinatorConfig::default()
    };
    let coordinator = coordinator(config);
    coordinator
        .register_client("lonely_bank", company("acme", 100.0, 50.0, 25.0))
        .await
        .unwrap();

    let train = coordinator.submit_analytics_query(QueryType::TrainEsgModel, json!({}));
    let aggregate =
        coordinator.submit_analytics_query(QueryType::ComputeEmissionsAggregate, json!(null));

    assert_eq!(
        coordinator.wait_for_query(&train, WAIT).await,
        Some(QueryStatus::Failed)
    );
    assert_eq!(
        coordinator.wait_for_query(&aggregate, WAIT).await,
        Some(QueryStatus::Failed)
    );

    let failed = coordinator.get_query(&train).unwrap();
    assert!(failed.error.unwrap().contains("Quorum not reached"));
    assert!(coordinator.get_query_result(&train).is_none());

    let federation = coordinator.federation();
    assert_eq!(federation.pipeline().current().version, 1);
    let round = federation.rounds().round(1).unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    assert!(round.model_version.is_none());
}

#[tokio::test]
async fn test_invalid_parameters_fail_query() {
    let coordinator = with_three_banks(CoordinatorConfig::default()).await;

    let zero_rounds = coordinator.submit_analytics_query(QueryType::TrainEsgModel, json!({"rounds": 0}));
    let unknown_feature = coordinator.submit_analytics_query(
        QueryType::PredictCompanyEmissions,
        json!({"features": {"shoe_size": 42.0}}),
    );

    for id in [&zero_rounds, &unknown_feature] {
        assert_eq!(
            coordinator.wait_for_query(id, WAIT).await,
            Some(QueryStatus::Failed)
        );
    }
    assert_eq!(coordinator.federation().rounds().total_rounds(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_training_queries_never_overlap() {
    let coordinator = with_three_banks(CoordinatorConfig::default()).await;

    let ids: Vec<String> = (0..4)
        .map(|_| coordinator.submit_analytics_query(QueryType::TrainEsgModel, json!({"rounds": 2})))
        .collect();
    let side = coordinator.submit_analytics_query(QueryType::ComputeEmissionsAggregate, json!({}));

    for id in ids.iter().chain(std::iter::once(&side)) {
        assert_eq!(
            coordinator.wait_for_query(id, WAIT).await,
            Some(QueryStatus::Completed)
        );
    }

    let rounds = coordinator.federation().rounds().history();
    assert_eq!(rounds.len(), 8);
    for pair in rounds.windows(2) {
        let end = pair[0].end_time.unwrap();
        assert!(end <= pair[1].start_time, "round {} overlaps round {}", pair[0].round_id, pair[1].round_id);
    }
    assert_eq!(coordinator.federation().pipeline().current().version, 9);
}

#[tokio::test]
async fn test_unknown_query_lookups() {
    let coordinator = coordinator(CoordinatorConfig::default());
    assert!(coordinator.get_query_status("nope").is_none());
    assert!(coordinator.get_query_result("nope").is_none());
    assert!(coordinator.wait_for_query("nope", WAIT).await.is_none());
    assert!(coordinator.list_queries().is_empty());
}
