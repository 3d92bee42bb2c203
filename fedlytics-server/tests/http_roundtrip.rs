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

//! Client agents talking to a live coordinator over HTTP

use fedlytics_coordinator::{ClientAgent, CoordinatorConfig, CoordinatorTransport, RoundStatus};
use fedlytics_core::{ClientDataset, RetryPolicy};
use fedlytics_server::api::AppState;
use fedlytics_server::config::ServerConfig;
use fedlytics_server::{build_coordinator, build_router, HttpTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Serve a fresh coordinator on an ephemeral port; returns its base URL.
async fn spawn_server(config: ServerConfig) -> (String, AppState) {
    let coordinator = build_coordinator(&config).unwrap();
    let state = AppState::new(coordinator);
    let app = build_router(state.clone(), false);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

fn config(min_clients: usize) -> ServerConfig {
    ServerConfig {
        coordinator: CoordinatorConfig {
            min_clients_per_round: min_clients,
            ..CoordinatorConfig::default()
        },
        ..ServerConfig::default()
    }
}

fn remote_agent(base_url: &str, id: &str, seed: u64) -> ClientAgent {
    let transport = Arc::new(HttpTransport::new(base_url).unwrap());
    ClientAgent::new(id, ClientDataset::synthetic(id, 4, seed), transport)
        .with_retry_policy(RetryPolicy::none())
}

#[tokio::test]
async fn test_remote_agents_complete_a_round() {
    let (base_url, state) = spawn_server(config(2)).await;
    let http = reqwest::Client::new();

    let mut agents: Vec<ClientAgent> = ["bank_a", "bank_b", "bank_c"]
        .iter()
        .enumerate()
        .map(|(i, id)| remote_agent(&base_url, id, i as u64))
        .collect();
    for agent in agents.iter_mut() {
        assert!(agent.register().await.unwrap());
    }
    // Registration is idempotent
    assert!(!agents[0].register().await.unwrap());

    let started: Value = http
        .post(format!("{}/start_round", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(started["status"], "started");
    assert_eq!(started["round_id"], 1);

    let again = http
        .post(format!("{}/start_round", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);

    // Snapshot taken while round 1 is open, submitted after it closes
    let late_snapshot = agents[2].download_global_model().await.unwrap();
    assert_eq!(late_snapshot.round_id, Some(1));

    assert!(agents[0].participate().await.unwrap());
    assert!(agents[1].participate().await.unwrap());

    let late_update = agents[2].compute_local_update(&late_snapshot).unwrap();
    assert!(!agents[2].submit_update(late_update).await.unwrap());
    // No active round left to join
    assert!(!agents[2].participate().await.unwrap());

    let transport = HttpTransport::new(&base_url).unwrap();
    let status = transport.status().await.unwrap();
    assert_eq!(status.total_clients, 3);
    assert_eq!(status.total_rounds, 1);
    assert_eq!(status.model_version, 2);
    assert_eq!(status.round_status, Some(RoundStatus::Completed));
    assert_eq!(status.current_round, None);

    let model = transport.download_global_model().await.unwrap();
    assert_eq!(model.version, 2);
    assert!(model.weights.values().any(|w| *w != 0.0));

    let round = state.federation().rounds().round(1).unwrap();
    assert_eq!(round.participating_clients.len(), 2);
    assert!(round.participating_clients.contains("bank_a"));
}

#[tokio::test]
async fn test_register_returns_public_key() {
    let (base_url, _state) = spawn_server(config(2)).await;
    let http = reqwest::Client::new();

    let response: Value = http
        .post(format!("{}/register", base_url))
        .json(&json!({"client_id": "bank_a", "data_size": 12}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["status"], "registered");
    assert_eq!(response["client_id"], "bank_a");
    assert!(!response["fhe_public_key"].as_str().unwrap().is_empty());

    let empty = http
        .post(format!("{}/register", base_url))
        .json(&json!({"client_id": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_without_round_is_rejected() {
    let (base_url, _state) = spawn_server(config(2)).await;
    let mut agent = remote_agent(&base_url, "bank_a", 1);
    agent.register().await.unwrap();

    // Nothing to train for until a round opens
    assert!(!agent.participate().await.unwrap());

    let transport = HttpTransport::new(&base_url).unwrap();
    let model = transport.download_global_model().await.unwrap();
    assert_eq!(model.version, 1);
    assert_eq!(model.round_id, None);
}

#[tokio::test]
async fn test_queries_over_http() {
    let (base_url, state) = spawn_server(config(2)).await;
    for (i, id) in ["bank_a", "bank_b", "bank_c"].iter().enumerate() {
        state
            .coordinator
            .register_client(id, ClientDataset::synthetic(id, 3, 10 + i as u64))
            .await
            .unwrap();
    }
    let http = reqwest::Client::new();

    let submitted = http
        .post(format!("{}/queries", base_url))
        .json(&json!({
            "query_type": "compute_emissions_aggregate",
            "parameters": {"scope": "scope2"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(submitted.status(), reqwest::StatusCode::ACCEPTED);
    let submitted: Value = submitted.json().await.unwrap();
    let query_id = submitted["query_id"].as_str().unwrap().to_string();

    state
        .coordinator
        .wait_for_query(&query_id, Duration::from_secs(30))
        .await;

    let query: Value = http
        .get(format!("{}/queries/{}", base_url, query_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(query["status"], "completed");

    let result: Value = http
        .get(format!("{}/queries/{}/result", base_url, query_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["result_type"], "emissions_aggregate");
    assert_eq!(result["participating_clients"], 3);
    assert_eq!(result["decrypted_result"]["record_count"], 9);

    let unsupported = http
        .post(format!("{}/queries", base_url))
        .json(&json!({"query_type": "export_raw_records"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unsupported.status(), reqwest::StatusCode::BAD_REQUEST);

    let missing = http
        .get(format!("{}/queries/does-not-exist/result", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let listed: Vec<Value> = http
        .get(format!("{}/queries", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let health: Value = http
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["registered_clients"], 3);
}
