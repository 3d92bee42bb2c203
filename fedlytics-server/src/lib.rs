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

//! Fedlytics server
//!
//! Hosts the federated analytics coordinator behind an HTTP/JSON API and
//! provides [`HttpTransport`] for client agents running in other processes.

pub mod api;
pub mod config;
pub mod http_transport;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use fedlytics_coordinator::{AnalyticsCoordinator, FederationServer};
use fedlytics_core::ClientDataset;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{
    get_model, get_query, get_query_result, get_status, health_check, list_queries,
    register_client, start_round, submit_query, submit_update, AppState,
};
use config::{ServerConfig, SimulationConfig};

pub use http_transport::HttpTransport;

const DEFAULT_LOG_FILTER: &str = "fedlytics_server=info,fedlytics_coordinator=info,tower_http=info";

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(log_json: bool) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    );

    if log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Create the cipher context, federation server and analytics coordinator.
pub fn build_coordinator(config: &ServerConfig) -> Result<AnalyticsCoordinator> {
    let context = config.cipher.backend.create_context(&config.cipher)?;
    let federation = FederationServer::new(config.coordinator.clone(), context)?;
    Ok(AnalyticsCoordinator::new(Arc::new(federation)))
}

pub fn build_router(state: AppState, enable_cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        // Federation protocol
        .route("/register", post(register_client))
        .route("/update", post(submit_update))
        .route("/model", get(get_model))
        .route("/status", get(get_status))
        .route("/start_round", post(start_round))
        // Analytics queries
        .route("/queries", get(list_queries).post(submit_query))
        .route("/queries/:id", get(get_query))
        .route("/queries/:id/result", get(get_query_result))
        .with_state(state);

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http())
}

/// Register in-process agents holding synthetic data.
pub async fn register_simulated_clients(
    coordinator: &AnalyticsCoordinator,
    simulation: &SimulationConfig,
) -> Result<()> {
    for i in 0..simulation.clients {
        let client_id = format!("sim-client-{:02}", i);
        let dataset = ClientDataset::synthetic(
            &client_id,
            simulation.records_per_client,
            simulation.seed.wrapping_add(i as u64),
        );
        coordinator.register_client(&client_id, dataset).await?;
    }

    if simulation.clients > 0 {
        tracing::info!(
            clients = simulation.clients,
            records_per_client = simulation.records_per_client,
            "Simulated clients registered"
        );
    }
    Ok(())
}

/// Periodically fail rounds that outlived their deadline, so a round opened
/// over HTTP does not block the federation when clients go quiet.
pub fn spawn_round_reaper(federation: Arc<FederationServer>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Some(round) = federation.expire_overdue_round() {
                tracing::warn!(
                    round_id = round.round_id,
                    contributors = round.participating_clients.len(),
                    "Round expired by reaper"
                );
            }
        }
    })
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    init_tracing(config.server.log_json);

    tracing::info!("Starting Fedlytics Server");
    tracing::info!("Configuration: {:#?}", config);

    config.validate()?;

    let coordinator = build_coordinator(&config)?;
    register_simulated_clients(&coordinator, &config.simulation).await?;

    let reaper = spawn_round_reaper(coordinator.federation().clone(), config.reaper_interval());

    let app = build_router(AppState::new(coordinator), config.server.enable_cors);

    let addr = config.socket_addr()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = server_handle => {
            tracing::info!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
    reaper.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedlytics_core::CipherBackend;

    #[test]
    fn test_unavailable_backend_fails_startup() {
        let mut config = ServerConfig::default();
        config.cipher.backend = CipherBackend::Ckks;
        assert!(build_coordinator(&config).is_err());
    }

    #[tokio::test]
    async fn test_simulated_clients_registered() {
        let config = ServerConfig {
            simulation: SimulationConfig {
                clients: 3,
                ..SimulationConfig::default()
            },
            ..ServerConfig::default()
        };
        let coordinator = build_coordinator(&config).unwrap();
        register_simulated_clients(&coordinator, &config.simulation)
            .await
            .unwrap();

        assert_eq!(coordinator.agent_ids().len(), 3);
        assert_eq!(coordinator.federation().registry().len(), 3);
    }
}
