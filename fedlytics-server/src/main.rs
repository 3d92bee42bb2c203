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

use anyhow::Result;
use clap::Parser;
use fedlytics_core::CipherBackend;
use fedlytics_server::{config::ServerConfig, run_server};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(long, env = "FEDLYTICS_HTTP_ADDR")]
    http_addr: Option<String>,

    /// Contributions required to commit a round
    #[arg(long, env = "FEDLYTICS_MIN_CLIENTS")]
    min_clients: Option<usize>,

    /// Gradient-descent step size
    #[arg(long, env = "FEDLYTICS_LEARNING_RATE")]
    learning_rate: Option<f64>,

    /// Round deadline in seconds
    #[arg(long, env = "FEDLYTICS_ROUND_TIMEOUT")]
    round_timeout: Option<u64>,

    /// Directory for model version snapshots
    #[arg(long, env = "FEDLYTICS_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Cipher backend (mock_ckks, ckks)
    #[arg(long, env = "FEDLYTICS_CIPHER_BACKEND")]
    cipher_backend: Option<String>,

    /// Number of simulated in-process clients
    #[arg(long, env = "FEDLYTICS_SIMULATED_CLIENTS")]
    simulated_clients: Option<usize>,

    /// Emit JSON logs
    #[arg(long, env = "FEDLYTICS_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = ServerConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(addr) = args.http_addr {
        config.server.listen_addr = addr;
    }
    if let Some(min_clients) = args.min_clients {
        config.coordinator.min_clients_per_round = min_clients;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.coordinator.learning_rate = learning_rate;
    }
    if let Some(timeout) = args.round_timeout {
        config.coordinator.round_timeout_secs = timeout;
    }
    if let Some(dir) = args.model_dir {
        config.coordinator.model_dir = Some(dir);
    }
    if let Some(backend) = args.cipher_backend {
        config.cipher.backend = backend.parse::<CipherBackend>()?;
    }
    if let Some(clients) = args.simulated_clients {
        config.simulation.clients = clients;
    }
    if args.log_json {
        config.server.log_json = true;
    }

    // Run server
    run_server(config).await
}
