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

//! Fedlytics coordinator
//!
//! Federated ESG analytics over homomorphically encrypted contributions:
//! - **Federation server**: registration, model distribution, threshold
//!   commit of training rounds
//! - **Client agents**: participant-side actors that own plaintext data and
//!   only emit ciphertexts
//! - **Analytics coordinator**: asynchronous query processing on top of both

pub mod aggregator;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod federation;
pub mod model_store;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod round;
pub mod transport;
pub mod update;

pub use aggregator::Aggregator;
pub use client::{ClientAgent, ClientAgentHandle};
pub use config::CoordinatorConfig;
pub use coordinator::AnalyticsCoordinator;
pub use error::{FederatedError, FederatedResult};
pub use federation::{FederationServer, FederationSnapshot, FederationStatus, RegistrationReceipt};
pub use pipeline::TrainingPipeline;
pub use query::{AnalyticsQuery, AnalyticsResult, QueryStatus, QueryType};
pub use registry::{ClientRecord, ClientRegistry, ClientStatus};
pub use round::{RoundManager, RoundStatus, SubmissionOutcome, TrainingRound};
pub use transport::{CoordinatorTransport, LocalTransport, UpdateReceipt};
pub use update::{EncryptedAggregate, EncryptedStatistic, EncryptedUpdate};
