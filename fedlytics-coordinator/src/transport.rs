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

//! Client-to-coordinator transport.
//!
//! Client agents talk to the coordinator only through this trait, so the
//! same agent runs in-process ([`LocalTransport`]) or against a remote
//! HTTP endpoint.

use async_trait::async_trait;
use fedlytics_core::ModelSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::FederatedResult;
use crate::federation::{FederationServer, FederationStatus, RegistrationReceipt};
use crate::round::SubmissionOutcome;
use crate::update::EncryptedUpdate;

/// Outcome of an update submission as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateReceipt {
    Accepted { outcome: SubmissionOutcome },
    /// Dropped (stale round, closed round, duplicate, unknown client)
    Rejected { reason: String },
}

impl UpdateReceipt {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UpdateReceipt::Accepted { .. })
    }
}

#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    async fn register(&self, client_id: &str, data_size: usize) -> FederatedResult<RegistrationReceipt>;

    async fn download_global_model(&self) -> FederatedResult<ModelSnapshot>;

    async fn submit_update(&self, update: EncryptedUpdate) -> FederatedResult<UpdateReceipt>;

    async fn status(&self) -> FederatedResult<FederationStatus>;
}

/// In-process transport over a shared [`FederationServer`].
#[derive(Clone)]
pub struct LocalTransport {
    server: Arc<FederationServer>,
}

impl LocalTransport {
    pub fn new(server: Arc<FederationServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl CoordinatorTransport for LocalTransport {
    async fn register(&self, client_id: &str, data_size: usize) -> FederatedResult<RegistrationReceipt> {
        self.server.register(client_id, data_size)
    }

    async fn download_global_model(&self) -> FederatedResult<ModelSnapshot> {
        Ok(self.server.global_model())
    }

    async fn submit_update(&self, update: EncryptedUpdate) -> FederatedResult<UpdateReceipt> {
        match self.server.submit_update(update) {
            Ok(outcome) => Ok(UpdateReceipt::Accepted { outcome }),
            Err(e) if e.is_rejection() => Ok(UpdateReceipt::Rejected {
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn status(&self) -> FederatedResult<FederationStatus> {
        Ok(self.server.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_wire_format() {
        let receipt = UpdateReceipt::Accepted {
            outcome: SubmissionOutcome::Pending {
                round_id: 3,
                received: 1,
                required: 2,
            },
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["outcome"]["state"], "pending");
        assert_eq!(json["outcome"]["round_id"], 3);

        let back: UpdateReceipt = serde_json::from_value(json).unwrap();
        assert_eq!(back, receipt);

        let rejected = serde_json::to_value(UpdateReceipt::Rejected {
            reason: "stale".to_string(),
        })
        .unwrap();
        assert_eq!(rejected["status"], "rejected");
    }
}
