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

//! Client agent actor.
//!
//! A spawned agent owns its dataset inside a task; the coordinator keeps
//! only a [`ClientAgentHandle`] and exchanges commands and encrypted replies
//! over channels.
//!
//! ```text
//! AnalyticsCoordinator ──► ClientAgentHandle ──mpsc──► agent task
//!                                 ▲                        │
//!                                 └────────oneshot─────────┘
//! ```

use fedlytics_core::EmissionScope;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::agent::ClientAgent;
use crate::error::{FederatedError, FederatedResult};
use crate::update::EncryptedStatistic;

const MAILBOX_CAPACITY: usize = 32;

enum AgentCommand {
    Register {
        respond: oneshot::Sender<FederatedResult<bool>>,
    },
    Participate {
        respond: oneshot::Sender<FederatedResult<bool>>,
    },
    Statistic {
        scope: EmissionScope,
        respond: oneshot::Sender<FederatedResult<EncryptedStatistic>>,
    },
}

/// Handle to a running client agent.
#[derive(Clone)]
pub struct ClientAgentHandle {
    client_id: String,
    sender: mpsc::Sender<AgentCommand>,
}

impl ClientAgentHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub async fn register(&self) -> FederatedResult<bool> {
        self.request(|respond| AgentCommand::Register { respond })
            .await
    }

    /// Train on the active round and submit the encrypted update.
    pub async fn participate(&self) -> FederatedResult<bool> {
        self.request(|respond| AgentCommand::Participate { respond })
            .await
    }

    pub async fn compute_statistic(&self, scope: EmissionScope) -> FederatedResult<EncryptedStatistic> {
        self.request(|respond| AgentCommand::Statistic { scope, respond })
            .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<FederatedResult<T>>) -> AgentCommand,
    ) -> FederatedResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(command(tx)).await.map_err(|_| {
            FederatedError::Transport(format!("agent {} has stopped", self.client_id))
        })?;
        rx.await.map_err(|_| {
            FederatedError::Transport(format!("agent {} dropped the request", self.client_id))
        })?
    }
}

impl ClientAgent {
    /// Move the agent into its own task.
    pub fn spawn(self) -> ClientAgentHandle {
        let (sender, mut receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let client_id = self.client_id().to_string();
        let mut agent = self;

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    AgentCommand::Register { respond } => {
                        let _ = respond.send(agent.register().await);
                    }
                    AgentCommand::Participate { respond } => {
                        let _ = respond.send(agent.participate().await);
                    }
                    AgentCommand::Statistic { scope, respond } => {
                        let _ = respond.send(agent.compute_statistic(scope));
                    }
                }
            }
            debug!(client_id = %agent.client_id(), "Client agent stopped");
        });

        ClientAgentHandle { client_id, sender }
    }
}
