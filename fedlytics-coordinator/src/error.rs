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

//! Coordinator error types

use fedlytics_core::CryptoError;
use thiserror::Error;

/// Result type for coordinator operations
pub type FederatedResult<T> = Result<T, FederatedError>;

/// Errors that can occur while coordinating rounds and queries
#[derive(Debug, Clone, Error)]
pub enum FederatedError {
    /// Cipher failure (malformed ciphertext, context mismatch, depth)
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Registration rejected (e.g. missing client id)
    #[error("Registration error: {0}")]
    Registration(String),

    /// Client never registered
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// No round is accepting updates
    #[error("No active round")]
    NoActiveRound,

    /// A round is already accepting updates
    #[error("Round {0} is already active")]
    RoundAlreadyActive(u64),

    /// Update targets a round other than the active one
    #[error("Stale update for round {submitted} (active round: {active})")]
    StaleRound { submitted: u64, active: u64 },

    /// Round already left the active state
    #[error("Round {0} is closed")]
    RoundClosed(u64),

    /// Client already contributed to this round
    #[error("Client {client_id} already submitted to round {round_id}")]
    DuplicateSubmission { client_id: String, round_id: u64 },

    /// Not enough contributions to commit a result
    #[error("Quorum not reached: {received}/{required} contributions")]
    QuorumNotReached { received: usize, required: usize },

    /// Nothing to aggregate
    #[error("No updates to aggregate")]
    AggregationEmpty,

    /// Round aborted
    #[error("Round {round_id} failed: {reason}")]
    RoundFailed { round_id: u64, reason: String },

    /// Illegal state machine transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Query type not supported
    #[error("Unsupported query type: {0}")]
    UnsupportedQuery(String),

    /// Bad query or update parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Client/coordinator transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Model store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FederatedError {
    /// Transient failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, FederatedError::Transport(_))
    }

    /// Update rejections: the submission is dropped, nothing else is affected.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            FederatedError::UnknownClient(_)
                | FederatedError::NoActiveRound
                | FederatedError::StaleRound { .. }
                | FederatedError::RoundClosed(_)
                | FederatedError::DuplicateSubmission { .. }
        )
    }
}

impl From<std::io::Error> for FederatedError {
    fn from(e: std::io::Error) -> Self {
        FederatedError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for FederatedError {
    fn from(e: serde_json::Error) -> Self {
        FederatedError::Serialization(e.to_string())
    }
}
