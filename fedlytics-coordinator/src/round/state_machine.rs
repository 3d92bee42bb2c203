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

//! Training round lifecycle state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FederatedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Active,
    Completed,
    Failed,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Active => "active",
            RoundStatus::Completed => "completed",
            RoundStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundEvent {
    /// Quorum reached and the new model version was installed
    Committed,
    /// Aggregation or model update failed
    CommitFailed,
    /// Deadline passed before quorum
    DeadlineExpired,
    /// Coordinator gave up on the round
    Abort,
}

#[derive(Debug, Error)]
#[error("Invalid round transition: {current:?} -> {event:?}")]
pub struct InvalidTransition {
    pub current: RoundStatus,
    pub event: RoundEvent,
}

impl From<InvalidTransition> for FederatedError {
    fn from(e: InvalidTransition) -> Self {
        FederatedError::InvalidTransition(e.to_string())
    }
}

impl RoundStatus {
    pub fn transition(self, event: RoundEvent) -> Result<RoundStatus, InvalidTransition> {
        use RoundEvent::*;
        use RoundStatus::*;

        let next = match (self, event) {
            (Active, Committed) => Completed,
            (Active, CommitFailed) | (Active, DeadlineExpired) | (Active, Abort) => Failed,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    event,
                })
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_round_transitions() {
        assert_eq!(
            RoundStatus::Active.transition(RoundEvent::Committed).unwrap(),
            RoundStatus::Completed
        );
        assert_eq!(
            RoundStatus::Active
                .transition(RoundEvent::DeadlineExpired)
                .unwrap(),
            RoundStatus::Failed
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        for status in [RoundStatus::Completed, RoundStatus::Failed] {
            assert!(status.is_terminal());
            for event in [
                RoundEvent::Committed,
                RoundEvent::CommitFailed,
                RoundEvent::DeadlineExpired,
                RoundEvent::Abort,
            ] {
                assert!(status.transition(event).is_err());
            }
        }
    }
}
