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

//! Round Manager - Threshold Commit for Training Rounds
//!
//! At most one round accepts updates at a time. Submissions are checked and
//! recorded under a single lock, and the submission that reaches quorum runs
//! the commit (aggregate, update the model, close the round) before the lock
//! is released. Two submissions can therefore never both observe quorum, and
//! a round is committed at most once.
//!
//! ```text
//!            open_round                 quorum + commit ok
//!   (none) ─────────────► Active ──────────────────────────► Completed
//!                           │
//!                           │ commit error / deadline / abort
//!                           ▼
//!                         Failed
//! ```
//!
//! Round transitions are published on a watch channel so waiters do not poll.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::state_machine::{RoundEvent, RoundStatus};
use crate::error::{FederatedError, FederatedResult};
use crate::update::{EncryptedAggregate, EncryptedUpdate};

/// Metadata for one training round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRound {
    pub round_id: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Updates arriving after this instant are refused and the round fails
    pub deadline: DateTime<Utc>,
    pub learning_rate: f64,
    pub participating_clients: BTreeSet<String>,
    /// Encrypted mean gradient, set once the round commits
    pub aggregated_update: Option<EncryptedAggregate>,
    pub status: RoundStatus,
    pub failure_reason: Option<String>,
    /// Model version installed by this round
    pub model_version: Option<u64>,
}

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Recorded; the round is still waiting for contributions
    Pending {
        round_id: u64,
        received: usize,
        required: usize,
    },
    /// This submission completed the quorum and the round committed
    Committed {
        round_id: u64,
        model_version: u64,
        contributors: usize,
    },
}

impl SubmissionOutcome {
    pub fn round_id(&self) -> u64 {
        match self {
            SubmissionOutcome::Pending { round_id, .. } => *round_id,
            SubmissionOutcome::Committed { round_id, .. } => *round_id,
        }
    }
}

/// What the commit step hands back to the manager.
#[derive(Debug, Clone)]
pub struct RoundCommit {
    pub aggregate: EncryptedAggregate,
    pub model_version: u64,
}

/// Published on every round transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSignal {
    pub round_id: u64,
    pub status: RoundStatus,
}

struct ActiveRound {
    round: TrainingRound,
    /// Individual ciphertexts, dropped when the round closes
    updates: Vec<EncryptedUpdate>,
}

struct RoundState {
    next_round_id: u64,
    active: Option<ActiveRound>,
    history: VecDeque<TrainingRound>,
}

pub struct RoundManager {
    state: Mutex<RoundState>,
    min_clients: usize,
    round_timeout: Duration,
    max_history: usize,
    signal: watch::Sender<Option<RoundSignal>>,
}

impl RoundManager {
    pub fn new(min_clients: usize, round_timeout: Duration, max_history: usize) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            state: Mutex::new(RoundState {
                next_round_id: 1,
                active: None,
                history: VecDeque::new(),
            }),
            min_clients: min_clients.max(1),
            round_timeout,
            max_history,
            signal,
        }
    }

    /// Number rounds from `first_round_id` instead of 1, so ids keep
    /// increasing across restarts that resume a persisted model.
    pub fn starting_at(mut self, first_round_id: u64) -> Self {
        self.state.get_mut().next_round_id = first_round_id.max(1);
        self
    }

    pub fn min_clients(&self) -> usize {
        self.min_clients
    }

    /// Open the next round.
    ///
    /// An active round that is past its deadline is failed first; one that is
    /// still within its deadline makes this call fail with
    /// [`FederatedError::RoundAlreadyActive`].
    pub fn open_round(&self, learning_rate: f64) -> FederatedResult<TrainingRound> {
        let mut state = self.state.lock();
        let now = Utc::now();

        if let Some(active) = state.active.as_ref() {
            let round_id = active.round.round_id;
            if now <= active.round.deadline {
                return Err(FederatedError::RoundAlreadyActive(round_id));
            }
            self.close_locked(
                &mut state,
                RoundEvent::DeadlineExpired,
                Some("deadline expired before quorum".to_string()),
                None,
            )?;
            warn!(round_id, "Overdue round failed before opening the next one");
        }

        let round_id = state.next_round_id;
        state.next_round_id += 1;

        let round = TrainingRound {
            round_id,
            start_time: now,
            end_time: None,
            deadline: now + chrono_duration(self.round_timeout),
            learning_rate,
            participating_clients: BTreeSet::new(),
            aggregated_update: None,
            status: RoundStatus::Active,
            failure_reason: None,
            model_version: None,
        };
        state.active = Some(ActiveRound {
            round: round.clone(),
            updates: Vec::new(),
        });
        self.signal.send_replace(Some(RoundSignal {
            round_id,
            status: RoundStatus::Active,
        }));

        info!(
            round_id,
            min_clients = self.min_clients,
            timeout_secs = self.round_timeout.as_secs(),
            "Opened training round"
        );
        Ok(round)
    }

    /// Record an update and, if it completes the quorum, run `commit` while
    /// still holding the round lock.
    ///
    /// `commit` receives the round metadata and every update recorded for it.
    /// If it fails the round is marked failed and the error is reported as
    /// [`FederatedError::RoundFailed`].
    pub fn submit<F>(&self, update: EncryptedUpdate, commit: F) -> FederatedResult<SubmissionOutcome>
    where
        F: FnOnce(&TrainingRound, &[EncryptedUpdate]) -> FederatedResult<RoundCommit>,
    {
        let mut state = self.state.lock();

        let (round_id, deadline) = match state.active.as_ref() {
            Some(active) => (active.round.round_id, active.round.deadline),
            None if update.round_id < state.next_round_id => {
                return Err(FederatedError::RoundClosed(update.round_id))
            }
            None => return Err(FederatedError::NoActiveRound),
        };

        if update.round_id != round_id {
            return Err(FederatedError::StaleRound {
                submitted: update.round_id,
                active: round_id,
            });
        }

        if Utc::now() > deadline {
            self.close_locked(
                &mut state,
                RoundEvent::DeadlineExpired,
                Some("deadline expired before quorum".to_string()),
                None,
            )?;
            warn!(round_id, client_id = %update.client_id, "Update arrived after round deadline");
            return Err(FederatedError::RoundClosed(round_id));
        }

        let active = state.active.as_mut().ok_or(FederatedError::NoActiveRound)?;
        if !active
            .round
            .participating_clients
            .insert(update.client_id.clone())
        {
            return Err(FederatedError::DuplicateSubmission {
                client_id: update.client_id,
                round_id,
            });
        }

        debug!(round_id, client_id = %update.client_id, "Recorded encrypted update");
        active.updates.push(update);
        let received = active.updates.len();

        if received < self.min_clients {
            return Ok(SubmissionOutcome::Pending {
                round_id,
                received,
                required: self.min_clients,
            });
        }

        match commit(&active.round, &active.updates) {
            Ok(result) => {
                let model_version = result.model_version;
                self.close_locked(&mut state, RoundEvent::Committed, None, Some(result))?;
                info!(round_id, model_version, contributors = received, "Round committed");
                Ok(SubmissionOutcome::Committed {
                    round_id,
                    model_version,
                    contributors: received,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.close_locked(
                    &mut state,
                    RoundEvent::CommitFailed,
                    Some(reason.clone()),
                    None,
                )?;
                error!(round_id, "Round commit failed: {}", reason);
                Err(FederatedError::RoundFailed { round_id, reason })
            }
        }
    }

    /// Abort the active round if it is `round_id`.
    pub fn fail_round(&self, round_id: u64, reason: &str) -> FederatedResult<TrainingRound> {
        let mut state = self.state.lock();
        match state.active.as_ref() {
            Some(active) if active.round.round_id == round_id => {
                let round = self.close_locked(
                    &mut state,
                    RoundEvent::Abort,
                    Some(reason.to_string()),
                    None,
                )?;
                warn!(round_id, "Round aborted: {}", reason);
                Ok(round)
            }
            _ if round_id < state.next_round_id => Err(FederatedError::RoundClosed(round_id)),
            _ => Err(FederatedError::NoActiveRound),
        }
    }

    /// Fail the active round if its deadline has passed.
    pub fn expire_overdue(&self) -> Option<TrainingRound> {
        let mut state = self.state.lock();
        let overdue = state
            .active
            .as_ref()
            .map(|a| Utc::now() > a.round.deadline)
            .unwrap_or(false);
        if !overdue {
            return None;
        }

        match self.close_locked(
            &mut state,
            RoundEvent::DeadlineExpired,
            Some("deadline expired before quorum".to_string()),
            None,
        ) {
            Ok(round) => {
                warn!(
                    round_id = round.round_id,
                    received = round.participating_clients.len(),
                    required = self.min_clients,
                    "Round expired without quorum"
                );
                Some(round)
            }
            Err(_) => None,
        }
    }

    pub fn current(&self) -> Option<TrainingRound> {
        self.state.lock().active.as_ref().map(|a| a.round.clone())
    }

    pub fn current_round_id(&self) -> Option<u64> {
        self.state.lock().active.as_ref().map(|a| a.round.round_id)
    }

    pub fn round(&self, round_id: u64) -> Option<TrainingRound> {
        let state = self.state.lock();
        if let Some(active) = state.active.as_ref() {
            if active.round.round_id == round_id {
                return Some(active.round.clone());
            }
        }
        state
            .history
            .iter()
            .find(|r| r.round_id == round_id)
            .cloned()
    }

    /// Retained rounds, oldest first, including the active one.
    pub fn history(&self) -> Vec<TrainingRound> {
        let state = self.state.lock();
        let mut rounds: Vec<TrainingRound> = state.history.iter().cloned().collect();
        if let Some(active) = state.active.as_ref() {
            rounds.push(active.round.clone());
        }
        rounds
    }

    /// Rounds ever opened.
    pub fn total_rounds(&self) -> u64 {
        self.state.lock().next_round_id - 1
    }

    /// Most recent closed round.
    pub fn last_closed(&self) -> Option<TrainingRound> {
        self.state.lock().history.back().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<RoundSignal>> {
        self.signal.subscribe()
    }

    /// Wait until `round_id` is completed or failed. Returns `None` if the
    /// round is unknown (never opened or pruned from history).
    pub async fn wait_for_terminal(&self, round_id: u64) -> Option<RoundStatus> {
        let mut rx = self.subscribe();
        loop {
            let status = self.round(round_id)?.status;
            if status.is_terminal() {
                return Some(status);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    fn close_locked(
        &self,
        state: &mut RoundState,
        event: RoundEvent,
        reason: Option<String>,
        commit: Option<RoundCommit>,
    ) -> FederatedResult<TrainingRound> {
        let status = match state.active.as_ref() {
            Some(active) => active.round.status.transition(event)?,
            None => return Err(FederatedError::NoActiveRound),
        };
        let active = state.active.take().ok_or(FederatedError::NoActiveRound)?;

        let mut round = active.round;
        round.status = status;
        round.end_time = Some(Utc::now());
        round.failure_reason = reason;
        if let Some(commit) = commit {
            round.aggregated_update = Some(commit.aggregate);
            round.model_version = Some(commit.model_version);
        }

        state.history.push_back(round.clone());
        while self.max_history > 0 && state.history.len() > self.max_history {
            state.history.pop_front();
        }

        self.signal.send_replace(Some(RoundSignal {
            round_id: round.round_id,
            status,
        }));
        Ok(round)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedlytics_core::{CipherBackend, CipherConfig, CipherContext};
    use std::sync::Arc;

    fn context() -> Arc<dyn CipherContext> {
        CipherBackend::MockCkks
            .create_context(&CipherConfig::default())
            .unwrap()
    }

    fn update(ctx: &Arc<dyn CipherContext>, client: &str, round_id: u64) -> EncryptedUpdate {
        EncryptedUpdate {
            client_id: client.to_string(),
            round_id,
            model_version: 1,
            feature_names: vec!["a".to_string()],
            weight_gradients: ctx.encrypt(&[1.0]).unwrap(),
            bias_gradient: ctx.encrypt_scalar(0.5).unwrap(),
            submitted_at: Utc::now(),
        }
    }

    fn commit_ok(
        round: &TrainingRound,
        updates: &[EncryptedUpdate],
    ) -> FederatedResult<RoundCommit> {
        Ok(RoundCommit {
            aggregate: EncryptedAggregate {
                round_id: round.round_id,
                feature_names: updates[0].feature_names.clone(),
                weight_gradients: updates[0].weight_gradients.clone(),
                bias_gradient: updates[0].bias_gradient.clone(),
                contributors: updates.len(),
            },
            model_version: 2,
        })
    }

    fn manager(min_clients: usize) -> RoundManager {
        RoundManager::new(min_clients, Duration::from_secs(30), 100)
    }

    #[test]
    fn test_only_one_active_round() {
        let rounds = manager(2);
        let first = rounds.open_round(0.01).unwrap();
        assert_eq!(first.round_id, 1);
        assert!(matches!(
            rounds.open_round(0.01),
            Err(FederatedError::RoundAlreadyActive(1))
        ));
    }

    #[test]
    fn test_commit_runs_once_at_quorum() {
        let ctx = context();
        let rounds = manager(2);
        rounds.open_round(0.01).unwrap();

        let mut commits = 0;
        let first = rounds
            .submit(update(&ctx, "a", 1), |r, u| {
                commits += 1;
                commit_ok(r, u)
            })
            .unwrap();
        assert_eq!(
            first,
            SubmissionOutcome::Pending {
                round_id: 1,
                received: 1,
                required: 2
            }
        );

        let second = rounds
            .submit(update(&ctx, "b", 1), |r, u| {
                commits += 1;
                commit_ok(r, u)
            })
            .unwrap();
        assert!(matches!(
            second,
            SubmissionOutcome::Committed {
                round_id: 1,
                model_version: 2,
                contributors: 2
            }
        ));
        assert_eq!(commits, 1);

        let round = rounds.round(1).unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        assert_eq!(round.participating_clients.len(), 2);
        assert!(round.aggregated_update.is_some());
        assert!(rounds.current().is_none());

        // Late arrival for a committed round
        let late = rounds.submit(update(&ctx, "c", 1), commit_ok);
        assert!(matches!(late, Err(FederatedError::RoundClosed(1))));
    }

    #[test]
    fn test_stale_and_duplicate_updates_rejected() {
        let ctx = context();
        let rounds = manager(3);
        rounds.open_round(0.01).unwrap();
        rounds.fail_round(1, "test").unwrap();
        rounds.open_round(0.01).unwrap();

        let stale = rounds.submit(update(&ctx, "a", 1), commit_ok);
        assert!(matches!(
            stale,
            Err(FederatedError::StaleRound {
                submitted: 1,
                active: 2
            })
        ));

        rounds.submit(update(&ctx, "a", 2), commit_ok).unwrap();
        let dup = rounds.submit(update(&ctx, "a", 2), commit_ok);
        assert!(matches!(dup, Err(FederatedError::DuplicateSubmission { .. })));
        assert_eq!(rounds.current().unwrap().participating_clients.len(), 1);
    }

    #[test]
    fn test_failed_commit_fails_round() {
        let ctx = context();
        let rounds = manager(1);
        rounds.open_round(0.01).unwrap();

        let result = rounds.submit(update(&ctx, "a", 1), |_, _| {
            Err(FederatedError::AggregationEmpty)
        });
        assert!(matches!(result, Err(FederatedError::RoundFailed { round_id: 1, .. })));

        let round = rounds.round(1).unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        assert!(round.model_version.is_none());
        assert!(round.failure_reason.is_some());
    }

    #[test]
    fn test_overdue_round_fails_instead_of_committing() {
        let ctx = context();
        let rounds = RoundManager::new(1, Duration::from_millis(1), 100);
        rounds.open_round(0.01).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let result = rounds.submit(update(&ctx, "a", 1), commit_ok);
        assert!(matches!(result, Err(FederatedError::RoundClosed(1))));
        assert_eq!(rounds.round(1).unwrap().status, RoundStatus::Failed);

        // Next round opens normally
        assert_eq!(rounds.open_round(0.01).unwrap().round_id, 2);
    }

    #[test]
    fn test_expire_overdue() {
        let rounds = RoundManager::new(2, Duration::from_millis(1), 100);
        rounds.open_round(0.01).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let expired = rounds.expire_overdue().unwrap();
        assert_eq!(expired.round_id, 1);
        assert_eq!(expired.status, RoundStatus::Failed);
        assert!(rounds.expire_overdue().is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let rounds = RoundManager::new(1, Duration::from_secs(30), 2);
        for id in 1..=4 {
            rounds.open_round(0.01).unwrap();
            rounds.fail_round(id, "test").unwrap();
        }
        let history = rounds.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].round_id, 3);
        assert_eq!(rounds.total_rounds(), 4);
    }

    #[test]
    fn test_round_ids_continue_from_starting_point() {
        let rounds = manager(1).starting_at(4);
        assert_eq!(rounds.current_round_id(), None);
        assert_eq!(rounds.open_round(0.01).unwrap().round_id, 4);
        rounds.fail_round(4, "test").unwrap();
        assert_eq!(rounds.open_round(0.01).unwrap().round_id, 5);
        assert_eq!(rounds.total_rounds(), 5);
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let ctx = context();
        let rounds = Arc::new(manager(1));
        rounds.open_round(0.01).unwrap();

        let waiter = {
            let rounds = rounds.clone();
            tokio::spawn(async move { rounds.wait_for_terminal(1).await })
        };
        tokio::task::yield_now().await;

        rounds.submit(update(&ctx, "a", 1), commit_ok).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(RoundStatus::Completed));
        assert_eq!(rounds.wait_for_terminal(99).await, None);
    }
}
