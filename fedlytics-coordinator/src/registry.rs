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

//! Registered participants.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FederatedError, FederatedResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// Registered, not part of an open round
    Idle,
    /// Invited to the active round, no update yet
    Training,
    /// Submitted an update to the active round
    Active,
}

/// Coordinator-side view of a participant. Holds no participant data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ClientStatus,
    /// Model version of the client's latest accepted update
    pub model_version: u64,
    /// Record count declared at registration
    pub data_size: usize,
    pub rounds_participated: u64,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a client. Returns the record and whether it is new.
    pub fn register(&self, client_id: &str, data_size: usize) -> FederatedResult<(ClientRecord, bool)> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(FederatedError::Registration(
                "client_id must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let mut is_new = false;
        let record = self
            .clients
            .entry(client_id.to_string())
            .and_modify(|r| {
                r.last_seen = now;
                r.data_size = data_size;
            })
            .or_insert_with(|| {
                is_new = true;
                ClientRecord {
                    client_id: client_id.to_string(),
                    registered_at: now,
                    last_seen: now,
                    status: ClientStatus::Idle,
                    model_version: 0,
                    data_size,
                    rounds_participated: 0,
                }
            })
            .clone();

        Ok((record, is_new))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<ClientRecord> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(mut record) = self.clients.get_mut(client_id) {
            record.last_seen = Utc::now();
        }
    }

    /// A new round opened: every known client is invited.
    pub fn mark_all_training(&self) {
        for mut record in self.clients.iter_mut() {
            record.status = ClientStatus::Training;
        }
    }

    pub fn record_submission(&self, client_id: &str, model_version: u64) {
        if let Some(mut record) = self.clients.get_mut(client_id) {
            record.status = ClientStatus::Active;
            record.model_version = model_version;
            record.last_seen = Utc::now();
            record.rounds_participated += 1;
        }
    }

    /// The round closed.
    pub fn mark_all_idle(&self) {
        for mut record in self.clients.iter_mut() {
            record.status = ClientStatus::Idle;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients seen within `window`.
    pub fn active_count(&self, window: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(window.as_millis().min(i64::MAX as u128) as i64);
        self.clients.iter().filter(|r| r.last_seen >= cutoff).count()
    }

    pub fn list(&self) -> Vec<ClientRecord> {
        let mut records: Vec<_> = self.clients.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = ClientRegistry::new();
        let (first, is_new) = registry.register("bank_a", 10).unwrap();
        assert!(is_new);
        assert_eq!(first.status, ClientStatus::Idle);

        let (second, is_new) = registry.register("bank_a", 12).unwrap();
        assert!(!is_new);
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.data_size, 12);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_id_rejected() {
        let registry = ClientRegistry::new();
        assert!(matches!(
            registry.register("  ", 1),
            Err(FederatedError::Registration(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_status_lifecycle() {
        let registry = ClientRegistry::new();
        registry.register("a", 1).unwrap();
        registry.register("b", 1).unwrap();

        registry.mark_all_training();
        registry.record_submission("a", 3);
        let a = registry.get("a").unwrap();
        assert_eq!(a.status, ClientStatus::Active);
        assert_eq!(a.model_version, 3);
        assert_eq!(a.rounds_participated, 1);
        assert_eq!(registry.get("b").unwrap().status, ClientStatus::Training);

        registry.mark_all_idle();
        assert!(registry.list().iter().all(|r| r.status == ClientStatus::Idle));
    }

    #[test]
    fn test_active_window() {
        let registry = ClientRegistry::new();
        registry.register("a", 1).unwrap();
        assert_eq!(registry.active_count(Duration::from_secs(60)), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.active_count(Duration::from_millis(1)), 0);
    }
}
