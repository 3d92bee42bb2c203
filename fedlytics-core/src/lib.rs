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

//! Fedlytics core types
//!
//! Leaf crate shared by the coordinator and client agents:
//! - **Cipher**: homomorphic evaluator / context abstraction and backends
//! - **Dataset**: participant-held emissions records
//! - **Model**: the versioned global ESG model
//! - **Resilience**: retry policy for transport calls

pub mod cipher;
pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod resilience;

pub use cipher::{
    CipherBackend, CipherContext, Ciphertext, ContextId, HomomorphicEvaluator, PublicMaterial,
    SchemeParams,
};
pub use config::CipherConfig;
pub use dataset::{ClientDataset, EmissionRecord, EmissionScope};
pub use error::{CryptoError, CryptoResult};
pub use model::{EsgModel, ModelSnapshot, DEFAULT_FEATURES};
pub use resilience::RetryPolicy;
