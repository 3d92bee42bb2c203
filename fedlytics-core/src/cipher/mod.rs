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

//! Homomorphic cipher context abstraction.
//!
//! The coordinator owns a [`CipherContext`] (secret capability: it can
//! decrypt). Client agents only ever receive the [`PublicMaterial`] and build
//! a [`HomomorphicEvaluator`] from it, which can encrypt and compute on
//! ciphertexts but has no way to decrypt.
//!
//! ```text
//!   Coordinator                                Client agent
//!  ┌──────────────────────┐   PublicMaterial  ┌─────────────────────────┐
//!  │ CipherContext        │ ────────────────► │ HomomorphicEvaluator    │
//!  │  encrypt / add / mul │                   │  encrypt / add / mul    │
//!  │  decrypt             │ ◄──────────────── │  (no decrypt)           │
//!  └──────────────────────┘    Ciphertext     └─────────────────────────┘
//! ```
//!
//! Backends are chosen once at startup through [`CipherBackend`]; there is no
//! runtime fallback between backends.

mod mock;

pub use mock::{MockCkksContext, MockCkksEvaluator};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::CipherConfig;
use crate::error::{CryptoError, CryptoResult};

/// Fingerprint of the key set a ciphertext was produced under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub String);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque packed ciphertext.
///
/// Slots hold encrypted values; a length-1 ciphertext is broadcast across the
/// other operand in binary operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ciphertext {
    context_id: ContextId,
    /// Polynomial degree: 1 for a fresh or relinearized ciphertext, 2 right
    /// after a tensor product.
    degree: u8,
    /// Number of multiplications consumed from the modulus chain
    level: u32,
    slots: Vec<f64>,
}

impl Ciphertext {
    pub(crate) fn new(context_id: ContextId, degree: u8, level: u32, slots: Vec<f64>) -> Self {
        Self {
            context_id,
            degree,
            level,
            slots,
        }
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn degree(&self) -> u8 {
        self.degree
    }

    /// Number of packed slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn slots(&self) -> &[f64] {
        &self.slots
    }
}

/// CKKS-style scheme parameters shared with every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeParams {
    pub poly_modulus_degree: usize,
    pub coeff_mod_bit_sizes: Vec<u32>,
    pub global_scale_bits: u32,
}

impl SchemeParams {
    /// Number of packable slots (half the ring dimension).
    pub fn slot_count(&self) -> usize {
        self.poly_modulus_degree / 2
    }

    /// Multiplicative depth offered by the modulus chain. The first and last
    /// primes are reserved for the key and the final decryption.
    pub fn max_level(&self) -> u32 {
        self.coeff_mod_bit_sizes.len().saturating_sub(2) as u32
    }
}

/// Cipher backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherBackend {
    /// In-memory CKKS-shaped scheme. Not cryptographically secure.
    MockCkks,
    /// Native CKKS library binding.
    Ckks,
}

impl Default for CipherBackend {
    fn default() -> Self {
        Self::MockCkks
    }
}

impl CipherBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherBackend::MockCkks => "mock_ckks",
            CipherBackend::Ckks => "ckks",
        }
    }

    /// Whether this build can instantiate the backend.
    pub fn is_available(&self) -> bool {
        match self {
            CipherBackend::MockCkks => true,
            CipherBackend::Ckks => false,
        }
    }

    /// Create the coordinator-side context for this backend.
    pub fn create_context(&self, config: &CipherConfig) -> CryptoResult<Arc<dyn CipherContext>> {
        match self {
            CipherBackend::MockCkks => Ok(Arc::new(MockCkksContext::generate(config)?)),
            CipherBackend::Ckks => Err(CryptoError::BackendUnavailable(
                "ckks backend is not compiled into this build".to_string(),
            )),
        }
    }
}

impl FromStr for CipherBackend {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock_ckks" | "mock" => Ok(CipherBackend::MockCkks),
            "ckks" => Ok(CipherBackend::Ckks),
            other => Err(CryptoError::BackendUnavailable(format!(
                "unknown cipher backend '{}'",
                other
            ))),
        }
    }
}

/// The distributable subset of a cipher context: scheme parameters plus
/// public, relinearization and rotation keys in backend-specific encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMaterial {
    pub backend: CipherBackend,
    pub context_id: ContextId,
    pub params: SchemeParams,
    pub key_material: Vec<u8>,
}

impl PublicMaterial {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Build an evaluator that can encrypt and compute, but not decrypt.
    pub fn evaluator(&self) -> CryptoResult<Arc<dyn HomomorphicEvaluator>> {
        match self.backend {
            CipherBackend::MockCkks => Ok(Arc::new(MockCkksEvaluator::from_public(self)?)),
            CipherBackend::Ckks => Err(CryptoError::BackendUnavailable(
                "ckks backend is not compiled into this build".to_string(),
            )),
        }
    }
}

/// Public homomorphic capability.
pub trait HomomorphicEvaluator: Send + Sync {
    fn context_id(&self) -> &ContextId;

    fn params(&self) -> &SchemeParams;

    /// Well-formedness check for a ciphertext received from another party:
    /// key set, degree, slot count, level and slot values.
    fn validate(&self, value: &Ciphertext) -> CryptoResult<()>;

    /// Encrypt a vector of reals into one packed ciphertext.
    fn encrypt(&self, values: &[f64]) -> CryptoResult<Ciphertext>;

    fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext>;

    fn negate(&self, value: &Ciphertext) -> CryptoResult<Ciphertext>;

    /// Slot-wise product. Implementations relinearize the degree-2 result
    /// before returning it.
    fn multiply(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext>;

    /// Rotate-and-sum: a length-1 ciphertext holding the sum of all slots.
    fn sum_slots(&self, value: &Ciphertext) -> CryptoResult<Ciphertext>;

    fn encrypt_scalar(&self, value: f64) -> CryptoResult<Ciphertext> {
        self.encrypt(&[value])
    }

    fn sub(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext> {
        let negated = self.negate(rhs)?;
        self.add(lhs, &negated)
    }
}

/// Secret capability, owned by the coordinator only.
pub trait CipherContext: HomomorphicEvaluator {
    fn decrypt(&self, value: &Ciphertext) -> CryptoResult<Vec<f64>>;

    fn public_material(&self) -> PublicMaterial;

    fn as_evaluator(&self) -> &dyn HomomorphicEvaluator;

    fn serialize_public_material(&self) -> CryptoResult<Vec<u8>> {
        self.public_material().to_bytes()
    }
}
