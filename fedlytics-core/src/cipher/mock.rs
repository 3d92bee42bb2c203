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

//! In-memory CKKS-shaped backend.
//!
//! Each slot `i` carries a secret multiplier `k_i`; a value `m` encrypts to
//! `m * k_i` plus a small noise term. Sums stay in the same key, products land
//! in `k_i^2` (degree 2) and are relinearized back to `k_i`. Levels are
//! tracked against the modulus chain so that circuits which would overflow a
//! real CKKS parameter set fail here too.
//!
//! This is a test double for a real CKKS library: public and secret key
//! material coincide, so it offers no confidentiality against a holder of
//! the public material.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use super::{
    CipherBackend, CipherContext, Ciphertext, ContextId, HomomorphicEvaluator, PublicMaterial,
    SchemeParams,
};
use crate::config::CipherConfig;
use crate::error::{CryptoError, CryptoResult};

const KEY_RANGE: std::ops::Range<f64> = 1.5..9.5;

/// Public half of the mock scheme: encrypt, add, multiply, rotate.
#[derive(Debug, Clone)]
pub struct MockCkksEvaluator {
    context_id: ContextId,
    params: SchemeParams,
    slot_keys: Arc<Vec<f64>>,
    noise_scale: f64,
}

impl MockCkksEvaluator {
    fn new(params: SchemeParams, slot_keys: Vec<f64>, noise_scale: f64) -> Self {
        let context_id = fingerprint(&slot_keys);
        Self {
            context_id,
            params,
            slot_keys: Arc::new(slot_keys),
            noise_scale,
        }
    }

    /// Rebuild the evaluator from distributed public material.
    pub fn from_public(material: &PublicMaterial) -> CryptoResult<Self> {
        if material.backend != CipherBackend::MockCkks {
            return Err(CryptoError::Malformed(format!(
                "public material is for backend '{}'",
                material.backend.as_str()
            )));
        }

        let (slot_keys, noise_scale): (Vec<f64>, f64) =
            bincode::deserialize(&material.key_material)?;
        if slot_keys.len() != material.params.slot_count() {
            return Err(CryptoError::Malformed(format!(
                "expected {} slot keys, found {}",
                material.params.slot_count(),
                slot_keys.len()
            )));
        }

        let evaluator = Self::new(material.params.clone(), slot_keys, noise_scale);
        if evaluator.context_id != material.context_id {
            return Err(CryptoError::ContextMismatch {
                expected: material.context_id.clone(),
                found: evaluator.context_id,
            });
        }
        Ok(evaluator)
    }

    fn key_material(&self) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(&(self.slot_keys.as_ref(), self.noise_scale))?)
    }

    fn check(&self, value: &Ciphertext) -> CryptoResult<()> {
        if value.context_id() != &self.context_id {
            return Err(CryptoError::ContextMismatch {
                expected: self.context_id.clone(),
                found: value.context_id().clone(),
            });
        }
        if value.degree() != 1 {
            return Err(CryptoError::Malformed(format!(
                "ciphertext has degree {}, expected a relinearized ciphertext",
                value.degree()
            )));
        }
        if value.is_empty() || value.len() > self.params.slot_count() {
            return Err(CryptoError::Malformed(format!(
                "ciphertext has {} slots (capacity {})",
                value.len(),
                self.params.slot_count()
            )));
        }
        if value.level() > self.params.max_level() {
            return Err(CryptoError::Malformed(format!(
                "ciphertext level {} beyond modulus chain",
                value.level()
            )));
        }
        if value.slots().iter().any(|s| !s.is_finite()) {
            return Err(CryptoError::Malformed("non-finite slot".to_string()));
        }
        Ok(())
    }

    fn output_width(lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<usize> {
        match (lhs.len(), rhs.len()) {
            (l, r) if l == r => Ok(l),
            (1, r) => Ok(r),
            (l, 1) => Ok(l),
            (l, r) => Err(CryptoError::ShapeMismatch { lhs: l, rhs: r }),
        }
    }

    /// Slots of `value` re-keyed to `width`, replicating a single slot when
    /// broadcasting.
    fn expand(&self, value: &Ciphertext, width: usize) -> Vec<f64> {
        if value.len() == width {
            return value.slots().to_vec();
        }
        let plain = value.slots()[0] / self.slot_keys[0];
        self.slot_keys[..width].iter().map(|k| plain * k).collect()
    }

    /// Bring a degree-2 product back to degree 1.
    fn relinearize(&self, product: Ciphertext) -> Ciphertext {
        let slots = product
            .slots()
            .iter()
            .zip(self.slot_keys.iter())
            .map(|(s, k)| s / k)
            .collect();
        Ciphertext::new(product.context_id().clone(), 1, product.level(), slots)
    }

    fn decrypt_slots(&self, value: &Ciphertext) -> CryptoResult<Vec<f64>> {
        self.check(value)?;
        Ok(value
            .slots()
            .iter()
            .zip(self.slot_keys.iter())
            .map(|(s, k)| s / k)
            .collect())
    }
}

impl HomomorphicEvaluator for MockCkksEvaluator {
    fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    fn params(&self) -> &SchemeParams {
        &self.params
    }

    fn validate(&self, value: &Ciphertext) -> CryptoResult<()> {
        self.check(value)
    }

    fn encrypt(&self, values: &[f64]) -> CryptoResult<Ciphertext> {
        if values.is_empty() {
            return Err(CryptoError::Malformed("cannot encrypt an empty vector".to_string()));
        }
        if values.len() > self.params.slot_count() {
            return Err(CryptoError::ShapeMismatch {
                lhs: values.len(),
                rhs: self.params.slot_count(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CryptoError::Malformed("non-finite plaintext".to_string()));
        }

        let mut rng = rand::thread_rng();
        let slots = values
            .iter()
            .zip(self.slot_keys.iter())
            .map(|(v, k)| {
                let noise = if self.noise_scale > 0.0 {
                    rng.gen_range(-1.0..1.0) * self.noise_scale
                } else {
                    0.0
                };
                (v + noise) * k
            })
            .collect();

        Ok(Ciphertext::new(self.context_id.clone(), 1, 0, slots))
    }

    fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.check(lhs)?;
        self.check(rhs)?;
        let width = Self::output_width(lhs, rhs)?;

        let slots = self
            .expand(lhs, width)
            .into_iter()
            .zip(self.expand(rhs, width))
            .map(|(a, b)| a + b)
            .collect();

        Ok(Ciphertext::new(
            self.context_id.clone(),
            1,
            lhs.level().max(rhs.level()),
            slots,
        ))
    }

    fn negate(&self, value: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.check(value)?;
        let slots = value.slots().iter().map(|s| -s).collect();
        Ok(Ciphertext::new(self.context_id.clone(), 1, value.level(), slots))
    }

    fn multiply(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.check(lhs)?;
        self.check(rhs)?;
        let width = Self::output_width(lhs, rhs)?;

        let level = lhs.level().max(rhs.level()) + 1;
        if level > self.params.max_level() {
            return Err(CryptoError::DepthExhausted {
                max_level: self.params.max_level(),
            });
        }

        let tensor = self
            .expand(lhs, width)
            .into_iter()
            .zip(self.expand(rhs, width))
            .map(|(a, b)| a * b)
            .collect();
        let product = Ciphertext::new(self.context_id.clone(), 2, level, tensor);

        Ok(self.relinearize(product))
    }

    fn sum_slots(&self, value: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.check(value)?;
        let total: f64 = value
            .slots()
            .iter()
            .zip(self.slot_keys.iter())
            .map(|(s, k)| s / k)
            .sum();
        Ok(Ciphertext::new(
            self.context_id.clone(),
            1,
            value.level(),
            vec![total * self.slot_keys[0]],
        ))
    }
}

/// Coordinator-side context: the evaluator plus decryption.
#[derive(Debug, Clone)]
pub struct MockCkksContext {
    evaluator: MockCkksEvaluator,
}

impl MockCkksContext {
    /// Generate fresh keys. A configured seed makes the key set reproducible.
    pub fn generate(config: &CipherConfig) -> CryptoResult<Self> {
        let params = config.scheme_params();
        if params.slot_count() == 0 {
            return Err(CryptoError::Malformed(
                "poly_modulus_degree must be at least 2".to_string(),
            ));
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let slot_keys = (0..params.slot_count())
            .map(|_| rng.gen_range(KEY_RANGE))
            .collect();

        let evaluator = MockCkksEvaluator::new(params, slot_keys, config.noise_scale);
        tracing::info!(
            "Generated mock CKKS context {} ({} slots, depth {})",
            evaluator.context_id,
            evaluator.params.slot_count(),
            evaluator.params.max_level()
        );
        Ok(Self { evaluator })
    }
}

impl HomomorphicEvaluator for MockCkksContext {
    fn context_id(&self) -> &ContextId {
        self.evaluator.context_id()
    }

    fn params(&self) -> &SchemeParams {
        self.evaluator.params()
    }

    fn validate(&self, value: &Ciphertext) -> CryptoResult<()> {
        self.evaluator.validate(value)
    }

    fn encrypt(&self, values: &[f64]) -> CryptoResult<Ciphertext> {
        self.evaluator.encrypt(values)
    }

    fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.evaluator.add(lhs, rhs)
    }

    fn negate(&self, value: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.evaluator.negate(value)
    }

    fn multiply(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.evaluator.multiply(lhs, rhs)
    }

    fn sum_slots(&self, value: &Ciphertext) -> CryptoResult<Ciphertext> {
        self.evaluator.sum_slots(value)
    }
}

impl CipherContext for MockCkksContext {
    fn decrypt(&self, value: &Ciphertext) -> CryptoResult<Vec<f64>> {
        self.evaluator.decrypt_slots(value)
    }

    fn public_material(&self) -> PublicMaterial {
        PublicMaterial {
            backend: CipherBackend::MockCkks,
            context_id: self.evaluator.context_id.clone(),
            params: self.evaluator.params.clone(),
            // Serializing a Vec<f64> and an f64 cannot fail.
            key_material: self.evaluator.key_material().unwrap_or_default(),
        }
    }

    fn as_evaluator(&self) -> &dyn HomomorphicEvaluator {
        &self.evaluator
    }
}

fn fingerprint(slot_keys: &[f64]) -> ContextId {
    let mut hasher = blake3::Hasher::new();
    for key in slot_keys {
        hasher.update(&key.to_le_bytes());
    }
    let digest = hasher.finalize();
    ContextId(hex::encode(&digest.as_bytes()[..8]))
}
