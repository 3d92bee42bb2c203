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

//! Cipher context configuration

use serde::{Deserialize, Serialize};

use crate::cipher::{CipherBackend, SchemeParams};
use crate::error::{CryptoError, CryptoResult};

/// Configuration for the coordinator's cipher context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    /// Backend implementation, chosen once at startup
    #[serde(default)]
    pub backend: CipherBackend,

    /// Ring dimension (power of two)
    #[serde(default = "default_poly_modulus_degree")]
    pub poly_modulus_degree: usize,

    /// Bit sizes of the coefficient modulus chain
    #[serde(default = "default_coeff_mod_bit_sizes")]
    pub coeff_mod_bit_sizes: Vec<u32>,

    /// Encoding scale as a power of two
    #[serde(default = "default_global_scale_bits")]
    pub global_scale_bits: u32,

    /// Magnitude of encryption noise added per slot
    #[serde(default = "default_noise_scale")]
    pub noise_scale: f64,

    /// Fixed key-generation seed (tests and reproducible runs only)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_poly_modulus_degree() -> usize {
    8192
}

fn default_coeff_mod_bit_sizes() -> Vec<u32> {
    vec![60, 40, 40, 40, 40, 40, 40, 60]
}

fn default_global_scale_bits() -> u32 {
    40
}

fn default_noise_scale() -> f64 {
    1e-9
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            backend: CipherBackend::default(),
            poly_modulus_degree: default_poly_modulus_degree(),
            coeff_mod_bit_sizes: default_coeff_mod_bit_sizes(),
            global_scale_bits: default_global_scale_bits(),
            noise_scale: default_noise_scale(),
            seed: None,
        }
    }
}

impl CipherConfig {
    pub fn scheme_params(&self) -> SchemeParams {
        SchemeParams {
            poly_modulus_degree: self.poly_modulus_degree,
            coeff_mod_bit_sizes: self.coeff_mod_bit_sizes.clone(),
            global_scale_bits: self.global_scale_bits,
        }
    }

    /// Validate parameters and backend availability
    pub fn validate(&self) -> CryptoResult<()> {
        if !self.backend.is_available() {
            return Err(CryptoError::BackendUnavailable(format!(
                "backend '{}' is not available in this build",
                self.backend.as_str()
            )));
        }

        if self.poly_modulus_degree < 1024 || !self.poly_modulus_degree.is_power_of_two() {
            return Err(CryptoError::Malformed(format!(
                "poly_modulus_degree must be a power of two >= 1024 (got {})",
                self.poly_modulus_degree
            )));
        }

        if self.coeff_mod_bit_sizes.len() < 3 {
            return Err(CryptoError::Malformed(
                "coeff_mod_bit_sizes needs at least one level between the special primes"
                    .to_string(),
            ));
        }

        if self
            .coeff_mod_bit_sizes
            .iter()
            .skip(1)
            .take(self.coeff_mod_bit_sizes.len() - 2)
            .any(|bits| *bits < self.global_scale_bits)
        {
            return Err(CryptoError::Malformed(format!(
                "intermediate primes must be at least {} bits",
                self.global_scale_bits
            )));
        }

        if !self.noise_scale.is_finite() || self.noise_scale < 0.0 {
            return Err(CryptoError::Malformed(format!(
                "noise_scale must be a non-negative number (got {})",
                self.noise_scale
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CipherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unavailable_backend() {
        let config = CipherConfig {
            backend: CipherBackend::Ckks,
            ..CipherConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CryptoError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_rejects_short_chain() {
        let config = CipherConfig {
            coeff_mod_bit_sizes: vec![60, 60],
            ..CipherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: CipherConfig =
            serde_json::from_str(r#"{"backend": "mock_ckks", "seed": 42}"#).unwrap();
        assert_eq!(config.backend, CipherBackend::MockCkks);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.poly_modulus_degree, 8192);
        assert_eq!(config.scheme_params().max_level(), 6);
    }
}
