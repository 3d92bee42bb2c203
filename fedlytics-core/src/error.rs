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

//! Cipher error types

use thiserror::Error;

use crate::cipher::ContextId;

/// Result type for cipher operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by a cipher context.
///
/// All of these are deterministic and signal a programming error on the
/// caller's side; none of them should be retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CryptoError {
    /// Malformed plaintext or ciphertext
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Operand slot counts cannot be combined
    #[error("Shape mismatch: {lhs} slots vs {rhs} slots")]
    ShapeMismatch { lhs: usize, rhs: usize },

    /// Operand was produced under a different context
    #[error("Context mismatch: expected {expected}, found {found}")]
    ContextMismatch { expected: ContextId, found: ContextId },

    /// Multiplicative depth of the modulus chain is used up
    #[error("Multiplicative depth exhausted (max level {max_level})")]
    DepthExhausted { max_level: u32 },

    /// Requested backend is not compiled into this build
    #[error("Cipher backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Key material could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for CryptoError {
    fn from(e: bincode::Error) -> Self {
        CryptoError::Serialization(e.to_string())
    }
}
