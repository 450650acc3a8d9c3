// Copyright 2025 Lockstep Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lockstep_store::StoreError;
use thiserror::Error;

/// Lock operation related error types.
///
/// Contention is not an error: failing to acquire a lock, or releasing one
/// that is no longer held, surfaces as `Ok(None)` / `Ok(false)` from the
/// services. These variants cover caller defects and infrastructure faults.
#[derive(Error, Debug)]
pub enum LockError {
    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Shared store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LockError {
    /// Create invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create serialization error
    pub fn serialization(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if it is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            Self::Internal { .. } => true,
            _ => false,
        }
    }
}

/// Convert from serde_json::Error
impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON error", err)
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let invalid = LockError::invalid_argument("owner must not contain ':'");
        assert!(matches!(invalid, LockError::InvalidArgument { .. }));

        let config = LockError::configuration("ttl must be non-zero");
        assert!(matches!(config, LockError::Configuration { .. }));
    }

    #[test]
    fn test_error_retryable() {
        assert!(LockError::from(StoreError::unavailable("down")).is_retryable());
        assert!(LockError::internal("oops").is_retryable());
        assert!(!LockError::invalid_argument("bad").is_retryable());
        assert!(!LockError::configuration("bad").is_retryable());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: LockError = StoreError::wrong_type("k", "hash").into();
        assert!(matches!(err, LockError::Store(_)));
    }
}
