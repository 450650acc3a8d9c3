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

/// Cache invalidation related error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

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
}

impl CacheError {
    /// Create invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create serialization error
    pub fn serialization(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Box::new(source),
        }
    }
}

/// Convert from serde_json::Error
impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON error", err)
    }
}

/// Cache operation Result type
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let invalid = CacheError::invalid_argument("cache type must not be empty");
        assert!(matches!(invalid, CacheError::InvalidArgument { .. }));

        let store: CacheError = StoreError::unavailable("down").into();
        assert!(matches!(store, CacheError::Store(_)));
    }
}
