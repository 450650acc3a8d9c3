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

use thiserror::Error;

/// Store operation related error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unreachable or refused the operation
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Key exists but holds a different data type than the operation expects
    #[error("Wrong type for key '{key}': {message}")]
    WrongType { key: String, message: String },

    /// Pub/sub channel has no live endpoint anymore
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    /// Internal error
    #[error("Internal store error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Create unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Create wrong type error
    pub fn wrong_type(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WrongType {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create channel closed error
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed { channel: channel.into() }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if it is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Internal { .. })
    }
}

/// Store operation Result type
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let unavailable = StoreError::unavailable("connection refused");
        assert!(matches!(unavailable, StoreError::Unavailable { .. }));

        let wrong_type = StoreError::wrong_type("locks:a", "expected string, found hash");
        assert!(matches!(wrong_type, StoreError::WrongType { .. }));
    }

    #[test]
    fn test_error_retryable() {
        assert!(StoreError::unavailable("down").is_retryable());
        assert!(StoreError::internal("oops").is_retryable());
        assert!(!StoreError::wrong_type("k", "hash").is_retryable());
        assert!(!StoreError::channel_closed("events").is_retryable());
    }
}
