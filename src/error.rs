// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error handling for collective operations
//!
//! Every failure surfaced by the selector, the scheduler or the node
//! synchronization layer is a `CclError`. None of them are retried.

use std::fmt;

use crate::coll::CollType;

/// Error codes reported through `Status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    Invalid = 4,
    IoError = 5,
    SerializationError = 11,
    ConfigurationError = 20,
    SelectionExhausted = 21,
    TransportFailure = 22,
    TableCorrupted = 23,
    SynchronizationError = 24,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::Invalid => write!(f, "Invalid"),
            Code::IoError => write!(f, "IO error"),
            Code::SerializationError => write!(f, "Serialization error"),
            Code::ConfigurationError => write!(f, "Configuration error"),
            Code::SelectionExhausted => write!(f, "Selection exhausted"),
            Code::TransportFailure => write!(f, "Transport failure"),
            Code::TableCorrupted => write!(f, "Selection table corrupted"),
            Code::SynchronizationError => write!(f, "Synchronization error"),
        }
    }
}

/// Main error type for collective operations
#[derive(thiserror::Error, Debug)]
pub enum CclError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Can not select algorithm: coll {coll}, size {size}: {reason}")]
    SelectionExhausted {
        coll: CollType,
        size: usize,
        reason: String,
    },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Selection table corrupted: {0}")]
    TableCorrupted(String),

    #[error("Synchronization error: {0}")]
    Synchronization(String),
}

impl CclError {
    pub fn config(message: impl Into<String>) -> Self {
        CclError::Configuration(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        CclError::Transport(message.into())
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        CclError::TableCorrupted(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        CclError::Invalid(message.into())
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            CclError::Io(_) => Code::IoError,
            CclError::Json(_) => Code::SerializationError,
            CclError::Invalid(_) => Code::Invalid,
            CclError::Configuration(_) => Code::ConfigurationError,
            CclError::SelectionExhausted { .. } => Code::SelectionExhausted,
            CclError::Transport(_) => Code::TransportFailure,
            CclError::TableCorrupted(_) => Code::TableCorrupted,
            CclError::Synchronization(_) => Code::SynchronizationError,
        }
    }
}

/// Type alias for Results using CclError
pub type CclResult<T> = Result<T, CclError>;

/// Completion status of a collective request, detached from the error value
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn get_code(&self) -> Code {
        self.code
    }

    pub fn get_msg(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<&CclError> for Status {
    fn from(error: &CclError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Build an error from a poisoned lock
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> CclError {
    CclError::Synchronization("lock poisoned by a panicked holder".to_string())
}
