// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::{io, result};

use arrow_schema::ArrowError;
use itertools::Itertools;
use url::Url;

/// Result type for operations that could result in a [MergeError]
pub type Result<T, E = MergeError> = result::Result<T, E>;

/// Errors raised by the exchange merge.
///
/// `ContractViolation` and `UnsupportedOperation` indicate a bug in the
/// calling scheduler and are never recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("failed to deserialize page from {location}: {source}")]
    Deserialization {
        location: String,
        #[source]
        source: ArrowError,
    },

    #[error("transport error for {location}: {message}")]
    Transport { location: String, message: String },

    #[error("failed to close {} resource(s): [{}]", .0.len(), .0.iter().join("; "))]
    Close(Vec<MergeError>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error(
        "Internal error: {0}.\nThis was likely caused by a bug in LakeSoul's \
        code and we would welcome that you file an bug report in our issue tracker"
    )]
    Internal(String),
}

impl MergeError {
    pub(crate) fn transport(location: &Url, message: impl Into<String>) -> Self {
        MergeError::Transport {
            location: location.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn deserialization(location: &Url, source: ArrowError) -> Self {
        MergeError::Deserialization {
            location: location.to_string(),
            source,
        }
    }

    /// Whether the error signals a scheduler bug rather than a data or
    /// transport failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            MergeError::ContractViolation(_) | MergeError::UnsupportedOperation(_)
        )
    }
}

impl From<MergeError> for io::Error {
    fn from(e: MergeError) -> Self {
        io::Error::other(e)
    }
}
