//! Error taxonomy at the store boundary.
//!
//! Everything below the store façade works with `anyhow::Result`; the façade
//! translates into [`StoreError`] so transports never see raw SQLite errors
//! except as the diagnostic `detail` string.

use serde::Serialize;
use thiserror::Error;

/// Stable classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    StorageUnavailable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid field `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("observation {id} not found")]
    NotFound { id: i64 },

    #[error("storage unavailable during {operation}")]
    StorageUnavailable {
        operation: &'static str,
        detail: String,
    },
}

impl StoreError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an internal failure, keeping the full context chain as detail.
    pub fn storage(operation: &'static str, err: anyhow::Error) -> Self {
        Self::StorageUnavailable {
            operation,
            detail: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
        }
    }

    /// Supplementary diagnostic text, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::StorageUnavailable { detail, .. } => Some(detail),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
