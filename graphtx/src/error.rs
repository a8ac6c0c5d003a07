// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Error types for transaction coordination
//!
//! Every failure coming out of a transport or driver collaborator is
//! translated into [`TransactionError`] before it leaves this crate.

use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Main error type for transaction coordination
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    /// No server handshake has completed for this manager
    #[error("Not ready: the client is not connected to a server")]
    NotReady,

    /// Operation attempted on a committed or rolled back transaction
    #[error("Closed transaction: {0}")]
    ClosedTransaction(String),

    /// Feature not supported by the connected server or transport
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Protocol misuse by the caller
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Network or HTTP failure other than transaction expiry
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Statement-level failure reported by the server
    #[error("Statement error [{code}]: {message}")]
    StatementError { code: String, message: String },

    /// Enlistment, promotion or recovery failure
    #[error("Coordination failure: {0}")]
    Coordination(String),

    /// Invalid execution configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TransactionError {
    pub fn closed(message: impl Into<String>) -> Self {
        TransactionError::ClosedTransaction(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        TransactionError::InvalidOperation(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        TransactionError::UnsupportedOperation(message.into())
    }

    /// The error surfaced when the server no longer knows the transaction
    pub(crate) fn expired() -> Self {
        TransactionError::ClosedTransaction(
            "the transaction has expired or was rolled back on the server".to_string(),
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransactionError::ClosedTransaction(_))
    }

    pub fn is_statement_error(&self) -> bool {
        matches!(self, TransactionError::StatementError { .. })
    }

    /// Only raw transport failures are worth retrying, and not at this layer
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransactionError::TransportFailure(_))
    }
}

impl From<serde_json::Error> for TransactionError {
    fn from(e: serde_json::Error) -> Self {
        TransactionError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for TransactionError {
    fn from(e: std::io::Error) -> Self {
        TransactionError::Coordination(format!("I/O error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransactionError::StatementError {
            code: "Neo.ClientError.Statement.SyntaxError".to_string(),
            message: "Invalid input".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Statement error [Neo.ClientError.Statement.SyntaxError]: Invalid input"
        );
        assert!(err.is_statement_error());
        assert!(!err.is_closed());
    }

    #[test]
    fn test_expired_surfaces_as_closed() {
        assert!(TransactionError::expired().is_closed());
    }

    #[test]
    fn test_only_transport_failures_are_retryable() {
        assert!(TransactionError::TransportFailure("reset".to_string()).is_retryable());
        assert!(!TransactionError::closed("done").is_retryable());
        assert!(!TransactionError::NotReady.is_retryable());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: TransactionError = parse.unwrap_err().into();
        assert!(matches!(err, TransactionError::Serialization(_)));
    }
}
