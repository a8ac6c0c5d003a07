// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transactional HTTP endpoint: transport boundary and wire format
//!
//! Requests:
//! - `POST {root}{prefix}` begins a transaction with the first batch
//! - `POST {location}` runs more statements, or keeps alive with none
//! - `POST {location}/commit` commits
//! - `DELETE {location}` rolls back

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::Credentials;
use crate::error::TransactionError;
use crate::statement::{StatementBatch, StatementResult};

/// HTTP verbs used by the transactional endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Delete,
}

/// A request handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub body: Option<Value>,
    pub credentials: Option<Credentials>,
    pub user_agent: String,
    /// Ask the server for a streamed JSON response
    pub stream: bool,
}

/// What the transport got back
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// `Location` header, present when a transaction was created
    pub location: Option<String>,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            location: None,
            body,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Failure below HTTP semantics: connection refused, reset, timeout
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends requests to the server. Retries, pooling and TLS live behind this.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Serialize)]
struct WireStatement<'a> {
    statement: &'a str,
    parameters: &'a Map<String, Value>,
    #[serde(rename = "resultDataContents")]
    result_data_contents: [&'static str; 1],
}

#[derive(Serialize)]
struct WireRequest<'a> {
    statements: Vec<WireStatement<'a>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireResponse {
    #[serde(default)]
    results: Vec<WireResult>,
    #[serde(default)]
    errors: Vec<WireError>,
    #[serde(default)]
    transaction: Option<WireTransaction>,
}

#[derive(Debug, Default, Deserialize)]
struct WireResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<WireRow>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireTransaction {
    expires: Option<String>,
}

/// Body for a statement batch; an empty batch doubles as keep-alive
pub(crate) fn request_body(batch: &StatementBatch) -> Value {
    let request = WireRequest {
        statements: batch
            .statements
            .iter()
            .map(|s| WireStatement {
                statement: &s.text,
                parameters: &s.parameters,
                result_data_contents: ["row"],
            })
            .collect(),
    };
    serde_json::to_value(request).unwrap_or_else(|_| serde_json::json!({ "statements": [] }))
}

/// Successful response, already checked for errors
#[derive(Debug, Default)]
pub(crate) struct TransactionResponse {
    pub results: Vec<StatementResult>,
    pub location: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a response could not be accepted
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProtocolFailure {
    /// The server no longer knows the transaction id
    UnknownTransaction,
    /// A statement failed; `errors[0]` of the body
    Statement { code: String, message: String },
    /// Anything else, including malformed bodies
    Transport(String),
}

impl ProtocolFailure {
    pub(crate) fn into_error(self) -> TransactionError {
        match self {
            ProtocolFailure::UnknownTransaction => TransactionError::expired(),
            ProtocolFailure::Statement { code, message } => {
                TransactionError::StatementError { code, message }
            }
            ProtocolFailure::Transport(message) => TransactionError::TransportFailure(message),
        }
    }
}

impl From<TransportError> for ProtocolFailure {
    fn from(e: TransportError) -> Self {
        ProtocolFailure::Transport(e.0)
    }
}

fn is_unknown_transaction_code(code: &str) -> bool {
    code.ends_with("Transaction.UnknownId")
        || code.ends_with("Transaction.TransactionNotFound")
        || code.ends_with("Request.UnknownTransaction")
}

/// Map a raw response onto success or one failure class
pub(crate) fn interpret(response: HttpResponse) -> Result<TransactionResponse, ProtocolFailure> {
    let status = response.status;
    let body: WireResponse = if response.body.is_null() {
        WireResponse::default()
    } else {
        serde_json::from_value(response.body).map_err(|e| {
            ProtocolFailure::Transport(format!("Malformed response body (HTTP {}): {}", status, e))
        })?
    };

    if let Some(error) = body.errors.first() {
        if is_unknown_transaction_code(&error.code) {
            return Err(ProtocolFailure::UnknownTransaction);
        }
        if status != 404 && status < 500 {
            return Err(ProtocolFailure::Statement {
                code: error.code.clone(),
                message: error.message.clone(),
            });
        }
    }

    match status {
        200..=299 => {}
        404 if body.errors.is_empty() => return Err(ProtocolFailure::UnknownTransaction),
        other => {
            let detail = body
                .errors
                .first()
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "no error details".to_string());
            return Err(ProtocolFailure::Transport(format!("HTTP {} ({})", other, detail)));
        }
    }

    let expires_at = body
        .transaction
        .and_then(|t| t.expires)
        .and_then(|raw| match DateTime::parse_from_rfc2822(&raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(e) => {
                log::warn!("Ignoring unparseable transaction expiry '{}': {}", raw, e);
                None
            }
        });

    Ok(TransactionResponse {
        results: body
            .results
            .into_iter()
            .map(|r| StatementResult {
                columns: r.columns,
                rows: r.data.into_iter().map(|d| d.row).collect(),
            })
            .collect(),
        location: response.location,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::Statement;
    use serde_json::json;

    #[test]
    fn test_request_body_shape() {
        let batch = StatementBatch::single(Statement::new("RETURN $x AS x").with_parameter("x", 1));
        let body = request_body(&batch);
        assert_eq!(
            body,
            json!({
                "statements": [{
                    "statement": "RETURN $x AS x",
                    "parameters": { "x": 1 },
                    "resultDataContents": ["row"]
                }]
            })
        );
        assert_eq!(request_body(&StatementBatch::new()), json!({ "statements": [] }));
    }

    #[test]
    fn test_interpret_success() {
        let response = HttpResponse::new(
            201,
            json!({
                "results": [{ "columns": ["x"], "data": [{ "row": [1] }] }],
                "errors": [],
                "commit": "http://localhost:7474/db/neo4j/tx/7/commit",
                "transaction": { "expires": "Tue, 24 Sep 2024 10:00:00 +0000" }
            }),
        )
        .with_location("http://localhost:7474/db/neo4j/tx/7");

        let parsed = interpret(response).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].first("x"), Some(&json!(1)));
        assert_eq!(parsed.location.as_deref(), Some("http://localhost:7474/db/neo4j/tx/7"));
        assert_eq!(
            parsed.expires_at.unwrap().to_rfc3339(),
            "2024-09-24T10:00:00+00:00"
        );
    }

    #[test]
    fn test_interpret_statement_error() {
        let response = HttpResponse::new(
            200,
            json!({
                "results": [],
                "errors": [{ "code": "Neo.ClientError.Statement.SyntaxError", "message": "bad" }]
            }),
        );
        assert_eq!(
            interpret(response).unwrap_err(),
            ProtocolFailure::Statement {
                code: "Neo.ClientError.Statement.SyntaxError".to_string(),
                message: "bad".to_string()
            }
        );
    }

    #[test]
    fn test_interpret_unknown_transaction() {
        let legacy = HttpResponse::new(
            404,
            json!({ "errors": [{ "code": "Neo.ClientError.Transaction.UnknownId", "message": "gone" }] }),
        );
        assert_eq!(interpret(legacy).unwrap_err(), ProtocolFailure::UnknownTransaction);

        let modern = HttpResponse::new(
            404,
            json!({ "errors": [{ "code": "Neo.ClientError.Transaction.TransactionNotFound", "message": "gone" }] }),
        );
        assert_eq!(interpret(modern).unwrap_err(), ProtocolFailure::UnknownTransaction);

        assert_eq!(
            interpret(HttpResponse::new(404, Value::Null)).unwrap_err(),
            ProtocolFailure::UnknownTransaction
        );
    }

    #[test]
    fn test_interpret_server_error() {
        let failure = interpret(HttpResponse::new(503, Value::Null)).unwrap_err();
        assert!(matches!(failure, ProtocolFailure::Transport(msg) if msg.contains("503")));
    }
}
