// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction handle over the transactional HTTP endpoint
//!
//! There is no free-standing begin call: the first statement batch is posted
//! to the begin endpoint and the `Location` of the response identifies the
//! transaction from then on. A handle that never ran a statement never talks
//! to the server at all.

pub mod keep_alive;
pub mod protocol;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::ExecutionConfiguration;
use crate::error::{Result, TransactionError};
use crate::statement::{StatementBatch, StatementResult};
use crate::txn::handle::{HandleCore, Reservation};
use crate::txn::state::TransactionState;
use crate::version::ServerVersion;

pub use protocol::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};
use protocol::{interpret, request_body, ProtocolFailure, TransactionResponse};

struct HttpStatus {
    state: TransactionState,
    /// Transaction resource URI; `None` until the begin request succeeded
    location: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    /// First statement error seen by this transaction
    failure: Option<TransactionError>,
}

pub struct HttpTransaction {
    pub(crate) core: HandleCore,
    transport: Arc<dyn HttpTransport>,
    config: Arc<ExecutionConfiguration>,
    version: ServerVersion,
    status: Mutex<HttpStatus>,
}

impl HttpTransaction {
    pub(crate) fn new(
        transport: Arc<dyn HttpTransport>,
        config: Arc<ExecutionConfiguration>,
        version: ServerVersion,
        database: String,
    ) -> Self {
        Self {
            core: HandleCore::new(database),
            transport,
            config,
            version,
            status: Mutex::new(HttpStatus {
                state: TransactionState::Open,
                location: None,
                expires_at: None,
                failure: None,
            }),
        }
    }

    /// Handle for a transaction that already exists on the server
    pub(crate) fn attach(
        transport: Arc<dyn HttpTransport>,
        config: Arc<ExecutionConfiguration>,
        version: ServerVersion,
        database: String,
        location: String,
    ) -> Self {
        let handle = Self::new(transport, config, version, database);
        handle.status.lock().location = Some(location);
        handle
    }

    pub fn state(&self) -> TransactionState {
        self.status.lock().state
    }

    /// Whether the begin request has gone out successfully
    pub fn is_begun(&self) -> bool {
        self.status.lock().location.is_some()
    }

    pub fn location(&self) -> Option<String> {
        self.status.lock().location.clone()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().expires_at
    }

    fn begin_uri(&self) -> String {
        format!(
            "{}{}",
            self.config.root_uri,
            self.version.transaction_endpoint(&self.core.database)
        )
    }

    fn request(
        &self,
        method: HttpMethod,
        uri: String,
        body: Option<serde_json::Value>,
    ) -> HttpRequest {
        HttpRequest {
            method,
            uri,
            body,
            credentials: self.config.credentials.clone(),
            user_agent: self.config.user_agent.clone(),
            stream: self.config.use_json_stream,
        }
    }

    async fn post(
        &self,
        uri: String,
        batch: &StatementBatch,
    ) -> std::result::Result<TransactionResponse, ProtocolFailure> {
        let request = self.request(HttpMethod::Post, uri, Some(request_body(batch)));
        let response = self.transport.send(request).await?;
        let location = response.location.clone();
        let outcome = interpret(response);

        // Older servers keep the transaction open after a statement error
        if let (Err(ProtocolFailure::Statement { .. }), Some(location)) = (&outcome, location) {
            if !self.version.rolls_back_on_statement_error() {
                let mut status = self.status.lock();
                if status.location.is_none() {
                    status.location = Some(location);
                }
            }
        }
        outcome
    }

    /// Record what a successful response tells us about the transaction
    fn absorb(&self, response: &TransactionResponse) -> Result<()> {
        let mut status = self.status.lock();
        if status.location.is_none() {
            let location = response.location.clone().ok_or_else(|| {
                TransactionError::TransportFailure(
                    "begin response did not carry a transaction location".to_string(),
                )
            })?;
            debug!("HTTP transaction {} begun at {}", self.core.id, location);
            status.location = Some(location);
        }
        if response.expires_at.is_some() {
            status.expires_at = response.expires_at;
        }
        Ok(())
    }

    /// The error for a transaction the server no longer knows
    fn vanished(&self) -> TransactionError {
        self.status.lock().state = TransactionState::RolledBack;
        TransactionError::expired()
    }

    /// Keep the first statement error. On servers that roll back on
    /// statement errors the handle ends with it, begun or not.
    fn record_failure(&self, failure: ProtocolFailure) -> TransactionError {
        let error = failure.into_error();
        if error.is_statement_error() {
            let mut status = self.status.lock();
            if status.failure.is_none() {
                status.failure = Some(error.clone());
            }
            if self.version.rolls_back_on_statement_error()
                && status.state == TransactionState::Open
            {
                status.state = TransactionState::RolledBack;
                info!(
                    "HTTP transaction {} rolled back by the server after a statement error",
                    self.core.id
                );
            }
        }
        error
    }

    /// Statement error that made the server roll this transaction back
    fn server_rollback_cause(
        status: &HttpStatus,
        version: ServerVersion,
    ) -> Option<&TransactionError> {
        match (&status.failure, status.state) {
            (Some(failure), TransactionState::RolledBack)
                if version.rolls_back_on_statement_error() =>
            {
                Some(failure)
            }
            _ => None,
        }
    }

    pub(crate) async fn execute_reserved(
        &self,
        reservation: Reservation,
        batch: StatementBatch,
    ) -> Result<Vec<StatementResult>> {
        reservation.wait_turn().await;

        let location = {
            let status = self.status.lock();
            status.state.ensure_open()?;
            status.location.clone()
        };
        let begun = location.is_some();
        let uri = location.unwrap_or_else(|| self.begin_uri());

        debug!(
            "HTTP transaction {} sending {} statement(s) (request #{})",
            self.core.id,
            batch.len(),
            reservation.sequence()
        );

        match self.post(uri, &batch).await {
            Ok(response) => {
                self.absorb(&response)?;
                Ok(response.results)
            }
            Err(ProtocolFailure::UnknownTransaction) if begun => Err(self.vanished()),
            Err(ProtocolFailure::UnknownTransaction) => Err(TransactionError::TransportFailure(
                "server rejected the transaction begin request".to_string(),
            )),
            Err(failure) => Err(self.record_failure(failure)),
        }
    }

    pub(crate) async fn keep_alive(&self) -> Result<()> {
        let ticket = self.core.sequencer.issue();
        ticket.wait_turn().await;

        let location = {
            let status = self.status.lock();
            status.state.ensure_open()?;
            status.location.clone()
        };
        // Nothing exists server-side yet
        let Some(location) = location else {
            return Ok(());
        };

        match self.post(location, &StatementBatch::new()).await {
            Ok(response) => self.absorb(&response),
            Err(ProtocolFailure::UnknownTransaction) => Err(self.vanished()),
            Err(failure) => Err(self.record_failure(failure)),
        }
    }

    pub(crate) async fn commit(&self, batch: StatementBatch) -> Result<Vec<StatementResult>> {
        let pending = self.core.pending.count();
        if pending > 0 {
            return Err(TransactionError::invalid(format!(
                "cannot commit while {} operation(s) are pending",
                pending
            )));
        }

        let ticket = self.core.sequencer.issue();
        ticket.wait_turn().await;

        let location = {
            let status = self.status.lock();
            // The caller sees the statement error, not a closed transaction
            if let Some(cause) = Self::server_rollback_cause(&status, self.version) {
                return Err(cause.clone());
            }
            status.state.ensure_open()?;
            status.location.clone()
        };

        let uri = match location {
            Some(location) => format!("{}/commit", location),
            None if batch.is_empty() => {
                debug!("HTTP transaction {} committed without any request", self.core.id);
                self.status.lock().state = TransactionState::Committed;
                return Ok(Vec::new());
            }
            None => format!("{}/commit", self.begin_uri()),
        };

        match self.post(uri, &batch).await {
            Ok(response) => {
                self.status.lock().state = TransactionState::Committed;
                info!("HTTP transaction {} committed", self.core.id);
                Ok(response.results)
            }
            Err(ProtocolFailure::UnknownTransaction) => Err(self.vanished()),
            Err(ProtocolFailure::Transport(message)) => {
                // Outcome unknown; the owner may still roll back
                Err(TransactionError::TransportFailure(message))
            }
            Err(failure) => {
                // A failed commit ends the transaction on the server
                self.status.lock().state = TransactionState::RolledBack;
                Err(failure.into_error())
            }
        }
    }

    pub(crate) async fn rollback(&self) -> Result<()> {
        let ticket = self.core.sequencer.issue();
        ticket.wait_turn().await;

        let location = {
            let mut status = self.status.lock();
            if Self::server_rollback_cause(&status, self.version).is_some() {
                debug!(
                    "HTTP transaction {} already rolled back by the server",
                    self.core.id
                );
                return Ok(());
            }
            status.state.ensure_open()?;
            let location = status.location.clone();
            if location.is_none() {
                status.state = TransactionState::RolledBack;
            }
            location
        };
        let Some(location) = location else {
            debug!("HTTP transaction {} rolled back before it began", self.core.id);
            return Ok(());
        };

        let request = self.request(HttpMethod::Delete, location, None);
        let outcome = match self.transport.send(request).await {
            Ok(response) => interpret(response).map(|_| ()),
            Err(e) => Err(ProtocolFailure::from(e)),
        };
        self.status.lock().state = TransactionState::RolledBack;

        match outcome {
            Ok(()) => {
                info!("HTTP transaction {} rolled back", self.core.id);
                Ok(())
            }
            Err(ProtocolFailure::UnknownTransaction) => {
                debug!(
                    "HTTP transaction {} was already gone on the server",
                    self.core.id
                );
                Ok(())
            }
            Err(failure) => Err(failure.into_error()),
        }
    }

    /// Mark an unbegun transaction rolled back without any I/O.
    ///
    /// Returns false when a server-side transaction exists and a real
    /// rollback is required.
    pub(crate) fn abandon_locally(&self) -> bool {
        let mut status = self.status.lock();
        if status.location.is_none() && status.state == TransactionState::Open {
            status.state = TransactionState::RolledBack;
            return true;
        }
        false
    }
}
