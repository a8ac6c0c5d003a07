// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction handle over a binary-protocol driver session
//!
//! The driver does the heavy lifting; this wrapper only tracks state so the
//! coordination rules apply the same way they do for HTTP handles.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Result, TransactionError};
use crate::statement::{Statement, StatementBatch, StatementResult};
use crate::txn::handle::{HandleCore, Reservation};
use crate::txn::state::TransactionState;

/// Error reported by the driver
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    /// Server status code, when the failure came from the server
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl From<DriverError> for TransactionError {
    fn from(e: DriverError) -> Self {
        match e.code {
            Some(code)
                if code.ends_with("Transaction.TransactionNotFound")
                    || code.ends_with("Transaction.UnknownId") =>
            {
                TransactionError::expired()
            }
            Some(code) => TransactionError::StatementError {
                code,
                message: e.message,
            },
            None => TransactionError::TransportFailure(e.message),
        }
    }
}

/// A transaction opened on a driver session
#[async_trait]
pub trait SessionTransaction: Send + Sync {
    async fn run(&self, statement: &Statement) -> std::result::Result<StatementResult, DriverError>;
    async fn commit(&self) -> std::result::Result<(), DriverError>;
    async fn rollback(&self) -> std::result::Result<(), DriverError>;
}

/// Entry point of the driver: opens session transactions
#[async_trait]
pub trait GraphDriver: Send + Sync {
    async fn begin_transaction(
        &self,
        database: &str,
    ) -> std::result::Result<Box<dyn SessionTransaction>, DriverError>;
}

struct DriverStatus {
    state: TransactionState,
    failure: Option<TransactionError>,
}

pub struct DriverTransaction {
    pub(crate) core: HandleCore,
    tx: Arc<dyn SessionTransaction>,
    status: Mutex<DriverStatus>,
}

impl DriverTransaction {
    /// Open a session transaction right away
    pub(crate) async fn begin(driver: &dyn GraphDriver, database: String) -> Result<Self> {
        let tx = driver.begin_transaction(&database).await?;
        let core = HandleCore::new(database);
        debug!("Driver transaction {} begun on '{}'", core.id, core.database);

        Ok(Self {
            core,
            tx: Arc::from(tx),
            status: Mutex::new(DriverStatus {
                state: TransactionState::Open,
                failure: None,
            }),
        })
    }

    pub fn state(&self) -> TransactionState {
        self.status.lock().state
    }

    pub(crate) async fn execute_reserved(
        &self,
        reservation: Reservation,
        batch: StatementBatch,
    ) -> Result<Vec<StatementResult>> {
        reservation.wait_turn().await;
        self.state().ensure_open()?;

        let mut results = Vec::with_capacity(batch.len());
        for statement in &batch.statements {
            match self.tx.run(statement).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    let error = TransactionError::from(e);
                    let mut status = self.status.lock();
                    if error.is_statement_error() && status.failure.is_none() {
                        status.failure = Some(error.clone());
                    }
                    return Err(error);
                }
            }
        }
        Ok(results)
    }

    pub(crate) async fn commit(&self, batch: StatementBatch) -> Result<Vec<StatementResult>> {
        let pending = self.core.pending.count();
        if pending > 0 {
            return Err(TransactionError::invalid(format!(
                "cannot commit while {} operation(s) are pending",
                pending
            )));
        }

        let results = if batch.is_empty() {
            Vec::new()
        } else {
            let reservation = self.core.reserve();
            self.execute_reserved(reservation, batch).await?
        };

        let ticket = self.core.sequencer.issue();
        ticket.wait_turn().await;
        let failure = {
            let status = self.status.lock();
            status.state.ensure_open()?;
            status.failure.clone()
        };

        // A failed statement terminates the session transaction; report
        // the statement error, not the commit rejection that follows it
        if let Some(failure) = failure {
            if let Err(e) = self.tx.rollback().await {
                debug!("Ignoring rollback error after statement failure: {}", e);
            }
            self.status.lock().state = TransactionState::RolledBack;
            return Err(failure);
        }

        match self.tx.commit().await {
            Ok(()) => {
                self.status.lock().state = TransactionState::Committed;
                info!("Driver transaction {} committed", self.core.id);
                Ok(results)
            }
            Err(e) => {
                self.status.lock().state = TransactionState::RolledBack;
                Err(e.into())
            }
        }
    }

    pub(crate) async fn rollback(&self) -> Result<()> {
        let ticket = self.core.sequencer.issue();
        ticket.wait_turn().await;

        let had_failure = {
            let mut status = self.status.lock();
            status.state.ensure_open()?;
            status.state = TransactionState::RolledBack;
            status.failure.is_some()
        };

        match self.tx.rollback().await {
            Ok(()) => {
                info!("Driver transaction {} rolled back", self.core.id);
                Ok(())
            }
            Err(e) if had_failure => {
                debug!("Ignoring rollback error after statement failure: {}", e);
                Ok(())
            }
            Err(e) => match TransactionError::from(e) {
                // Already gone server-side; nothing left to undo
                closed if closed.is_closed() => Ok(()),
                other => Err(other),
            },
        }
    }

    /// The driver keeps its own connection alive
    pub(crate) async fn keep_alive(&self) -> Result<()> {
        self.state().ensure_open()
    }
}

impl Drop for DriverTransaction {
    fn drop(&mut self) {
        if self.status.get_mut().state != TransactionState::Open {
            return;
        }

        let tx = Arc::clone(&self.tx);
        let id = self.core.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Driver transaction {} dropped while open; rolling back", id);
                runtime.spawn(async move {
                    if let Err(e) = tx.rollback().await {
                        warn!("Rollback of dropped driver transaction {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Driver transaction {} dropped while open outside a runtime; the server will time it out",
                    id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_mapping() {
        let expired: TransactionError =
            DriverError::server("Neo.ClientError.Transaction.TransactionNotFound", "gone").into();
        assert!(expired.is_closed());

        let statement: TransactionError =
            DriverError::server("Neo.ClientError.Statement.SyntaxError", "bad").into();
        assert!(statement.is_statement_error());

        let transport: TransactionError = DriverError::connection("reset by peer").into();
        assert_eq!(transport, TransactionError::TransportFailure("reset by peer".to_string()));
    }
}
