// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Backend transaction handles
//!
//! One handle is one transaction on the server. The transport is chosen when
//! the connection is negotiated, so the handle is a sum type over the two
//! implementations rather than a trait object.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::TransportKind;
use crate::error::Result;
use crate::statement::{StatementBatch, StatementResult};
use crate::txn::driver::DriverTransaction;
use crate::txn::http::HttpTransaction;
use crate::txn::sequencer::{RequestSequencer, Ticket};
use crate::txn::state::TransactionState;

/// Number of statement executions initiated but not yet finished
#[derive(Debug, Default)]
pub(crate) struct PendingCounter(Arc<AtomicUsize>);

impl PendingCounter {
    pub(crate) fn begin(&self) -> PendingOperation {
        self.0.fetch_add(1, Ordering::SeqCst);
        PendingOperation(Arc::clone(&self.0))
    }

    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts as pending until dropped
pub(crate) struct PendingOperation(Arc<AtomicUsize>);

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A statement execution's place in line, taken when it is initiated
pub(crate) struct Reservation {
    _pending: PendingOperation,
    ticket: Ticket,
}

impl Reservation {
    pub(crate) async fn wait_turn(&self) {
        self.ticket.wait_turn().await;
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.ticket.number()
    }
}

/// Bookkeeping shared by both handle kinds
pub(crate) struct HandleCore {
    pub(crate) id: Uuid,
    pub(crate) database: String,
    pub(crate) pending: PendingCounter,
    pub(crate) sequencer: Arc<RequestSequencer>,
}

impl HandleCore {
    pub(crate) fn new(database: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            database,
            pending: PendingCounter::default(),
            sequencer: RequestSequencer::new(),
        }
    }

    pub(crate) fn reserve(&self) -> Reservation {
        Reservation {
            _pending: self.pending.begin(),
            ticket: self.sequencer.issue(),
        }
    }
}

/// One backend transaction
pub enum TransactionHandle {
    Http(HttpTransaction),
    Driver(DriverTransaction),
}

impl TransactionHandle {
    fn core(&self) -> &HandleCore {
        match self {
            TransactionHandle::Http(tx) => &tx.core,
            TransactionHandle::Driver(tx) => &tx.core,
        }
    }

    /// Identifier for logs and diagnostics; not the server's transaction id
    pub fn id(&self) -> Uuid {
        self.core().id
    }

    pub fn database(&self) -> &str {
        &self.core().database
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            TransactionHandle::Http(_) => TransportKind::Http,
            TransactionHandle::Driver(_) => TransportKind::Driver,
        }
    }

    pub fn state(&self) -> TransactionState {
        match self {
            TransactionHandle::Http(tx) => tx.state(),
            TransactionHandle::Driver(tx) => tx.state(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Whether a transaction exists on the server yet
    pub fn is_begun(&self) -> bool {
        match self {
            TransactionHandle::Http(tx) => tx.is_begun(),
            TransactionHandle::Driver(_) => true,
        }
    }

    /// Transaction resource URI of an HTTP handle that has begun
    pub fn location(&self) -> Option<String> {
        match self {
            TransactionHandle::Http(tx) => tx.location(),
            TransactionHandle::Driver(_) => None,
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.core().pending.count()
    }

    /// Run a statement batch inside this transaction.
    ///
    /// The operation counts as pending, and takes its place in the request
    /// order, as soon as this is called, before the future is first polled.
    pub fn execute(
        &self,
        batch: impl Into<StatementBatch>,
    ) -> impl Future<Output = Result<Vec<StatementResult>>> + Send + '_ {
        let reservation = self.core().reserve();
        let batch = batch.into();
        async move {
            match self {
                TransactionHandle::Http(tx) => tx.execute_reserved(reservation, batch).await,
                TransactionHandle::Driver(tx) => tx.execute_reserved(reservation, batch).await,
            }
        }
    }

    pub async fn commit(&self) -> Result<()> {
        self.commit_with(StatementBatch::new()).await.map(|_| ())
    }

    /// Commit, running a final batch as part of the commit request
    pub async fn commit_with(&self, batch: StatementBatch) -> Result<Vec<StatementResult>> {
        match self {
            TransactionHandle::Http(tx) => tx.commit(batch).await,
            TransactionHandle::Driver(tx) => tx.commit(batch).await,
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        match self {
            TransactionHandle::Http(tx) => tx.rollback().await,
            TransactionHandle::Driver(tx) => tx.rollback().await,
        }
    }

    pub async fn keep_alive(&self) -> Result<()> {
        match self {
            TransactionHandle::Http(tx) => tx.keep_alive().await,
            TransactionHandle::Driver(tx) => tx.keep_alive().await,
        }
    }

    /// Close without I/O when nothing exists server-side
    pub(crate) fn abandon_locally(&self) -> bool {
        match self {
            TransactionHandle::Http(tx) => tx.abandon_locally(),
            TransactionHandle::Driver(_) => false,
        }
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id())
            .field("transport", &self.transport())
            .field("database", &self.database())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_counter_tracks_guards() {
        let counter = PendingCounter::default();
        let first = counter.begin();
        let second = counter.begin();
        assert_eq!(counter.count(), 2);
        drop(first);
        assert_eq!(counter.count(), 1);
        drop(second);
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_reservations_are_sequenced() {
        let core = HandleCore::new("neo4j".to_string());
        let a = core.reserve();
        let b = core.reserve();
        assert_eq!(a.sequence() + 1, b.sequence());
        assert_eq!(core.pending.count(), 2);
    }
}
