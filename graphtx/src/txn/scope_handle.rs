// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Caller-facing handle of one scope
//!
//! Ending a scope pops it from its stack. An owning scope that ends while its
//! transaction is still open rolls the transaction back: callers must commit
//! explicitly to persist anything. Prefer [`ScopeHandle::end`]; dropping the
//! handle does the same, with the rollback scheduled on the runtime.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::error::{Result, TransactionError};
use crate::txn::handle::TransactionHandle;
use crate::txn::scope::{ScopeRecord, TransactionContext};
use crate::txn::state::ScopeOption;

pub struct ScopeHandle {
    record: Arc<ScopeRecord>,
    context: TransactionContext,
}

impl ScopeHandle {
    pub(crate) fn new(record: Arc<ScopeRecord>, context: TransactionContext) -> Self {
        Self { record, context }
    }

    pub fn id(&self) -> u64 {
        self.record.id()
    }

    pub fn option(&self) -> ScopeOption {
        self.record.option()
    }

    pub fn is_owner(&self) -> bool {
        self.record.is_owner()
    }

    pub fn is_enlisted(&self) -> bool {
        self.record.is_enlisted()
    }

    /// Backend transaction of this scope; `None` when suppressed
    pub fn transaction(&self) -> Option<&Arc<TransactionHandle>> {
        self.record.handle()
    }

    /// State of the shared handle, whoever owns it
    pub fn is_open(&self) -> bool {
        self.record.handle().is_some_and(|h| h.is_open())
    }

    fn active_handle(&self, action: &str) -> Result<&Arc<TransactionHandle>> {
        self.record.handle().ok_or_else(|| {
            TransactionError::invalid(format!(
                "cannot {}: no transaction is active in suppressed mode",
                action
            ))
        })
    }

    /// Commit the transaction if this scope owns it.
    ///
    /// A joined or enlisted scope cannot end the transaction early: its
    /// commit only checks that the transaction is still open and leaves the
    /// decision to the owner or the unit of work.
    pub async fn commit(&self) -> Result<()> {
        let handle = self.active_handle("commit")?;
        if self.record.is_owner() {
            handle.commit().await
        } else {
            debug!(
                "Scope {} does not own transaction {}; commit deferred",
                self.record.id(),
                handle.id()
            );
            handle.state().ensure_open()
        }
    }

    /// Roll back the transaction, whether or not this scope owns it
    pub async fn rollback(&self) -> Result<()> {
        let handle = self.active_handle("roll back")?;
        if !self.record.is_owner() {
            info!(
                "Joined scope {} rolls back shared transaction {}",
                self.record.id(),
                handle.id()
            );
        }
        handle.rollback().await
    }

    pub async fn keep_alive(&self) -> Result<()> {
        self.active_handle("keep alive")?.keep_alive().await
    }

    /// End the scope, rolling back an owned transaction that is still open
    pub async fn end(self) -> Result<()> {
        finish_scope(&self.context, &self.record).await
    }
}

/// Pop `record` and settle what it owns. Runs once per scope.
pub(crate) async fn finish_scope(
    context: &TransactionContext,
    record: &Arc<ScopeRecord>,
) -> Result<()> {
    if !record.finish() {
        return Ok(());
    }
    context.remove(record);
    debug!(
        "Scope {} ended ({} scope(s) left)",
        record.id(),
        context.depth()
    );

    match record.handle() {
        Some(handle) if record.is_owner() && handle.is_open() => {
            if handle.abandon_locally() {
                debug!("Transaction {} abandoned before it began", handle.id());
                return Ok(());
            }
            info!(
                "Rolling back transaction {} of scope {} ended without commit",
                handle.id(),
                record.id()
            );
            handle.rollback().await
        }
        _ => Ok(()),
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        if !self.record.finish() {
            return;
        }
        self.context.remove(&self.record);

        let Some(handle) = self.record.handle() else {
            return;
        };
        if !self.record.is_owner() || !handle.is_open() || handle.abandon_locally() {
            return;
        }

        let handle = Arc::clone(handle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    "Scope {} dropped with transaction {} open; rolling back",
                    self.record.id(),
                    handle.id()
                );
                runtime.spawn(async move {
                    if let Err(e) = handle.rollback().await {
                        warn!("Rollback of abandoned transaction {} failed: {}", handle.id(), e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Scope {} dropped outside a runtime; transaction {} left to expire on the server",
                    self.record.id(),
                    handle.id()
                );
            }
        }
    }
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.record.id())
            .field("option", &self.record.option())
            .field("owner", &self.record.is_owner())
            .field("transaction", &self.record.handle())
            .finish()
    }
}
