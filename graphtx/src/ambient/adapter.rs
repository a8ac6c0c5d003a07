// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Participant wrapping a transaction handle in an ambient unit of work

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::recovery::{RecoveryDescriptor, RecoveryStore};
use super::{Enlistable, UnitOfWork, Vote};
use crate::config::ExecutionConfiguration;
use crate::error::{Result, TransactionError};
use crate::txn::handle::TransactionHandle;
use crate::version::ServerVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnlistmentMode {
    /// Sole participant; the coordinator delegates the decision to us
    SinglePhaseFastPath,
    /// Completed through prepare / commit / rollback
    PromotedTwoPhase,
}

/// Live enlistments of one manager, one per unit of work
#[derive(Default)]
pub(crate) struct EnlistmentRegistry {
    entries: Mutex<HashMap<Uuid, Arc<EnlistmentAdapter>>>,
}

impl EnlistmentRegistry {
    pub(crate) fn get(&self, unit_of_work_id: &Uuid) -> Option<Arc<EnlistmentAdapter>> {
        self.entries.lock().get(unit_of_work_id).cloned()
    }

    pub(crate) fn insert(&self, adapter: Arc<EnlistmentAdapter>) {
        self.entries.lock().insert(adapter.unit_of_work_id, adapter);
    }

    pub(crate) fn remove(&self, unit_of_work_id: &Uuid) -> Option<Arc<EnlistmentAdapter>> {
        self.entries.lock().remove(unit_of_work_id)
    }

    /// Enlistments whose unit of work is still alive
    pub(crate) fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|adapter| !adapter.is_abandoned())
            .count()
    }

    /// Remove and return enlistments whose unit of work was dropped
    pub(crate) fn take_abandoned(&self) -> Vec<Arc<EnlistmentAdapter>> {
        let mut entries = self.entries.lock();
        let abandoned: Vec<Uuid> = entries
            .iter()
            .filter(|(_, adapter)| adapter.is_abandoned())
            .map(|(id, _)| *id)
            .collect();
        abandoned
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect()
    }
}

/// Enlistment record of one handle in one unit of work
pub struct EnlistmentAdapter {
    unit_of_work_id: Uuid,
    /// Held weakly: a unit of work dropped without completing abandons us
    unit: Weak<dyn UnitOfWork>,
    resource_manager_id: Uuid,
    handle: Arc<TransactionHandle>,
    mode: Mutex<EnlistmentMode>,
    store: Arc<dyn RecoveryStore>,
    registry: Weak<EnlistmentRegistry>,
}

impl EnlistmentAdapter {
    /// Create the adapter and persist its recovery descriptor
    pub(crate) fn create(
        unit: &Arc<dyn UnitOfWork>,
        handle: Arc<TransactionHandle>,
        config: &ExecutionConfiguration,
        server_version: ServerVersion,
        store: Arc<dyn RecoveryStore>,
        registry: &Arc<EnlistmentRegistry>,
    ) -> Result<Arc<Self>> {
        let unit_of_work_id = unit.id();
        let descriptor = RecoveryDescriptor {
            resource_manager_id: config.resource_manager_id,
            unit_of_work_id,
            configuration: config.clone(),
            transport: handle.transport(),
            server_version,
            database: handle.database().to_string(),
            location: handle.location(),
            recorded_at: Utc::now(),
        };
        store.save(&descriptor)?;

        Ok(Arc::new(Self {
            unit_of_work_id,
            unit: Arc::downgrade(unit),
            resource_manager_id: config.resource_manager_id,
            handle,
            mode: Mutex::new(EnlistmentMode::SinglePhaseFastPath),
            store,
            registry: Arc::downgrade(registry),
        }))
    }

    pub fn unit_of_work_id(&self) -> Uuid {
        self.unit_of_work_id
    }

    pub fn handle(&self) -> &Arc<TransactionHandle> {
        &self.handle
    }

    pub fn mode(&self) -> EnlistmentMode {
        *self.mode.lock()
    }

    /// The unit of work was dropped without reporting completion
    pub fn is_abandoned(&self) -> bool {
        self.unit.strong_count() == 0
    }

    /// Settle an abandoned enlistment: nobody will ever decide, so roll back
    pub(crate) async fn abandon(&self) {
        warn!(
            "Unit of work {} was dropped without completing; rolling back transaction {}",
            self.unit_of_work_id,
            self.handle.id()
        );
        match self.end_handle().await {
            Ok(()) => self.complete(false),
            // Outcome unknown; keep the descriptor so recovery can finish it
            Err(e @ TransactionError::TransportFailure(_)) => {
                warn!(
                    "Rollback of abandoned unit of work {} is in doubt: {}",
                    self.unit_of_work_id, e
                );
                self.complete(true);
            }
            Err(e) => {
                debug!("Ignoring rollback error for abandoned unit of work: {}", e);
                self.complete(false);
            }
        }
    }

    /// Write the current transaction location into the stored descriptor
    fn refresh_descriptor(&self) -> Result<()> {
        let mut descriptor = self
            .store
            .load(self.resource_manager_id, self.unit_of_work_id)?
            .ok_or_else(|| {
                TransactionError::Coordination(format!(
                    "no recovery descriptor for unit of work {}",
                    self.unit_of_work_id
                ))
            })?;
        descriptor.location = self.handle.location();
        descriptor.recorded_at = Utc::now();
        self.store.save(&descriptor)
    }

    /// Roll back the handle if it is still open, keeping the first error
    async fn end_handle(&self) -> Result<()> {
        if !self.handle.is_open() {
            return Ok(());
        }
        self.handle.rollback().await
    }

    /// The coordinator reported completion: forget this enlistment
    fn complete(&self, keep_descriptor: bool) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.unit_of_work_id);
        }
        if keep_descriptor {
            return;
        }
        if let Err(e) = self
            .store
            .remove(self.resource_manager_id, self.unit_of_work_id)
        {
            warn!(
                "Could not remove recovery descriptor for unit of work {}: {}",
                self.unit_of_work_id, e
            );
        }
    }
}

#[async_trait]
impl Enlistable for EnlistmentAdapter {
    fn resource_manager_id(&self) -> Uuid {
        self.resource_manager_id
    }

    async fn single_phase_commit(&self) -> Result<()> {
        let outcome = self.handle.commit().await;
        if let Err(e) = &outcome {
            warn!(
                "Single-phase commit of unit of work {} failed: {}",
                self.unit_of_work_id, e
            );
            if let Err(rollback) = self.end_handle().await {
                debug!("Ignoring rollback error after failed commit: {}", rollback);
            }
        } else {
            info!("Unit of work {} committed (single phase)", self.unit_of_work_id);
        }
        self.complete(false);
        outcome
    }

    async fn single_phase_rollback(&self) -> Result<()> {
        let outcome = self.end_handle().await;
        info!("Unit of work {} rolled back (single phase)", self.unit_of_work_id);
        self.complete(false);
        outcome
    }

    async fn promote(&self) -> Result<()> {
        if self.mode() == EnlistmentMode::PromotedTwoPhase {
            return Ok(());
        }

        let promoted = if self.handle.is_open() {
            self.refresh_descriptor()
        } else {
            Err(TransactionError::closed(
                "cannot promote a transaction that has already ended",
            ))
        };

        match promoted {
            Ok(()) => {
                *self.mode.lock() = EnlistmentMode::PromotedTwoPhase;
                info!(
                    "Enlistment in unit of work {} promoted to two-phase",
                    self.unit_of_work_id
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Promotion in unit of work {} failed, rolling back: {}",
                    self.unit_of_work_id, e
                );
                if let Err(rollback) = self.end_handle().await {
                    debug!("Ignoring rollback error after failed promotion: {}", rollback);
                }
                Err(TransactionError::Coordination(format!(
                    "promotion to two-phase commit failed: {}",
                    e
                )))
            }
        }
    }

    async fn prepare(&self) -> Vote {
        if !self.handle.is_open() {
            debug!(
                "Transaction of unit of work {} already ended; voting abort",
                self.unit_of_work_id
            );
            return Vote::Aborted;
        }

        let pending = self.handle.pending_operations();
        let ready = if pending > 0 {
            Err(TransactionError::invalid(format!(
                "{} operation(s) still pending at prepare",
                pending
            )))
        } else {
            self.refresh_descriptor()
        };

        match ready {
            Ok(()) => Vote::Prepared,
            Err(e) => {
                warn!("Voting abort for unit of work {}: {}", self.unit_of_work_id, e);
                if let Err(rollback) = self.end_handle().await {
                    debug!("Ignoring rollback error after abort vote: {}", rollback);
                }
                Vote::Aborted
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        match self.handle.commit().await {
            Ok(()) => {
                info!("Unit of work {} committed (two phase)", self.unit_of_work_id);
                self.complete(false);
                Ok(())
            }
            // Outcome unknown; keep the descriptor so recovery can finish it
            Err(e @ TransactionError::TransportFailure(_)) => {
                warn!(
                    "Commit of unit of work {} is in doubt: {}",
                    self.unit_of_work_id, e
                );
                self.complete(true);
                Err(e)
            }
            Err(e) => {
                self.complete(false);
                Err(e)
            }
        }
    }

    async fn rollback(&self) -> Result<()> {
        let outcome = self.end_handle().await;
        info!("Unit of work {} rolled back (two phase)", self.unit_of_work_id);
        self.complete(false);
        outcome
    }
}

impl std::fmt::Debug for EnlistmentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnlistmentAdapter")
            .field("unit_of_work_id", &self.unit_of_work_id)
            .field("resource_manager_id", &self.resource_manager_id)
            .field("mode", &self.mode())
            .field("handle", &self.handle)
            .finish()
    }
}
