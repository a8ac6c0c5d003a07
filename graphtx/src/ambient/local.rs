// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-process reference coordinator
//!
//! Implements the ambient contract for hosts without a native facility:
//! single-phase delegation while one participant is enlisted, promotion of
//! every participant once a second one arrives, then prepare / commit.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{AmbientCoordinator, Enlistable, Outcome, UnitOfWork, Vote};
use crate::error::{Result, TransactionError};

struct Participant {
    resource: Arc<dyn Enlistable>,
    /// Still eligible for the single-phase fast path
    single_phase: bool,
}

pub struct LocalUnitOfWork {
    id: Uuid,
    participants: tokio::sync::Mutex<Vec<Participant>>,
    outcome: Mutex<Option<Outcome>>,
    doomed: AtomicBool,
}

impl LocalUnitOfWork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            participants: tokio::sync::Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
            doomed: AtomicBool::new(false),
        })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.outcome.lock()
    }

    /// Force the unit of work to roll back when completed
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.lock().await.len()
    }

    fn finish(&self, outcome: Outcome) -> Result<()> {
        let mut current = self.outcome.lock();
        if let Some(previous) = *current {
            return Err(TransactionError::invalid(format!(
                "unit of work {} already completed ({:?})",
                self.id, previous
            )));
        }
        *current = Some(outcome);
        Ok(())
    }

    /// Complete the unit of work, committing every participant or none
    pub async fn commit(&self) -> Result<()> {
        let participants = std::mem::take(&mut *self.participants.lock().await);

        if self.is_doomed() {
            self.finish(Outcome::RolledBack)?;
            rollback_all(&participants).await;
            return Err(TransactionError::Coordination(format!(
                "unit of work {} was marked for rollback",
                self.id
            )));
        }
        self.finish(Outcome::Committed)?;

        match participants.as_slice() {
            [] => Ok(()),
            [only] if only.single_phase => only.resource.single_phase_commit().await,
            _ => {
                for participant in &participants {
                    if participant.resource.prepare().await == Vote::Aborted {
                        warn!(
                            "Participant {} voted to abort unit of work {}",
                            participant.resource.resource_manager_id(),
                            self.id
                        );
                        *self.outcome.lock() = Some(Outcome::RolledBack);
                        rollback_all(&participants).await;
                        return Err(TransactionError::Coordination(format!(
                            "unit of work {} aborted during prepare",
                            self.id
                        )));
                    }
                }

                let mut first_error = None;
                for participant in &participants {
                    if let Err(e) = participant.resource.commit().await {
                        warn!("Commit phase failed for unit of work {}: {}", self.id, e);
                        first_error.get_or_insert(e);
                    }
                }
                info!(
                    "Unit of work {} committed with {} participant(s)",
                    self.id,
                    participants.len()
                );
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        let participants = std::mem::take(&mut *self.participants.lock().await);
        self.finish(Outcome::RolledBack)?;

        match participants.as_slice() {
            [only] if only.single_phase => only.resource.single_phase_rollback().await,
            _ => rollback_all(&participants).await.map_or(Ok(()), Err),
        }
    }
}

fn same_participant(a: &Arc<dyn Enlistable>, b: &Arc<dyn Enlistable>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Roll back everyone, returning the first failure
async fn rollback_all(participants: &[Participant]) -> Option<TransactionError> {
    let mut first_error = None;
    for participant in participants {
        if let Err(e) = participant.resource.rollback().await {
            warn!(
                "Rollback of participant {} failed: {}",
                participant.resource.resource_manager_id(),
                e
            );
            first_error.get_or_insert(e);
        }
    }
    first_error
}

#[async_trait]
impl UnitOfWork for LocalUnitOfWork {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn enlist(
        &self,
        participant: Arc<dyn Enlistable>,
        supports_single_phase: bool,
    ) -> Result<()> {
        if let Some(outcome) = self.outcome() {
            return Err(TransactionError::invalid(format!(
                "cannot enlist in unit of work {} after it completed ({:?})",
                self.id, outcome
            )));
        }

        let mut participants = self.participants.lock().await;
        if participants
            .iter()
            .any(|p| same_participant(&p.resource, &participant))
        {
            return Ok(());
        }

        let promote_all = !participants.is_empty();
        participants.push(Participant {
            resource: participant,
            single_phase: supports_single_phase,
        });
        debug!(
            "Unit of work {} now has {} participant(s)",
            self.id,
            participants.len()
        );

        if promote_all {
            for existing in participants.iter_mut().filter(|p| p.single_phase) {
                if let Err(e) = existing.resource.promote().await {
                    self.doom();
                    return Err(e);
                }
                existing.single_phase = false;
            }
        }
        Ok(())
    }
}

/// Hands out one unit of work at a time
#[derive(Default)]
pub struct LocalCoordinator {
    current: Mutex<Option<Arc<LocalUnitOfWork>>>,
}

impl LocalCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(&self) -> Result<Arc<LocalUnitOfWork>> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(TransactionError::invalid(
                "a unit of work is already active",
            ));
        }
        let unit = LocalUnitOfWork::new();
        debug!("Unit of work {} started", unit.id);
        *current = Some(Arc::clone(&unit));
        Ok(unit)
    }

    pub fn current(&self) -> Option<Arc<LocalUnitOfWork>> {
        self.current.lock().clone()
    }

    /// Stop tracking the active unit of work without completing it
    pub fn detach(&self) -> Option<Arc<LocalUnitOfWork>> {
        self.current.lock().take()
    }

    fn take(&self) -> Result<Arc<LocalUnitOfWork>> {
        self.current
            .lock()
            .take()
            .ok_or_else(|| TransactionError::invalid("no unit of work is active"))
    }

    pub async fn commit(&self) -> Result<()> {
        self.take()?.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.take()?.rollback().await
    }
}

impl AmbientCoordinator for LocalCoordinator {
    fn current_unit_of_work(&self) -> Option<Arc<dyn UnitOfWork>> {
        self.current().map(|unit| unit as Arc<dyn UnitOfWork>)
    }
}
