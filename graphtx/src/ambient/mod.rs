// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Ambient unit-of-work coordination
//!
//! When the host exposes a unit of work spanning several resources, the
//! transaction handle is enlisted in it so commits can be coordinated with,
//! for example, a relational database. This is optional: a manager without
//! an [`AmbientCoordinator`] never enlists.
//!
//! Protocol:
//! - a lone participant is committed through the single-phase fast path
//! - once a second, distinct participant enlists, the first is promoted and
//!   the unit of work completes with prepare / commit / rollback
//! - promotion persists a [`RecoveryDescriptor`] so completion can happen
//!   without the enlisting code, or in another process

pub mod adapter;
pub mod local;
pub mod recovery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

pub use adapter::{EnlistmentAdapter, EnlistmentMode};
pub use local::{LocalCoordinator, LocalUnitOfWork};
pub use recovery::{
    global_recovery_store, recover, recover_all, InMemoryRecoveryStore, JsonFileRecoveryStore,
    RecoveryDescriptor, RecoveryStore,
};

/// Answer of a participant to the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Prepared,
    Aborted,
}

/// Final decision for a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// A resource that can take part in a unit of work
#[async_trait]
pub trait Enlistable: Send + Sync {
    /// Stable identity of the resource manager; distinct resources differ
    fn resource_manager_id(&self) -> Uuid;

    /// Fast path: the coordinator delegates the whole decision
    async fn single_phase_commit(&self) -> Result<()>;
    async fn single_phase_rollback(&self) -> Result<()>;

    /// Switch from the fast path to two-phase completion
    async fn promote(&self) -> Result<()>;

    async fn prepare(&self) -> Vote;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// One ambient unit of work
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn id(&self) -> Uuid;

    async fn enlist(
        &self,
        participant: Arc<dyn Enlistable>,
        supports_single_phase: bool,
    ) -> Result<()>;
}

/// Host facility exposing the unit of work of the current call chain
pub trait AmbientCoordinator: Send + Sync {
    fn current_unit_of_work(&self) -> Option<Arc<dyn UnitOfWork>>;
}
