// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! GraphTx - transaction coordination for graph database clients
//!
//! Tracks nested transaction scopes per logical call chain, drives the
//! begin / keep-alive / commit / rollback protocol against either the
//! transactional HTTP endpoint or a driver session, and optionally enlists
//! transactions in an ambient unit of work spanning several resources.
//!
//! # Quick Start
//!
//! ```no_run
//! use graphtx::{ExecutionConfiguration, ScopeOption, Statement, TransactionManager};
//! # use std::sync::Arc;
//! # async fn run(transport: Arc<dyn graphtx::HttpTransport>) -> graphtx::Result<()> {
//! let manager = TransactionManager::builder(ExecutionConfiguration::new("http://localhost:7474"))
//!     .http(transport)
//!     .build()?;
//! manager.connected("5.13.0".parse()?);
//!
//! let scope = manager.begin().await?;
//! if let Some(tx) = manager.current_transaction() {
//!     tx.execute(Statement::new("CREATE (:Person {name: 'Ada'})")).await?;
//! }
//! scope.commit().await?;
//! scope.end().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! TransactionManager ──► TransactionContext (scope stack, task-local)
//!        │                      │
//!        │                      └─► ScopeRecord ──► TransactionHandle
//!        │                                            ├─ Http   (HttpTransport)
//!        │                                            └─ Driver (GraphDriver)
//!        └─► AmbientCoordinator ──► EnlistmentAdapter ──► RecoveryStore
//! ```

pub mod ambient;
pub mod config;
pub mod error;
pub mod statement;
pub mod txn;
pub mod version;

pub use ambient::{
    AmbientCoordinator, Enlistable, EnlistmentMode, LocalCoordinator, LocalUnitOfWork, Outcome,
    RecoveryDescriptor, RecoveryStore, UnitOfWork, Vote,
};
pub use config::{Credentials, ExecutionConfiguration, TransportKind, DEFAULT_DATABASE};
pub use error::{Result, TransactionError};
pub use statement::{Statement, StatementBatch, StatementResult};
pub use txn::{
    BeginOptions, DriverError, GraphDriver, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    ScopeHandle, ScopeOption, SessionTransaction, TransactionContext, TransactionHandle,
    TransactionManager, TransactionState, TransportError,
};
pub use version::ServerVersion;

/// Crate version, sent in the default user agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
