// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction manager
//!
//! Public entry point: begins and ends scopes, resolves the current
//! transaction of the calling task, applies the nesting policy and wires
//! handles into an ambient unit of work when the host provides one.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::ambient::adapter::{EnlistmentAdapter, EnlistmentRegistry};
use crate::ambient::recovery::{
    global_recovery_store, recover_all, RecoveryDescriptor, RecoveryStore,
};
use crate::ambient::{AmbientCoordinator, Enlistable, Outcome, UnitOfWork};
use crate::config::{ExecutionConfiguration, TransportKind};
use crate::error::{Result, TransactionError};
use crate::txn::driver::{DriverTransaction, GraphDriver};
use crate::txn::handle::TransactionHandle;
use crate::txn::http::keep_alive::spawn_keep_alive;
use crate::txn::http::{HttpTransaction, HttpTransport};
use crate::txn::scope::{
    active_context, with_context, ScopeRecord, TaskContexts, TransactionContext,
};
use crate::txn::scope_handle::{finish_scope, ScopeHandle};
use crate::txn::state::ScopeOption;
use crate::version::ServerVersion;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// The negotiated transport
#[derive(Clone)]
pub enum Backend {
    Http(Arc<dyn HttpTransport>),
    Driver(Arc<dyn GraphDriver>),
}

impl Backend {
    pub fn kind(&self) -> TransportKind {
        match self {
            Backend::Http(_) => TransportKind::Http,
            Backend::Driver(_) => TransportKind::Driver,
        }
    }
}

/// Arguments of [`TransactionManager::begin_transaction`]
#[derive(Debug, Clone, Default)]
pub struct BeginOptions {
    pub scope: ScopeOption,
    /// Join this handle instead of the one at the top of the stack
    pub parent: Option<Arc<TransactionHandle>>,
    pub database: Option<String>,
}

impl BeginOptions {
    pub fn new(scope: ScopeOption) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: Arc<TransactionHandle>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

struct ManagerInner {
    id: u64,
    config: Arc<ExecutionConfiguration>,
    backend: Backend,
    server_version: RwLock<Option<ServerVersion>>,
    /// Used when the calling task has no active context for this manager
    task_contexts: TaskContexts,
    coordinator: Option<Arc<dyn AmbientCoordinator>>,
    recovery_store: Arc<dyn RecoveryStore>,
    enlistments: Arc<EnlistmentRegistry>,
    /// Serializes creation of the one enlistment per unit of work
    enlist_lock: tokio::sync::Mutex<()>,
}

/// Cheap to clone; clones share state
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

pub struct TransactionManagerBuilder {
    config: ExecutionConfiguration,
    backend: Option<Backend>,
    coordinator: Option<Arc<dyn AmbientCoordinator>>,
    recovery_store: Option<Arc<dyn RecoveryStore>>,
    server_version: Option<ServerVersion>,
}

impl TransactionManagerBuilder {
    pub fn http(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.backend = Some(Backend::Http(transport));
        self
    }

    pub fn driver(mut self, driver: Arc<dyn GraphDriver>) -> Self {
        self.backend = Some(Backend::Driver(driver));
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn AmbientCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn recovery_store(mut self, store: Arc<dyn RecoveryStore>) -> Self {
        self.recovery_store = Some(store);
        self
    }

    /// Mark the manager connected right away
    pub fn server_version(mut self, version: ServerVersion) -> Self {
        self.server_version = Some(version);
        self
    }

    pub fn build(self) -> Result<TransactionManager> {
        self.config.validate()?;
        let backend = self.backend.ok_or_else(|| {
            TransactionError::Configuration("no HTTP transport or driver configured".to_string())
        })?;
        let uri_kind = self.config.transport_kind()?;
        if uri_kind != backend.kind() {
            return Err(TransactionError::Configuration(format!(
                "{} uses the {} transport but a {} backend was configured",
                self.config.root_uri,
                uri_kind,
                backend.kind()
            )));
        }

        let inner = ManagerInner {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            config: Arc::new(self.config),
            backend,
            server_version: RwLock::new(self.server_version),
            task_contexts: TaskContexts::default(),
            coordinator: self.coordinator,
            recovery_store: self.recovery_store.unwrap_or_else(global_recovery_store),
            enlistments: Arc::new(EnlistmentRegistry::default()),
            enlist_lock: tokio::sync::Mutex::new(()),
        };
        debug!(
            "Transaction manager {} created for {} ({})",
            inner.id,
            inner.config.root_uri,
            inner.backend.kind()
        );
        Ok(TransactionManager {
            inner: Arc::new(inner),
        })
    }
}

impl TransactionManager {
    pub fn builder(config: ExecutionConfiguration) -> TransactionManagerBuilder {
        TransactionManagerBuilder {
            config,
            backend: None,
            coordinator: None,
            recovery_store: None,
            server_version: None,
        }
    }

    pub fn config(&self) -> &ExecutionConfiguration {
        &self.inner.config
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.backend.kind()
    }

    /// Record the outcome of the connection handshake
    pub fn connected(&self, version: ServerVersion) {
        info!("Transaction manager {} connected to server {}", self.inner.id, version);
        *self.inner.server_version.write() = Some(version);
    }

    pub fn disconnect(&self) {
        *self.inner.server_version.write() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.server_version.read().is_some()
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        *self.inner.server_version.read()
    }

    /// Scope stack of the calling task.
    ///
    /// Inside `scoped`/`enter` this is the context they installed; otherwise
    /// each Tokio task gets its own stack.
    pub fn context(&self) -> TransactionContext {
        active_context(self.inner.id).unwrap_or_else(|| self.inner.task_contexts.current())
    }

    /// Run `fut` with a fresh, empty scope stack
    pub async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        with_context(self.inner.id, TransactionContext::new(), fut).await
    }

    /// Run `fut` with `context` as its scope stack, e.g. inside a spawned task
    pub async fn enter<F: Future>(&self, context: TransactionContext, fut: F) -> F::Output {
        with_context(self.inner.id, context, fut).await
    }

    pub fn scope_depth(&self) -> usize {
        self.context().depth()
    }

    /// Handle of the innermost scope; `None` when there is no scope or it is suppressed
    pub fn current_transaction(&self) -> Option<Arc<TransactionHandle>> {
        self.context().current_transaction()
    }

    /// Number of live units of work this manager is currently enlisted in
    pub fn enlistment_count(&self) -> usize {
        self.inner.enlistments.live_count()
    }

    /// Roll back enlistments whose unit of work was dropped without completing.
    ///
    /// Returns how many were pruned.
    pub async fn prune_abandoned_enlistments(&self) -> usize {
        let abandoned = self.inner.enlistments.take_abandoned();
        for adapter in &abandoned {
            adapter.abandon().await;
        }
        abandoned.len()
    }

    pub async fn begin(&self) -> Result<ScopeHandle> {
        self.begin_transaction(BeginOptions::default()).await
    }

    pub async fn begin_with(&self, scope: ScopeOption) -> Result<ScopeHandle> {
        self.begin_transaction(BeginOptions::new(scope)).await
    }

    pub async fn begin_transaction(&self, options: BeginOptions) -> Result<ScopeHandle> {
        let version = self.server_version().ok_or(TransactionError::NotReady)?;
        if !version.supports_transactions() {
            return Err(TransactionError::unsupported(format!(
                "server {} does not support multi-statement transactions",
                version
            )));
        }
        if let Some(database) = &options.database {
            if !version.supports_multiple_databases() {
                return Err(TransactionError::unsupported(format!(
                    "server {} does not support multiple databases (requested '{}')",
                    version, database
                )));
            }
        }

        let context = self.context();
        let top = context.top();
        let database = self
            .inner
            .config
            .database_or_default(options.database.as_deref())
            .to_string();

        let record = match options.scope {
            ScopeOption::Suppress => {
                ScopeRecord::new(ScopeOption::Suppress, None, false, false, top.as_ref())
            }
            ScopeOption::RequiresNew => {
                let handle = self.new_handle(version, database).await?;
                ScopeRecord::new(ScopeOption::RequiresNew, Some(handle), true, false, top.as_ref())
            }
            ScopeOption::Join => {
                let parent = match &options.parent {
                    Some(parent) => Some(Arc::clone(parent)).filter(|h| h.is_open()),
                    None => top.as_ref().and_then(|r| r.joinable_handle().cloned()),
                };
                let inside_suppressed = top.as_ref().is_some_and(|r| r.is_suppressed());

                if let Some(handle) = parent {
                    check_same_database(&handle, options.database.as_deref())?;
                    let enlisted = options.parent.is_none()
                        && top.as_ref().is_some_and(|r| r.is_enlisted());
                    ScopeRecord::new(ScopeOption::Join, Some(handle), false, enlisted, top.as_ref())
                } else if let Some(unit) = self.ambient_unit_of_work(inside_suppressed) {
                    let handle = self
                        .enlisted_handle(unit, version, database, options.database.as_deref())
                        .await?;
                    ScopeRecord::new(ScopeOption::Join, Some(handle), false, true, top.as_ref())
                } else {
                    let handle = self.new_handle(version, database).await?;
                    ScopeRecord::new(ScopeOption::Join, Some(handle), true, false, top.as_ref())
                }
            }
        };

        let record = Arc::new(record);
        context.push(Arc::clone(&record));
        debug!(
            "Scope {} began ({}, owner: {}, depth {})",
            record.id(),
            record.option(),
            record.is_owner(),
            context.depth()
        );
        Ok(ScopeHandle::new(record, context))
    }

    /// End the innermost scope of the calling task; no-op when there is none
    pub async fn end_transaction(&self) -> Result<()> {
        let context = self.context();
        match context.top() {
            Some(record) => finish_scope(&context, &record).await,
            None => Ok(()),
        }
    }

    /// Complete the outstanding descriptors of this resource manager
    pub async fn recover_pending<F>(&self, decide: F) -> Result<usize>
    where
        F: Fn(&RecoveryDescriptor) -> Outcome,
    {
        let Backend::Http(transport) = &self.inner.backend else {
            return Err(TransactionError::unsupported(
                "recovery requires the HTTP transport",
            ));
        };
        recover_all(
            self.inner.recovery_store.as_ref(),
            self.inner.config.resource_manager_id,
            Arc::clone(transport),
            decide,
        )
        .await
    }

    async fn new_handle(
        &self,
        version: ServerVersion,
        database: String,
    ) -> Result<Arc<TransactionHandle>> {
        let handle = match &self.inner.backend {
            Backend::Http(transport) => {
                let handle = Arc::new(TransactionHandle::Http(HttpTransaction::new(
                    Arc::clone(transport),
                    Arc::clone(&self.inner.config),
                    version,
                    database,
                )));
                if let Some(interval) = self.inner.config.keep_alive_interval() {
                    if spawn_keep_alive(Arc::downgrade(&handle), interval).is_none() {
                        debug!("No runtime for keep-alive of transaction {}", handle.id());
                    }
                }
                handle
            }
            Backend::Driver(driver) => Arc::new(TransactionHandle::Driver(
                DriverTransaction::begin(driver.as_ref(), database).await?,
            )),
        };
        debug!("Created transaction handle {}", handle.id());
        Ok(handle)
    }

    fn ambient_unit_of_work(&self, inside_suppressed: bool) -> Option<Arc<dyn UnitOfWork>> {
        if inside_suppressed {
            return None;
        }
        self.inner
            .coordinator
            .as_ref()
            .and_then(|coordinator| coordinator.current_unit_of_work())
    }

    /// The handle enlisted in `unit`, created and enlisted on first use
    async fn enlisted_handle(
        &self,
        unit: Arc<dyn UnitOfWork>,
        version: ServerVersion,
        database: String,
        requested_database: Option<&str>,
    ) -> Result<Arc<TransactionHandle>> {
        let unit_id = unit.id();
        let _guard = self.inner.enlist_lock.lock().await;
        self.prune_abandoned_enlistments().await;

        if let Some(adapter) = self.inner.enlistments.get(&unit_id) {
            let handle = Arc::clone(adapter.handle());
            if !handle.is_open() {
                return Err(TransactionError::closed(format!(
                    "the transaction enlisted in unit of work {} has already ended",
                    unit_id
                )));
            }
            check_same_database(&handle, requested_database)?;
            return Ok(handle);
        }

        let handle = self.new_handle(version, database).await?;
        let adapter = match EnlistmentAdapter::create(
            &unit,
            Arc::clone(&handle),
            &self.inner.config,
            version,
            Arc::clone(&self.inner.recovery_store),
            &self.inner.enlistments,
        ) {
            Ok(adapter) => adapter,
            Err(e) => {
                handle.abandon_locally();
                return Err(TransactionError::Coordination(format!(
                    "could not record recovery descriptor: {}",
                    e
                )));
            }
        };

        let participant: Arc<dyn Enlistable> = adapter.clone();
        if let Err(e) = unit.enlist(participant, true).await {
            if !handle.abandon_locally() && handle.is_open() {
                if let Err(rollback) = handle.rollback().await {
                    debug!("Ignoring rollback error after failed enlistment: {}", rollback);
                }
            }
            if let Err(remove) = self
                .inner
                .recovery_store
                .remove(self.inner.config.resource_manager_id, unit_id)
            {
                warn!("Could not remove recovery descriptor: {}", remove);
            }
            return Err(match e {
                TransactionError::Coordination(_) => e,
                other => TransactionError::Coordination(format!(
                    "enlistment in unit of work {} failed: {}",
                    unit_id, other
                )),
            });
        }

        self.inner.enlistments.insert(adapter);
        info!(
            "Transaction {} enlisted in unit of work {}",
            handle.id(),
            unit_id
        );
        Ok(handle)
    }

    /// Resource manager identity persisted in recovery descriptors
    pub fn resource_manager_id(&self) -> Uuid {
        self.inner.config.resource_manager_id
    }
}

fn check_same_database(handle: &TransactionHandle, requested: Option<&str>) -> Result<()> {
    match requested {
        Some(database) if database != handle.database() => Err(TransactionError::invalid(format!(
            "cannot join a transaction on database '{}' from a scope on '{}'",
            handle.database(),
            database
        ))),
        _ => Ok(()),
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("id", &self.inner.id)
            .field("root_uri", &self.inner.config.root_uri)
            .field("transport", &self.inner.backend.kind())
            .field("server_version", &self.server_version())
            .finish()
    }
}
