// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Scope records and the per-call-chain scope stack
//!
//! The active [`TransactionContext`] of each manager travels with the task in
//! a task-local map, so it is still visible after the task resumes on another
//! worker thread.

use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task;

use crate::txn::handle::TransactionHandle;
use crate::txn::state::ScopeOption;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Active context per manager id
    static ACTIVE_CONTEXTS: HashMap<u64, TransactionContext>;
}

/// One nested scope and its relationship to the enclosing one
#[derive(Debug)]
pub struct ScopeRecord {
    id: u64,
    option: ScopeOption,
    handle: Option<Arc<TransactionHandle>>,
    /// Created the handle and must terminate it
    is_owner: bool,
    /// Handle belongs to an ambient unit of work
    enlisted: bool,
    parent: Option<Weak<ScopeRecord>>,
    ended: AtomicBool,
}

impl ScopeRecord {
    pub(crate) fn new(
        option: ScopeOption,
        handle: Option<Arc<TransactionHandle>>,
        is_owner: bool,
        enlisted: bool,
        parent: Option<&Arc<ScopeRecord>>,
    ) -> Self {
        debug_assert!(!(is_owner && handle.is_none()));
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            option,
            handle,
            is_owner,
            enlisted,
            parent: parent.map(Arc::downgrade),
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn option(&self) -> ScopeOption {
        self.option
    }

    pub fn handle(&self) -> Option<&Arc<TransactionHandle>> {
        self.handle.as_ref()
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn is_enlisted(&self) -> bool {
        self.enlisted
    }

    pub fn is_suppressed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn parent(&self) -> Option<Arc<ScopeRecord>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Number of live enclosing scopes
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(record) = current {
            depth += 1;
            current = record.parent();
        }
        depth
    }

    /// Handle this scope would let a nested `Join` share
    pub(crate) fn joinable_handle(&self) -> Option<&Arc<TransactionHandle>> {
        self.handle.as_ref().filter(|h| h.is_open())
    }

    /// Mark ended; true only for the first caller
    pub(crate) fn finish(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Scope stack of one logical call chain.
///
/// Clones share the same stack, so parallel branches of one call chain can
/// be handed the same context.
#[derive(Clone, Default)]
pub struct TransactionContext {
    stack: Arc<Mutex<Vec<Arc<ScopeRecord>>>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, record: Arc<ScopeRecord>) {
        self.stack.lock().push(record);
    }

    pub(crate) fn top(&self) -> Option<Arc<ScopeRecord>> {
        self.stack.lock().last().cloned()
    }

    pub(crate) fn pop(&self) -> Option<Arc<ScopeRecord>> {
        let mut stack = self.stack.lock();
        let record = stack.pop();
        if stack.is_empty() {
            stack.shrink_to_fit();
        }
        record
    }

    /// Remove `record`, wherever it sits. Returns false if it is not here.
    pub(crate) fn remove(&self, record: &Arc<ScopeRecord>) -> bool {
        let mut stack = self.stack.lock();
        let Some(pos) = stack.iter().rposition(|r| Arc::ptr_eq(r, record)) else {
            return false;
        };
        if pos + 1 != stack.len() {
            warn!(
                "Scope {} ended out of order ({} nested scope(s) still open)",
                record.id(),
                stack.len() - pos - 1
            );
        }
        stack.remove(pos);
        if stack.is_empty() {
            stack.shrink_to_fit();
        }
        true
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.lock().is_empty()
    }

    /// Handle of the innermost scope; `None` inside a suppressed scope
    pub fn current_transaction(&self) -> Option<Arc<TransactionHandle>> {
        self.top().and_then(|r| r.handle().cloned())
    }

    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &TransactionContext) -> bool {
        Arc::ptr_eq(&self.stack, &other.stack)
    }

    /// Empty and held by nobody but its owner
    fn is_unused(&self) -> bool {
        Arc::strong_count(&self.stack) == 1 && self.is_empty()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Fallback scope stacks of one manager, one per Tokio task
#[derive(Default)]
pub(crate) struct TaskContexts {
    by_task: Mutex<HashMap<task::Id, TransactionContext>>,
    /// Callers outside any task, e.g. the future driven by `block_on`
    detached: TransactionContext,
}

impl TaskContexts {
    /// Stack of the calling task, created on first use
    pub(crate) fn current(&self) -> TransactionContext {
        let Some(task_id) = task::try_id() else {
            return self.detached.clone();
        };

        let mut by_task = self.by_task.lock();
        if let Some(context) = by_task.get(&task_id) {
            return context.clone();
        }
        by_task.retain(|_, context| !context.is_unused());
        let context = TransactionContext::new();
        by_task.insert(task_id, context.clone());
        context
    }

    pub(crate) fn tracked(&self) -> usize {
        self.by_task.lock().len()
    }
}

/// Context that `manager_id` should use on the current task, if one was set
pub(crate) fn active_context(manager_id: u64) -> Option<TransactionContext> {
    ACTIVE_CONTEXTS
        .try_with(|contexts| contexts.get(&manager_id).cloned())
        .ok()
        .flatten()
}

/// Run `fut` with `context` active for `manager_id`
pub(crate) async fn with_context<F: Future>(
    manager_id: u64,
    context: TransactionContext,
    fut: F,
) -> F::Output {
    let mut contexts = ACTIVE_CONTEXTS
        .try_with(|contexts| contexts.clone())
        .unwrap_or_default();
    contexts.insert(manager_id, context);
    ACTIVE_CONTEXTS.scope(contexts, fut).await
}
