// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Scope stack and nesting policy

mod common;

use common::http_manager;
use graphtx::{BeginOptions, ScopeOption, Statement, TransactionError, TransactionState};
use std::sync::Arc;

#[tokio::test]
async fn test_joined_scopes_share_one_handle() {
    let (manager, _transport) = http_manager("5.13.0");

    let outer = manager.begin().await.unwrap();
    let outer_tx = Arc::clone(outer.transaction().unwrap());
    assert!(outer.is_owner());

    let mut joined = Vec::new();
    for _ in 0..4 {
        let scope = manager.begin_with(ScopeOption::Join).await.unwrap();
        assert!(!scope.is_owner());
        assert!(Arc::ptr_eq(scope.transaction().unwrap(), &outer_tx));
        assert!(Arc::ptr_eq(&manager.current_transaction().unwrap(), &outer_tx));
        joined.push(scope);
    }
    assert_eq!(manager.scope_depth(), 5);

    // Ending joined scopes leaves the owner's transaction alone
    while let Some(scope) = joined.pop() {
        scope.end().await.unwrap();
    }
    assert!(outer.is_open());
    outer.end().await.unwrap();
    assert_eq!(manager.scope_depth(), 0);
}

#[tokio::test]
async fn test_requires_new_yields_distinct_handle() {
    let (manager, _transport) = http_manager("5.13.0");

    let outer = manager.begin().await.unwrap();
    let inner = manager.begin_with(ScopeOption::RequiresNew).await.unwrap();

    assert!(inner.is_owner());
    assert!(!Arc::ptr_eq(
        inner.transaction().unwrap(),
        outer.transaction().unwrap()
    ));
    assert!(Arc::ptr_eq(
        &manager.current_transaction().unwrap(),
        inner.transaction().unwrap()
    ));
}

#[tokio::test]
async fn test_suppress_hides_parent_until_it_ends() {
    let (manager, _transport) = http_manager("5.13.0");

    let outer = manager.begin().await.unwrap();
    let outer_tx = Arc::clone(outer.transaction().unwrap());

    let suppressed = manager.begin_with(ScopeOption::Suppress).await.unwrap();
    assert!(manager.current_transaction().is_none());
    assert!(!suppressed.is_open());

    suppressed.end().await.unwrap();
    assert!(Arc::ptr_eq(&manager.current_transaction().unwrap(), &outer_tx));
}

#[tokio::test]
async fn test_suppressed_scope_rejects_mutation() {
    let (manager, _transport) = http_manager("5.13.0");
    let suppressed = manager.begin_with(ScopeOption::Suppress).await.unwrap();

    let err = suppressed.commit().await.unwrap_err();
    assert!(matches!(err, TransactionError::InvalidOperation(_)));
    assert!(err.to_string().contains("suppressed"));
    assert!(matches!(
        suppressed.rollback().await,
        Err(TransactionError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn test_join_inside_suppress_starts_new_transaction() {
    let (manager, _transport) = http_manager("5.13.0");

    let outer = manager.begin().await.unwrap();
    let _suppressed = manager.begin_with(ScopeOption::Suppress).await.unwrap();
    let inner = manager.begin_with(ScopeOption::Join).await.unwrap();

    assert!(inner.is_owner());
    assert!(!Arc::ptr_eq(
        inner.transaction().unwrap(),
        outer.transaction().unwrap()
    ));
}

#[tokio::test]
async fn test_joined_rollback_closes_the_chain() {
    let (manager, transport) = http_manager("5.13.0");

    let owner = manager.begin().await.unwrap();
    manager
        .current_transaction()
        .unwrap()
        .execute(Statement::new("CREATE (n)"))
        .await
        .unwrap();

    let joined = manager.begin().await.unwrap();
    joined.rollback().await.unwrap();

    assert!(!owner.is_open());
    assert!(owner.commit().await.unwrap_err().is_closed());
    // One begin, one delete
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn test_joined_commit_defers_to_owner() {
    let (manager, transport) = http_manager("5.13.0");

    let owner = manager.begin().await.unwrap();
    manager
        .current_transaction()
        .unwrap()
        .execute(Statement::new("CREATE (n)"))
        .await
        .unwrap();

    let joined = manager.begin().await.unwrap();
    joined.commit().await.unwrap();
    joined.end().await.unwrap();
    assert!(owner.is_open());
    assert_eq!(transport.request_count(), 1);

    owner.commit().await.unwrap();
    assert!(!owner.is_open());
    assert!(transport.requests()[1].uri.ends_with("/commit"));
}

#[tokio::test]
async fn test_requires_new_child_is_independent() {
    let (manager, _transport) = http_manager("5.13.0");

    let parent = manager.begin().await.unwrap();
    let child = manager.begin_with(ScopeOption::RequiresNew).await.unwrap();
    child.commit().await.unwrap();
    assert!(parent.is_open());
    child.end().await.unwrap();

    let second = manager.begin_with(ScopeOption::RequiresNew).await.unwrap();
    second.rollback().await.unwrap();
    assert!(parent.is_open());
}

#[tokio::test]
async fn test_fresh_handle_after_commit() {
    let (manager, _transport) = http_manager("5.13.0");

    let first = manager.begin().await.unwrap();
    let first_tx = Arc::clone(first.transaction().unwrap());
    first_tx.execute(Statement::new("CREATE (n)")).await.unwrap();
    first.commit().await.unwrap();
    first.end().await.unwrap();

    let second = manager.begin().await.unwrap();
    let second_tx = second.transaction().unwrap();
    assert!(!Arc::ptr_eq(second_tx, &first_tx));
    assert_eq!(second_tx.state(), TransactionState::Open);
    assert_eq!(first_tx.state(), TransactionState::Committed);
}

#[tokio::test]
async fn test_end_transaction_on_empty_stack_is_noop() {
    let (manager, transport) = http_manager("5.13.0");
    assert!(manager.current_transaction().is_none());
    manager.end_transaction().await.unwrap();

    let scope = manager.begin().await.unwrap();
    manager.end_transaction().await.unwrap();
    assert_eq!(manager.scope_depth(), 0);
    assert!(!scope.is_open());

    // Ending the handle afterwards does nothing more
    scope.end().await.unwrap();
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn test_dropped_scope_pops_itself() {
    let (manager, _transport) = http_manager("5.13.0");
    {
        let _outer = manager.begin().await.unwrap();
        let _inner = manager.begin_with(ScopeOption::Suppress).await.unwrap();
        assert_eq!(manager.scope_depth(), 2);
    }
    assert_eq!(manager.scope_depth(), 0);
    assert!(manager.current_transaction().is_none());
}

#[tokio::test]
async fn test_parent_override_is_joined() {
    let (manager, _transport) = http_manager("5.13.0");

    let parent = manager.begin().await.unwrap();
    let parent_tx = Arc::clone(parent.transaction().unwrap());
    let _suppressed = manager.begin_with(ScopeOption::Suppress).await.unwrap();

    let joined = manager
        .begin_transaction(BeginOptions::new(ScopeOption::Join).with_parent(Arc::clone(&parent_tx)))
        .await
        .unwrap();
    assert!(!joined.is_owner());
    assert!(Arc::ptr_eq(joined.transaction().unwrap(), &parent_tx));
}

#[tokio::test]
async fn test_join_on_other_database_is_rejected() {
    let (manager, _transport) = http_manager("5.13.0");

    let _outer = manager
        .begin_transaction(BeginOptions::default().with_database("movies"))
        .await
        .unwrap();
    assert_eq!(manager.current_transaction().unwrap().database(), "movies");

    let err = manager
        .begin_transaction(BeginOptions::default().with_database("people"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::InvalidOperation(_)));

    // Without an explicit database the parent's is used
    let joined = manager.begin().await.unwrap();
    assert_eq!(joined.transaction().unwrap().database(), "movies");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scoped_contexts_are_isolated() {
    let (manager, _transport) = http_manager("5.13.0");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .scoped(async {
                    let scope = manager.begin().await.unwrap();
                    let mine = Arc::clone(scope.transaction().unwrap());
                    tokio::task::yield_now().await;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    // Still this task's stack after resuming, possibly elsewhere
                    assert_eq!(manager.scope_depth(), 1);
                    assert!(Arc::ptr_eq(&manager.current_transaction().unwrap(), &mine));
                    scope.end().await.unwrap();
                    mine.id()
                })
                .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(manager.scope_depth(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_tasks_do_not_share_scopes() {
    let (manager, _transport) = http_manager("5.13.0");
    let (opened, wait_opened) = tokio::sync::oneshot::channel();
    let (release, wait_release) = tokio::sync::oneshot::channel::<()>();

    let first_manager = manager.clone();
    let first = tokio::spawn(async move {
        let scope = first_manager.begin().await.unwrap();
        let id = scope.transaction().unwrap().id();
        let _ = opened.send(id);
        let _ = wait_release.await;
        scope.end().await.unwrap();
        id
    });
    let first_id = wait_opened.await.unwrap();

    let second_manager = manager.clone();
    let (second_id, owner, seen_before) = tokio::spawn(async move {
        let seen_before = second_manager.current_transaction().map(|tx| tx.id());
        let scope = second_manager.begin().await.unwrap();
        let id = scope.transaction().unwrap().id();
        let owner = scope.is_owner();
        scope.end().await.unwrap();
        (id, owner, seen_before)
    })
    .await
    .unwrap();

    assert_eq!(seen_before, None);
    assert!(owner);
    assert_ne!(second_id, first_id);
    // Nor does the test body see either task's scopes
    assert!(manager.current_transaction().is_none());

    release.send(()).unwrap();
    assert_eq!(first.await.unwrap(), first_id);
}

#[tokio::test]
async fn test_enter_shares_context_with_spawned_task() {
    let (manager, _transport) = http_manager("5.13.0");

    manager
        .scoped(async {
            let scope = manager.begin().await.unwrap();
            let context = manager.context();
            let expected = scope.transaction().unwrap().id();

            let child_manager = manager.clone();
            let seen = tokio::spawn(async move {
                child_manager
                    .enter(context, async { child_manager.current_transaction().map(|tx| tx.id()) })
                    .await
            })
            .await
            .unwrap();

            assert_eq!(seen, Some(expected));
            scope.end().await.unwrap();
        })
        .await;
}
