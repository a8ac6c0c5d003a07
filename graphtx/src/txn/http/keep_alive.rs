// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Background keep-alive for HTTP transactions

use log::{debug, warn};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::txn::handle::TransactionHandle;

/// Post keep-alives every `interval` until the handle is closed or dropped.
///
/// Returns `None` when called outside a Tokio runtime.
pub(crate) fn spawn_keep_alive(
    handle: Weak<TransactionHandle>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(handle) = handle.upgrade() else {
                break;
            };
            if !handle.is_open() {
                debug!("Keep-alive for transaction {} stopped", handle.id());
                break;
            }
            if !handle.is_begun() {
                continue;
            }

            if let Err(e) = handle.keep_alive().await {
                if e.is_closed() {
                    debug!("Keep-alive for transaction {} stopped: {}", handle.id(), e);
                    break;
                }
                warn!("Keep-alive for transaction {} failed: {}", handle.id(), e);
            }
        }
    }))
}
