// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Per-handle request ordering
//!
//! Tickets are issued synchronously when an operation is initiated, so the
//! issuance order is fixed before any future is polled. A request may only
//! go out once every lower ticket has finished. Finishing includes being
//! dropped without running, so a cancelled caller never stalls the queue.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) struct RequestSequencer {
    next_ticket: AtomicU64,
    /// Lowest ticket that has not finished yet
    serving: watch::Sender<u64>,
    /// Finished tickets above `serving`
    finished: Mutex<BTreeSet<u64>>,
}

impl RequestSequencer {
    pub(crate) fn new() -> Arc<Self> {
        let (serving, _) = watch::channel(0);
        Arc::new(Self {
            next_ticket: AtomicU64::new(0),
            serving,
            finished: Mutex::new(BTreeSet::new()),
        })
    }

    pub(crate) fn issue(self: &Arc<Self>) -> Ticket {
        let number = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        Ticket {
            number,
            sequencer: Arc::clone(self),
        }
    }

    fn release(&self, number: u64) {
        let mut finished = self.finished.lock();
        finished.insert(number);

        let mut serving = *self.serving.borrow();
        while finished.remove(&serving) {
            serving += 1;
        }
        self.serving.send_replace(serving);
    }
}

/// A place in the request queue; releases its turn when dropped
pub(crate) struct Ticket {
    number: u64,
    sequencer: Arc<RequestSequencer>,
}

impl Ticket {
    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    /// Wait until every earlier ticket has finished
    pub(crate) async fn wait_turn(&self) {
        let mut serving = self.sequencer.serving.subscribe();
        // The sender lives as long as this ticket, so this cannot fail
        let _ = serving.wait_for(|current| *current == self.number).await;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.sequencer.release(self.number);
    }
}
