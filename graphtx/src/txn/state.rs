// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction state and scope nesting options

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TransactionError};

/// How a new scope relates to the enclosing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScopeOption {
    /// Share the nearest open, non-suppressed transaction; start one otherwise
    #[default]
    Join,
    /// Behave as if no transaction exists for the duration of the scope
    Suppress,
    /// Always start an independent backend transaction
    RequiresNew,
}

impl fmt::Display for ScopeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeOption::Join => "join",
            ScopeOption::Suppress => "suppress",
            ScopeOption::RequiresNew => "requires-new",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of one backend transaction.
///
/// `Committed` and `RolledBack` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Open)
    }

    /// Fail with `ClosedTransaction` unless the state is `Open`
    pub fn ensure_open(&self) -> Result<()> {
        match self {
            TransactionState::Open => Ok(()),
            TransactionState::Committed => Err(TransactionError::closed(
                "the transaction has already been committed",
            )),
            TransactionState::RolledBack => Err(TransactionError::closed(
                "the transaction has already been rolled back",
            )),
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Open => "open",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        };
        write!(f, "{}", name)
    }
}
