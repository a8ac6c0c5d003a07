// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Server version detection results and the capabilities gated on them

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransactionError;

lazy_static! {
    static ref VERSION_PATTERN: Regex =
        Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version pattern is valid");
}

/// Version reported by the server during the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// Multi-statement transactions
    pub const TRANSACTIONS: ServerVersion = ServerVersion::new(2, 0, 0);
    /// Statement errors roll the open transaction back on the server
    pub const AUTO_ROLLBACK_ON_STATEMENT_ERROR: ServerVersion = ServerVersion::new(3, 0, 0);
    /// Named databases and the `/db/{name}/tx` endpoint
    pub const MULTIPLE_DATABASES: ServerVersion = ServerVersion::new(4, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn supports_transactions(&self) -> bool {
        *self >= Self::TRANSACTIONS
    }

    pub fn supports_multiple_databases(&self) -> bool {
        *self >= Self::MULTIPLE_DATABASES
    }

    /// Whether a statement error also ends the transaction server-side.
    ///
    /// On these servers a later commit/rollback sees "unknown transaction",
    /// and the statement error is the one the caller must see.
    pub fn rolls_back_on_statement_error(&self) -> bool {
        *self >= Self::AUTO_ROLLBACK_ON_STATEMENT_ERROR
    }

    /// Path of the transaction-begin endpoint relative to the server root
    pub fn transaction_endpoint(&self, database: &str) -> String {
        if self.supports_multiple_databases() {
            format!("/db/{}/tx", database)
        } else {
            "/db/data/transaction".to_string()
        }
    }
}

impl std::str::FromStr for ServerVersion {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = VERSION_PATTERN.captures(s).ok_or_else(|| {
            TransactionError::Configuration(format!("Unrecognised server version: {}", s))
        })?;

        let part = |idx: usize| -> Result<u32, TransactionError> {
            match captures.get(idx) {
                Some(m) => m.as_str().parse::<u32>().map_err(|e| {
                    TransactionError::Configuration(format!(
                        "Invalid version component '{}': {}",
                        m.as_str(),
                        e
                    ))
                }),
                None => Ok(0),
            }
        };

        Ok(ServerVersion::new(part(1)?, part(2)?, part(3)?))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
