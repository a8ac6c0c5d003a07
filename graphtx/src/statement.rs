// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Statement batches exchanged with the query-execution layer

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One query text with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Statements sent together in one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementBatch {
    pub statements: Vec<Statement>,
}

impl StatementBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(statement: Statement) -> Self {
        Self {
            statements: vec![statement],
        }
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }
}

impl From<Vec<Statement>> for StatementBatch {
    fn from(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

impl From<Statement> for StatementBatch {
    fn from(statement: Statement) -> Self {
        Self::single(statement)
    }
}

/// Columns and rows produced by one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl StatementResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Value of `column` in the first row
    pub fn first(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.first().and_then(|row| row.get(idx))
    }
}
