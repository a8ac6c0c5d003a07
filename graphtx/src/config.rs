// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Execution configuration
//!
//! Settings needed to talk to one server: endpoint, credentials and protocol
//! toggles. The same structure is persisted inside recovery descriptors, so a
//! promoted enlistment can rebuild an equivalent transaction handle elsewhere.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, TransactionError};

/// Database used when neither the scope nor the configuration names one
pub const DEFAULT_DATABASE: &str = "neo4j";

/// Which transport a connection negotiated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Legacy transactional HTTP endpoint
    #[default]
    Http,

    /// Session transactions of a binary-protocol driver
    Driver,
}

impl TransportKind {
    /// Select the transport from the scheme of a connection URI
    pub fn from_uri(uri: &str) -> Result<Self> {
        let scheme = uri
            .split_once("://")
            .map(|(scheme, _)| scheme.to_lowercase())
            .ok_or_else(|| {
                TransactionError::unsupported(format!("Connection URI has no scheme: {}", uri))
            })?;

        match scheme.as_str() {
            "http" | "https" => Ok(TransportKind::Http),
            "bolt" | "bolt+s" | "bolt+ssc" | "neo4j" | "neo4j+s" | "neo4j+ssc" => {
                Ok(TransportKind::Driver)
            }
            other => Err(TransactionError::unsupported(format!(
                "Unsupported connection scheme: {}",
                other
            ))),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "driver" | "bolt" => Ok(TransportKind::Driver),
            _ => Err(format!(
                "Unknown transport: {}. Valid options: http, driver",
                s
            )),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Http => "http",
            TransportKind::Driver => "driver",
        };
        write!(f, "{}", name)
    }
}

/// Basic-auth credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Everything needed to execute requests against one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfiguration {
    /// Server root, e.g. `http://localhost:7474`
    pub root_uri: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Database used by scopes that don't name one
    #[serde(default)]
    pub default_database: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Ask the server to stream JSON responses
    #[serde(default = "default_true")]
    pub use_json_stream: bool,
    /// Interval for automatic HTTP keep-alives; disabled when absent
    #[serde(default)]
    pub keep_alive_interval_ms: Option<u64>,
    /// Stable identity of this client as a resource manager
    #[serde(default = "Uuid::new_v4")]
    pub resource_manager_id: Uuid,
}

fn default_user_agent() -> String {
    format!("graphtx/{}", crate::VERSION)
}

fn default_true() -> bool {
    true
}

impl ExecutionConfiguration {
    pub fn new(root_uri: impl Into<String>) -> Self {
        Self {
            root_uri: root_uri.into().trim_end_matches('/').to_string(),
            credentials: None,
            default_database: None,
            user_agent: default_user_agent(),
            use_json_stream: true,
            keep_alive_interval_ms: None,
            resource_manager_id: Uuid::new_v4(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_default_database(mut self, database: impl Into<String>) -> Self {
        self.default_database = Some(database.into());
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.keep_alive_interval_ms = Some(ms);
        self
    }

    pub fn with_resource_manager_id(mut self, id: Uuid) -> Self {
        self.resource_manager_id = id;
        self
    }

    pub fn transport_kind(&self) -> Result<TransportKind> {
        TransportKind::from_uri(&self.root_uri)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Resolve the database a scope should run against
    pub fn database_or_default<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .or(self.default_database.as_deref())
            .unwrap_or(DEFAULT_DATABASE)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: ExecutionConfiguration = serde_json::from_str(json)?;
        config.root_uri = config.root_uri.trim_end_matches('/').to_string();
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build a configuration from `GRAPHTX_*` environment variables
    pub fn from_env() -> Result<Self> {
        let uri = std::env::var("GRAPHTX_URI")
            .map_err(|_| TransactionError::Configuration("GRAPHTX_URI is not set".to_string()))?;
        let mut config = ExecutionConfiguration::new(uri);

        if let Ok(username) = std::env::var("GRAPHTX_USER") {
            let password = std::env::var("GRAPHTX_PASSWORD").unwrap_or_default();
            config.credentials = Some(Credentials::new(username, password));
        }
        if let Ok(database) = std::env::var("GRAPHTX_DATABASE") {
            config.default_database = Some(database);
        }
        if let Ok(interval) = std::env::var("GRAPHTX_KEEP_ALIVE_MS") {
            let ms = interval.parse::<u64>().map_err(|e| {
                TransactionError::Configuration(format!(
                    "Invalid GRAPHTX_KEEP_ALIVE_MS '{}': {}",
                    interval, e
                ))
            })?;
            config.keep_alive_interval_ms = Some(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_uri.is_empty() {
            return Err(TransactionError::Configuration(
                "root_uri must not be empty".to_string(),
            ));
        }
        self.transport_kind()?;
        Ok(())
    }
}
