// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Shared test fixtures: a scripted HTTP server stand-in and a fake driver

#![allow(dead_code)]

use async_trait::async_trait;
use graphtx::ambient::InMemoryRecoveryStore;
use graphtx::{
    DriverError, ExecutionConfiguration, GraphDriver, HttpMethod, HttpRequest, HttpResponse,
    HttpTransport, ServerVersion, SessionTransaction, Statement, StatementResult,
    TransactionManager, TransportError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ROOT: &str = "http://localhost:7474";
pub const EXPIRES: &str = "Tue, 01 Jan 2030 00:00:00 GMT";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type DelayFn = Arc<dyn Fn(&HttpRequest) -> Duration + Send + Sync>;

/// Answers like a server unless a scripted response is queued
#[derive(Default)]
pub struct MockHttpTransport {
    requests: Mutex<Vec<HttpRequest>>,
    scripted: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Mutex<Option<DelayFn>>,
}

impl MockHttpTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next request with `response`
    pub fn push_response(&self, response: HttpResponse) {
        self.scripted.lock().push_back(Ok(response));
    }

    /// Fail the next request below HTTP
    pub fn push_failure(&self, message: &str) {
        self.scripted
            .lock()
            .push_back(Err(TransportError(message.to_string())));
    }

    pub fn set_delay<F>(&self, delay: F)
    where
        F: Fn(&HttpRequest) -> Duration + Send + Sync + 'static,
    {
        *self.delay.lock() = Some(Arc::new(delay));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &HttpRequest) -> HttpResponse {
        let results: Vec<Value> = statement_texts(request)
            .iter()
            .map(|_| json!({ "columns": ["n"], "data": [{ "row": [1] }] }))
            .collect();
        let body = json!({
            "results": results,
            "errors": [],
            "transaction": { "expires": EXPIRES },
        });

        match request.method {
            HttpMethod::Delete => HttpResponse::new(200, json!({ "results": [], "errors": [] })),
            HttpMethod::Post if request.uri.ends_with("/commit") => {
                HttpResponse::new(200, json!({ "results": results, "errors": [] }))
            }
            HttpMethod::Post if is_begin(&request.uri) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                HttpResponse::new(201, body).with_location(format!("{}/db/neo4j/tx/{}", ROOT, id))
            }
            HttpMethod::Post => HttpResponse::new(200, body),
        }
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let delay = self.delay.lock().clone();
        if let Some(delay) = delay {
            tokio::time::sleep(delay(&request)).await;
        }

        let scripted = self.scripted.lock().pop_front();
        let response = match scripted {
            Some(response) => response,
            None => Ok(self.answer(&request)),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

fn is_begin(uri: &str) -> bool {
    uri.ends_with("/tx") || uri.ends_with("/db/data/transaction")
}

pub fn statement_texts(request: &HttpRequest) -> Vec<String> {
    request
        .body
        .as_ref()
        .and_then(|body| body["statements"].as_array())
        .map(|statements| {
            statements
                .iter()
                .filter_map(|s| s["statement"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// 200 carrying a statement error
pub fn statement_error(code: &str, message: &str) -> HttpResponse {
    HttpResponse::new(
        200,
        json!({ "results": [], "errors": [{ "code": code, "message": message }] }),
    )
}

/// 404 for a transaction the server no longer knows
pub fn unknown_transaction() -> HttpResponse {
    HttpResponse::new(
        404,
        json!({
            "results": [],
            "errors": [{
                "code": "Neo.ClientError.Transaction.TransactionNotFound",
                "message": "Unrecognized transaction id. Transaction may have timed out and been rolled back."
            }]
        }),
    )
}

pub fn http_config() -> ExecutionConfiguration {
    ExecutionConfiguration::new(ROOT)
}

/// Connected manager over a fresh mock transport and a private recovery store
pub fn http_manager(version: &str) -> (TransactionManager, Arc<MockHttpTransport>) {
    init_logging();
    let transport = MockHttpTransport::new();
    let manager = TransactionManager::builder(http_config())
        .http(transport.clone())
        .recovery_store(Arc::new(InMemoryRecoveryStore::new()))
        .server_version(parse_version(version))
        .build()
        .unwrap();
    (manager, transport)
}

pub fn parse_version(version: &str) -> ServerVersion {
    version.parse().unwrap()
}

/// Records every call as a short event string
#[derive(Default)]
pub struct MockDriver {
    events: Arc<Mutex<Vec<String>>>,
    failing: Mutex<HashSet<String>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make statements with this text fail with a syntax error
    pub fn fail_statement(&self, text: &str) {
        self.failing.lock().insert(text.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl GraphDriver for MockDriver {
    async fn begin_transaction(
        &self,
        database: &str,
    ) -> Result<Box<dyn SessionTransaction>, DriverError> {
        self.events.lock().push(format!("begin:{}", database));
        Ok(Box::new(MockSessionTransaction {
            events: Arc::clone(&self.events),
            failing: self.failing.lock().clone(),
        }))
    }
}

struct MockSessionTransaction {
    events: Arc<Mutex<Vec<String>>>,
    failing: HashSet<String>,
}

#[async_trait]
impl SessionTransaction for MockSessionTransaction {
    async fn run(&self, statement: &Statement) -> Result<StatementResult, DriverError> {
        self.events.lock().push(format!("run:{}", statement.text));
        if self.failing.contains(&statement.text) {
            return Err(DriverError::server(
                "Neo.ClientError.Statement.SyntaxError",
                format!("Invalid input '{}'", statement.text),
            ));
        }
        Ok(StatementResult {
            columns: vec!["n".to_string()],
            rows: vec![vec![json!(1)]],
        })
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.events.lock().push("commit".to_string());
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.events.lock().push("rollback".to_string());
        Ok(())
    }
}

pub fn driver_manager(driver: Arc<MockDriver>) -> TransactionManager {
    init_logging();
    TransactionManager::builder(ExecutionConfiguration::new("bolt://localhost:7687"))
        .driver(driver)
        .recovery_store(Arc::new(InMemoryRecoveryStore::new()))
        .server_version(parse_version("5.13.0"))
        .build()
        .unwrap()
}
