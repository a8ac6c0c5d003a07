// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction scopes and backend transaction handles

pub mod driver;
pub mod handle;
pub mod http;
pub mod manager;
pub mod scope;
pub mod scope_handle;
pub(crate) mod sequencer;
pub mod state;

pub use driver::{DriverError, DriverTransaction, GraphDriver, SessionTransaction};
pub use handle::TransactionHandle;
pub use http::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransaction, HttpTransport, TransportError,
};
pub use manager::{Backend, BeginOptions, TransactionManager, TransactionManagerBuilder};
pub use scope::{ScopeRecord, TransactionContext};
pub use scope_handle::ScopeHandle;
pub use state::{ScopeOption, TransactionState};
