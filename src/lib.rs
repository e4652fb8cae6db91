//! # Synapse
//!
//! A reverse-proxy API gateway with declarative routes, per-route policy
//! plugin chains and atomic configuration hot reload.
//!
//! ## Features
//!
//! - Route matching over exact, prefix, regex and wildcard rules with
//!   priorities, host/method/header/query predicates and a path cache
//! - Per-route plugin chains: rate limiting, circuit breaking, interface
//!   authentication, IP whitelisting, request consistency checks and CORS
//! - Plugin result memoization keyed by a request fingerprint
//! - Atomic configuration reload driven by file watching and SIGHUP, with
//!   plugin state carried across reloads when the config is unchanged
//! - Reverse proxying with streaming bodies, per-route timeouts and
//!   capped retries for idempotent requests
//! - Internal routes (`internal://`) that answer without an upstream
//! - Structured logging via `tracing`, graceful shutdown and a PID file
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. End users
//! should prefer the re-exports documented below instead of reaching into
//! internal modules directly.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error
//! type. A custom error context is attached using `WrapErr` for
//! debuggability.

pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileConfigProvider, HttpClientAdapter, HttpHandler},
    core::{Dispatcher, GatewayService},
    ports::http_client::HttpClient,
    utils::{GracefulShutdown, ShutdownReason},
};
