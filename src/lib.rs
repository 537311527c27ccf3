//! Idempotency gateway: request deduplication for POST/PATCH APIs.
//!
//! The library holds the decision engine, its stores and the axum adapter;
//! the `idemgate` binary wires them into a server.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod jobs;
pub mod lock;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod sanitize;
pub mod store;
