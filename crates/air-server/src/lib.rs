//! # air-server
//!
//! HTTP and WebSocket front end of the Air relay: configuration, routes,
//! the MySQL access store, error responses and metrics.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod store;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
