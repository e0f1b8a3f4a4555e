// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps billing messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Billsync API Library
//!
//! HTTP surface for billing: Stripe webhook intake, checkout, quota checks
//! and the admin subscription and plan endpoints.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
