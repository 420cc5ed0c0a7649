//! # Metrics Refresher Library
//!
//! Background scheduler that keeps engagement metrics of tracked posts up to
//! date against a rate-limited lookup API, plus its read-only status surface.

pub mod applier;
pub mod config;
pub mod db;
pub mod error;
pub mod freshness;
pub mod handlers;
pub mod lookup;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod selector;
pub mod server;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
