//! Order and payment orchestration for game top-ups.
//!
//! Orders move through a versioned state machine in the [`services::order_ledger`];
//! payment webhooks, fulfillment and refunds all advance it with
//! compare-and-swap writes.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
