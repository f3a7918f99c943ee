//! Offline resilience agent for the Stride training tracker.
//!
//! Intercepts every outbound request from the web app, serves it through a
//! per-route caching strategy, synthesizes an offline response when neither
//! network nor cache can answer, and queues failed workout submissions for
//! replay once connectivity returns.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod offline;
pub mod queue;
pub mod router;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use config::Config;
pub use error::{Error, NetworkError, Result};
pub use http::{Headers, Method, Request, Response};
