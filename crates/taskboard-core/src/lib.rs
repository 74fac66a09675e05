//! taskboard-core library.
//!
//! Client-side sync core for a realtime task board: a local mirror of the
//! server's collections kept current by realtime push events, a change bus
//! that fans every change out to mounted queries, and a persistent cache
//! that serves the last known data on start-up.
//!
//! # Conventions
//!
//! - **Errors**: operations return [`error::SyncError`]; application-level
//!   entry points such as [`client::SyncClient::open`] use `anyhow::Result`.
//! - **Logging**: use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod bus;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod mutation;
pub mod projection;
pub mod query;
pub mod realtime;
pub mod service;
pub mod session;

pub use client::SyncClient;
pub use error::SyncError;
