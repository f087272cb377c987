//! # NEOCORTEX
//!
//! A weighted signal bus for administrative back-ends. Business mutations emit
//! signals that are persisted, prioritised and routed to the cortex modules
//! subscribed to them, while the surrounding modules keep an audit trail,
//! manage dynamic configuration, take weighted decisions, notify users and
//! run asynchronous tasks on a schedule.
//!
//! The crate is organised by folders, the same way the rest of the workspace is:
//!
//! - **`core`**: the cortex modules (bus, audit trail, plasticity, decisions,
//!   notifications, tasks, scheduler, middleware) and the [`Neocortex`] facade.
//! - **`store`**: the persistence port and its in-memory backend.
//! - **`connections`**: PostgreSQL store and Redis relay (feature `connections`).
//! - **`configs`**: service settings.
//! - **`loggers`**: tracing subscriber setup.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Error type shared by every module of the crate.
pub mod error;
/// The cortex modules and the lifecycle facade.
pub mod core;
/// Persistence port and in-memory backend.
pub mod store;
/// Service settings with defaults.
pub mod configs;
/// Structured logging setup.
pub mod loggers;
/// PostgreSQL and Redis backends.
#[cfg(feature = "connections")]
pub mod connections;

// Re-export the types most callers need.
pub use crate::core::neocortex::Neocortex;
pub use crate::core::signal::*;
pub use crate::error::{NeocortexError, Result};
