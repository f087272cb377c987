//! # Cortex Modules
//!
//! The nervous system, one module per cortex. Every module holds shared
//! handles (`Arc<dyn Store>`, `Arc<dyn Relay>`) and is cheap to clone.

/// Types, constants and helpers shared by every cortex.
pub mod signal;
/// Pub/sub and cache port.
pub mod relay;
/// Signal bus: emission, routing and fan-out.
pub mod limbic;
/// Audit trail and activity metrics.
pub mod hippocampus;
/// Dynamic configuration and adaptive weights.
pub mod plasticity;
/// Weighted decisions and workflow state machines.
pub mod prefrontal;
/// User notifications.
pub mod auditory;
/// E-mail templates and delivery.
pub mod mailer;
/// Asynchronous task queue.
pub mod motor;
/// Scheduled maintenance.
pub mod circadian;
/// Automatic signals and audit for HTTP mutations.
pub mod middleware;
/// Facade and lifecycle.
pub mod neocortex;
