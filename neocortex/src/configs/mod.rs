//! # Configuration Modules
//!
//! Static service settings loaded from defaults and an optional JSON file.

/// Scheduler cadence, relay channel and mail sender settings.
pub mod settings;

pub use settings::{default_entries, ClockSettings, NeocortexSettings};
