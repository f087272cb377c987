/// Console and rolling JSON file layers for `tracing`.
pub mod setup;

pub use setup::setup_logging;
