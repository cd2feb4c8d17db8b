//! Logging setup for the coordinator binary

pub mod logging;

pub use logging::{default_log_dir, init_production_logging, init_simple_logging};
