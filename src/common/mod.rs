//! Common Infrastructure Module
//!
//! Shared utilities and configuration for nutzapd.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{ConfigError, EngineConfig, LiveMode};
pub use error::{EngineError, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_discovery_event,
    log_redemption_event, ErrorDetails, EventCategory, LogEvent, LogLevel, LoggingError,
};
