//! Infrastructure - cold path only
//!
//! This module contains non-latency-critical code:
//! - Configuration management
//! - Logging
//! - Transport metrics

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError, EngineConfig, FeedConfig, FeedProtocol, LoggingConfig};
pub use metrics::{TransportMetrics, TransportSnapshot};
