//! Configuration module for the ingest daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of the thresholds the classifier cannot run without.

pub mod config;

pub use config::*;
