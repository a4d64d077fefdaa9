//! Configuration module for Avior
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and the typed per-module settings consumed by the comparator pipeline.

pub mod config;
pub mod modules;

pub use config::*;
pub use modules::*;
