//! modproxy-config: Configuration model for the modproxy gateway
//!
//! This crate provides configuration parsing, defaults and validation
//! for the modproxy caching module proxy.

pub mod config;

pub use config::*;
