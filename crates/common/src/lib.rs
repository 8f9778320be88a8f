//! Common types shared across Callmesh components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for the call model shared by client and relay
pub mod types;

/// Module for the signaling wire protocol
pub mod protocol;

/// Module for common configuration
pub mod config;
