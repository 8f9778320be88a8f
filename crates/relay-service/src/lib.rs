//! Callmesh signaling relay library.
//!
//! Routes call lifecycle and negotiation events between the members of a
//! call over WebSocket, and is authoritative for call rosters.
//!
//! # Modules
//!
//! - [`actors`] - controller, call and connection actors
//! - [`presence`] - online user to connection map
//! - [`ws`] - WebSocket endpoint
//! - [`config`] - configuration from environment
//! - [`errors`] - error types with client-facing codes
//! - [`observability`] - health endpoints and Prometheus metrics

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
pub mod presence;
pub mod ws;
