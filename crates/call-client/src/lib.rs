//! Callmesh call client core.
//!
//! Orchestrates voice, video and huddle calls in a peer-to-peer mesh: the
//! call session state machine, the pool of peer connections (one per remote
//! participant), and the local capture devices. The WebRTC engine, capture
//! devices and REST API are collaborators behind traits; this crate decides
//! *when* connections exist and *what* signaling data is relayed.
//!
//! # Architecture
//!
//! ```text
//! CallSessionHandle ──► session actor (one task, one mailbox)
//!                        ├── MediaDeviceController ─► dyn MediaDevices
//!                        ├── PeerConnectionPool ────► dyn PeerConnectionFactory
//!                        ├── dyn CallApi (REST)
//!                        └── dyn SignalingChannel ◄─► relay
//! ```
//!
//! Local actions, inbound signaling events, peer events and completions of
//! background work all funnel into the session actor, so transitions never
//! interleave.
//!
//! # Modules
//!
//! - [`session`] - the call state machine and its handle
//! - [`peer`] - peer connection pool and engine traits
//! - [`media`] - local capture, track toggles and screen share
//! - [`signaling`] - signaling channel trait and WebSocket transport
//! - [`api`] - REST collaborator
//! - [`config`] - configuration from environment
//! - [`errors`] - error types

#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod errors;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
