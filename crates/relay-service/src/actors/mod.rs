//! Actor hierarchy for the signaling relay.
//!
//! ```text
//! RelayControllerActor (singleton)
//! ├── owns the call table and presence writes
//! └── supervises N CallActors (one per live call)
//!
//! ConnectionActor (one per WebSocket, registered in presence)
//! ```
//!
//! Call actors deliver events straight to connection actors through the
//! presence registry; the controller is not on the per-event path.

pub mod call;
pub mod connection;
pub mod controller;
pub mod messages;
pub mod metrics;

pub use call::{CallActor, CallActorHandle};
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use controller::{ControllerSettings, RelayControllerHandle};
pub use messages::{CallSnapshot, NewCall, RelayStatus};
pub use metrics::{ActorType, MailboxMonitor, RelayMetrics};
