//! Call session: the state machine that orchestrates one user's calls.
//!
//! `CallSessionHandle` talks to a single actor task that owns the media
//! controller, the peer connection pool and all call state. Local actions,
//! signaling events, peer events and completions of background work all
//! arrive through that actor, so transitions never interleave.
//!
//! ```text
//! Idle ──start_call──► Outgoing ──participant-joined──► Active
//!   │                                                    ▲
//!   └──incoming-call──► Incoming ──accept_incoming_call──┘
//!
//! leave / reject / call-ended / timeout ──► Idle (cleanup)
//! ```

mod actor;
pub mod messages;
pub mod state;

pub use actor::{CallSessionHandle, SessionDeps};
pub use state::{
    CallNotice, CallState, EndReason, PeerSummary, SessionConfig, SessionSnapshot,
    DEFAULT_RECONNECT_GRACE,
};
