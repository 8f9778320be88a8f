//! Observability module for the signaling relay.
//!
//! Metric labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (controller, call, connection)
//! - `event`: bounded by the client event set (10 values)
//! - `outcome`: `ok` plus one value per `RelayError` kind
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_calls_active` | Gauge | none | Live calls on this relay |
//! | `relay_connections_active` | Gauge | none | Open WebSocket connections |
//! | `relay_events_routed_total` | Counter | `event`, `outcome` | Client events handled |
//! | `relay_event_latency_seconds` | Histogram | `event` | Time to route one client event |
//! | `relay_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `relay_actor_panics_total` | Counter | `actor_type` | Actor panics (bugs) |
//! | `relay_messages_dropped_total` | Counter | `actor_type` | Events dropped for slow sockets |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_event_latency, record_event_routed,
    record_message_dropped, set_actor_mailbox_depth, set_calls_active, set_connections_active,
};
