//! Real-time side of the feedback timeline.
//!
//! - [`outbox`]: bounded per-session delivery queue with presence-first eviction.
//! - [`hub`]: per-video fan-out of annotation and presence events.
//! - [`registry`]: live sessions, heartbeats and reaping.
//! - [`reconcile`]: catch-up on connect followed by a gap-free live handoff.
//! - [`service`]: the transport-agnostic [`FeedbackService`] facade.

pub mod hub;
pub mod outbox;
pub mod reaper;
pub mod reconcile;
pub mod registry;
pub mod service;

pub use hub::{Handoff, SyncHub};
pub use outbox::{Delivery, SessionOutbox};
pub use registry::SessionRegistry;
pub use service::{Connection, FeedbackService};
