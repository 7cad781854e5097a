//! # Event Subsystem
//!
//! In-process, user-facing log of everything the proxy does, plus live
//! fan-out to connected observers.
//!
//! ```text
//!  producer ──NewRecord──▶ EventHub::insert
//!                            │ stamp (id, ts)
//!                            │ redact
//!                            │ LogRing::push   (evicts oldest)
//!                            └ fan out ──▶ observer queues ──▶ SSE / WebSocket
//! ```
//!
//! - [`record`]: the `LogRecord` envelope and its builder.
//! - [`redact`]: content-based secret masking.
//! - [`sink`]: the fixed-capacity ring and its queries.
//! - [`hub`]: the broadcaster tying the three together.

pub mod hub;
pub mod record;
pub mod redact;
pub mod sink;

pub use hub::{EventHub, ObserverId, ObserverKind, Subscription};
pub use record::{source, LogRecord, NewRecord};
pub use redact::Redactor;
pub use sink::{HubStats, LogRing, Order};
