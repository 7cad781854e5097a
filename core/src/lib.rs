// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # NVP Proxy: Core Library
//!
//! Everything the proxy does that is not HTTP plumbing: speaking the
//! legacy name-value-pair payment dialect, deciding whose credentials sign
//! a call, and keeping a redacted, observable log of all of it.
//!
//! ## Architecture
//!
//! - **config**: constants, `Environment`, upstream endpoints.
//! - **nvp**: the wire codec, the transport seam and the dispatcher.
//! - **credentials**: per-session credential state and the saved-key
//!   repository trait.
//! - **keystore**: the sled-backed saved-key repository.
//! - **events**: ring-buffered log with redaction and live fan-out.
//! - **ratelimit**: fixed-window per-client limiter.
//!
//! Nothing here is global. The binary builds one `EventHub`, one
//! `NvpClient` and one `RateLimiter` and shares them through `Arc`.

pub mod config;
pub mod credentials;
pub mod events;
pub mod keystore;
pub mod nvp;
pub mod ratelimit;

pub use nvp::{codec, dispatcher};

pub use config::{Endpoints, Environment};
pub use credentials::{
    resolve_active, unlock_saved_key, verify_saved_key, CredentialError, CredentialRepository,
    CredentialSet, SessionContext,
};
pub use events::{EventHub, LogRecord, NewRecord};
pub use keystore::KeyStore;
pub use nvp::{NvpClient, NvpError, NvpParams, NvpResponse};
pub use ratelimit::{RateDecision, RateLimited, RateLimiter};
