//! # NVP Protocol
//!
//! Client side of the name-value-pair payment dialect: flat
//! `application/x-www-form-urlencoded` bodies in both directions, every
//! request signed with `USER` / `PWD` / `SIGNATURE`.
//!
//! - [`types`]: `NvpParams` (outbound, ordered) and `NvpResponse` (inbound).
//! - [`codec`]: form encoding and decoding.
//! - [`transport`]: the HTTP seam.
//! - [`dispatcher`]: builds, sends and logs calls.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod transport;
pub mod types;

pub use codec::{decode_form, encode_form};
pub use dispatcher::{CallObserver, CallOutcome, NvpCall, NvpClient};
pub use error::{NvpError, NvpResult};
pub use transport::{HttpTransport, NvpTransport, RawReply};
pub use types::{Ack, NvpErrorDetail, NvpParams, NvpResponse};
