//! Form encoding in both directions.
//!
//! The codec is protocol-agnostic text transcoding: no schema, no type
//! coercion, every value stays a string.
//!
//! ## Duplicate keys
//!
//! Decoding is last-wins. List-valued responses use distinct suffixed keys
//! (`L_TRANSACTIONID0`, `L_TRANSACTIONID1`, ...) so nothing is lost in
//! practice, but a body that repeats the exact same key keeps only its
//! final value.

use url::form_urlencoded;

use super::types::{NvpParams, NvpResponse};

/// Encode parameters as an `application/x-www-form-urlencoded` body,
/// preserving insertion order.
pub fn encode_form(params: &NvpParams) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in params.iter() {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Decode a flat `&`-joined `key=value` body.
///
/// Splits each pair on its first `=`; a pair without `=` yields an empty
/// value and pairs with an empty key are skipped.
pub fn decode_form(body: &str) -> NvpResponse {
    let mut response = NvpResponse::new();
    for (name, value) in form_urlencoded::parse(body.trim().as_bytes()) {
        if name.is_empty() {
            continue;
        }
        response.insert(name.into_owned(), value.into_owned());
    }
    response
}
