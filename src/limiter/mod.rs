//! Per-key limiter engines and the middleware built on top of them.
//!
//! `spec.md` §1 singles these out as carrying the only non-trivial
//! algorithmic content in the system: token accounting and lazy eviction
//! for the rate limiter (§4.C), in-flight accounting for the concurrency
//! limiter (§4.D). Both key on either the peer's remote address or a
//! base64 encoding of its 32-byte public key (§4.C, "Keying").

pub mod concurrency;
pub mod rate;

use base64::Engine as _;

use crate::transport::Connection;

/// Base64-encode a peer's 32-byte identity key into the string keys both
/// limiter engines use internally.
#[must_use]
pub fn public_key_string(connection: &dyn Connection) -> String {
    base64::engine::general_purpose::STANDARD.encode(connection.remote_public_key())
}

/// The peer's remote host string, used verbatim as a limiter key.
#[must_use]
pub fn remote_address_string(connection: &dyn Connection) -> String { connection.remote_address() }
