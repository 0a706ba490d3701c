//! Core of an RPC responder framework for a multiplexed, length-delimited,
//! peer-to-peer transport.
//!
//! This crate lets a server author register named methods, layer
//! cross-cutting middleware around every invocation, and attach the
//! resulting responder set to any newly established peer connection. It
//! also ships a small catalog of built-in middleware: per-key token-bucket
//! rate limiting ([`limiter::rate`]), per-key concurrent-request limiting
//! ([`limiter::concurrency`]), a payload-encoding adapter ([`encoding`]),
//! and a capability handshake verifier ([`capability`]).
//!
//! The underlying transport (framing, stream multiplexing, connection
//! establishment, DHT lookup), the wire codec library, a generic metrics
//! registry, and any testnet harness are external collaborators; this
//! crate defines only the narrow traits ([`transport::Transport`],
//! [`transport::Connection`], [`codec::Codec`], [`metrics::MetricsRegistry`])
//! it needs from them.
#![cfg_attr(test, expect(clippy::unwrap_used, reason = "test code can panic"))]
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "test code with known bounds")
)]
#![cfg_attr(test, expect(clippy::shadow_reuse, reason = "test code shadowing"))]
#![cfg_attr(
    test,
    expect(clippy::let_underscore_must_use, reason = "test cleanup code")
)]

pub mod capability;
pub mod codec;
pub mod context;
pub mod encoding;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod transport;

pub use capability::CapabilityGate;
pub use context::RequestContext;
pub use error::{CoreError, ErrorCode, RoutedError};
pub use middleware::Middleware;
pub use router::Router;
