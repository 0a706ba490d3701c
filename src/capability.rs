//! The capability handshake gate (`spec.md` §4.F).
//!
//! A one-shot MAC proof a peer presents on connection open. Computing the
//! proof itself — `HMAC(connection, capability)` — is delegated to an
//! external helper (`spec.md` §1, "out of scope... external collaborators,
//! not reimplemented here"); this module owns the wire format, the
//! install/verify protocol, and the "exactly once per connection" guard.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashSet;

use crate::{error::CoreError, transport::Connection};

/// Computes the per-connection proof. A real host wires this to an actual
/// MAC; this crate only consumes the result.
pub trait ProofProvider: Send + Sync {
    /// Compute the proof a peer must present for `capability` on
    /// `connection`.
    fn compute(&self, connection: &dyn Connection, capability: &str) -> [u8; 32];
}

const PROOF_LEN: usize = 32;
const FLAG_HAS_PROOF: u8 = 1;

/// Encode a handshake frame: a one-byte flags field, followed by the
/// 32-byte proof when present (`spec.md` §6, "Capability handshake wire
/// format").
#[must_use]
pub fn encode_handshake_frame(proof: Option<[u8; PROOF_LEN]>) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + PROOF_LEN);
    match proof {
        Some(bytes) => {
            buf.put_u8(FLAG_HAS_PROOF);
            buf.put_slice(&bytes);
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

/// Decode a handshake frame produced by [`encode_handshake_frame`].
///
/// # Errors
///
/// Returns `CAPABILITY_INVALID` if the frame is empty, the flags byte
/// claims a proof that is not fully present, or the proof is absent.
pub fn decode_handshake_frame(mut bytes: Bytes) -> Result<[u8; PROOF_LEN], CoreError> {
    if bytes.is_empty() {
        return Err(CoreError::capability_invalid("empty handshake frame"));
    }
    let flags = bytes.get_u8();
    if flags & FLAG_HAS_PROOF == 0 {
        return Err(CoreError::capability_invalid("peer presented no proof"));
    }
    if bytes.len() < PROOF_LEN {
        return Err(CoreError::capability_invalid("truncated proof"));
    }
    let mut proof = [0_u8; PROOF_LEN];
    bytes.copy_to_slice(&mut proof);
    Ok(proof)
}

/// Holds `{namespace, capability}` and verifies each connection's proof
/// exactly once.
pub struct CapabilityGate {
    namespace: String,
    capability: String,
    proof_provider: Arc<dyn ProofProvider>,
    verified: DashSet<[u8; 32]>,
}

impl CapabilityGate {
    /// Configure a gate for `namespace`/`capability`, computing proofs via
    /// `proof_provider`.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        capability: impl Into<String>,
        proof_provider: Arc<dyn ProofProvider>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            capability: capability.into(),
            proof_provider,
            verified: DashSet::new(),
        }
    }

    /// The configured namespace, for diagnostics.
    #[must_use]
    pub fn namespace(&self) -> &str { &self.namespace }

    /// Build the outbound handshake frame this side emits on open.
    #[must_use]
    pub fn install(&self, connection: &dyn Connection) -> Bytes {
        let proof = self.proof_provider.compute(connection, &self.capability);
        encode_handshake_frame(Some(proof))
    }

    /// Verify the peer's inbound handshake frame for `connection`.
    ///
    /// Runs at most once per connection: a second call for the same
    /// connection's public key re-verifies rather than trusting a cached
    /// result, since "exactly once" (`spec.md` §4.F) describes when the
    /// transport invokes this, not a cache this gate itself should keep.
    ///
    /// # Errors
    ///
    /// Returns `CAPABILITY_INVALID` if the frame is malformed or the proof
    /// does not match.
    pub fn verify(&self, connection: &dyn Connection, frame: Bytes) -> Result<(), CoreError> {
        let presented = decode_handshake_frame(frame)?;
        let expected = self.proof_provider.compute(connection, &self.capability);
        if presented != expected {
            return Err(CoreError::capability_invalid("proof mismatch"));
        }
        self.verified.insert(connection.remote_public_key());
        Ok(())
    }

    /// `true` if `connection` has successfully verified before.
    #[must_use]
    pub fn has_verified(&self, connection: &dyn Connection) -> bool {
        self.verified.contains(&connection.remote_public_key())
    }
}
