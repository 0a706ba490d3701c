//! Wire codecs.
//!
//! `spec.md` §6 defines the codec interface the core consumes as
//! `{encode(state, value), preencode(state, value), decode(state) -> value}`
//! plus a standard `encode`/`decode` wrapper the core calls. This crate
//! collapses that to the two operations the wrapper actually exposes —
//! `preencode`/`encode` staging is the wire codec library's concern, not
//! the router's — and ships the raw pass-through plus two reference
//! codecs used in tests and available to handler authors.

use bytes::Bytes;

use crate::error::CoreError;

/// A bidirectional codec between `T` and wire bytes.
pub trait Codec<T>: Send + Sync {
    /// Serialize `value` to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error describing why `value` could not be serialized.
    fn encode(&self, value: &T) -> Result<Bytes, CoreError>;

    /// Deserialize wire bytes to `T`.
    ///
    /// # Errors
    ///
    /// Returns an error describing why `bytes` could not be parsed.
    fn decode(&self, bytes: &Bytes) -> Result<T, CoreError>;
}

/// The identity codec on bytes: `encode`/`decode` are no-ops.
///
/// Used as the default `requestEncoding`/`responseEncoding` for methods
/// that declare neither (`spec.md` §3, "decoders default to a raw
/// pass-through").
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl Codec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CoreError> { Ok(value.clone()) }

    fn decode(&self, bytes: &Bytes) -> Result<Bytes, CoreError> { Ok(bytes.clone()) }
}

/// A codec between UTF-8 strings and their raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Result<Bytes, CoreError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(&self, bytes: &Bytes) -> Result<String, CoreError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CoreError::decode(format!("invalid utf-8: {e}"), None))
    }
}

/// A codec between a `serde`-serializable type and JSON bytes.
///
/// Gated behind the `json-codec` feature so the core does not force a
/// `serde_json` dependency on hosts that bring their own wire format.
#[cfg(feature = "json-codec")]
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec<T>(std::marker::PhantomData<T>);

#[cfg(feature = "json-codec")]
impl<T> JsonCodec<T> {
    /// A JSON codec for `T`.
    #[must_use]
    pub const fn new() -> Self { Self(std::marker::PhantomData) }
}

#[cfg(feature = "json-codec")]
impl<T> Codec<T> for JsonCodec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Bytes, CoreError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CoreError::encode(e.to_string(), None))
    }

    fn decode(&self, bytes: &Bytes) -> Result<T, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::decode(e.to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn raw_codec_is_the_identity() {
        let codec = RawCodec;
        let input = Bytes::from_static(b"whatever bytes");
        let decoded = codec.decode(&input).expect("decode");
        let encoded = codec.encode(&decoded).expect("encode");
        assert_eq!(encoded, input);
    }

    #[rstest]
    fn utf8_codec_round_trips() {
        let codec = Utf8Codec;
        let encoded = codec.encode(&"foo".to_owned()).expect("encode");
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, "foo");
    }

    #[rstest]
    fn utf8_codec_rejects_invalid_bytes() {
        let codec = Utf8Codec;
        let bad = Bytes::from_static(&[0xFF, 0xFE, 0xFD]);
        let err = codec.decode(&bad).expect_err("must fail");
        assert_eq!(err.code(), crate::error::ErrorCode::DecodeError);
    }

    #[cfg(feature = "json-codec")]
    #[rstest]
    fn json_codec_round_trips() {
        let codec: JsonCodec<Vec<i32>> = JsonCodec::new();
        let encoded = codec.encode(&vec![1, 2, 3]).expect("encode");
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, vec![1, 2, 3]);
    }
}
