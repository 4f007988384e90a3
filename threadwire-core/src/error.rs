//! Error types for the threadwire protocol engine.

use thiserror::Error;

/// Error type for the threadwire protocol engine.
///
/// Each variant carries the minimal context needed to act on it. None of the
/// variants include key material, plaintext, or password bytes.
#[derive(Debug, Error)]
pub enum Error {
    /// A required storage entry was missing (identity, invitation, thread-info, thread key).
    #[error("not found: {key}")]
    NotFound {
        /// The storage key that was looked up.
        key: String,
    },

    /// Unwrapping an identity's private key under the supplied password failed.
    #[error("bad password")]
    BadPassword,

    /// JWS verification failed after the verifying key was determined.
    #[error("bad signature")]
    BadSignature,

    /// No rule identified a verification key for an incoming message.
    #[error("unverified signer")]
    UnverifiedSigner,

    /// AES-GCM authentication tag did not match during decryption.
    #[error("bad ciphertext")]
    BadCiphertext,

    /// A JWS failed to parse, or was missing a required header/payload field.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The first reply in a thread lacked an embedded `jwk` header or `epk` payload field.
    #[error("malformed first reply")]
    MalformedFirstReply,

    /// The `re` field of an incoming reply did not resolve to a known invitation.
    #[error("unknown invitation: {0}")]
    UnknownInvitation(String),

    /// The `re` field of an incoming reply did not resolve to a known thread.
    #[error("unknown thread: {0}")]
    UnknownThread(String),

    /// A reply's `messageId` was not exactly one greater than the expected predecessor.
    #[error("out of order: expected {expected}, got {actual}")]
    OutOfOrder {
        /// The message id that should have followed the previous one.
        expected: u64,
        /// The message id that was actually received.
        actual: u64,
    },

    /// Self-encrypting or self-signing a value produced a result that failed its own
    /// round-trip check.
    #[error("self-encrypt mismatch")]
    SelfEncryptMismatch,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedEnvelope(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::MalformedEnvelope(err.to_string())
    }
}

/// Result type for the threadwire protocol engine.
pub type Result<T> = std::result::Result<T, Error>;
