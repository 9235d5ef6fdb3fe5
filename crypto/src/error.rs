use thiserror::Error;

/// Errors produced by the primitive layer.
///
/// Variants deliberately carry no secret material and no messages from the
/// underlying cryptographic libraries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid length: expected {expected} bytes, found {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid key")]
    InvalidKey,

    #[error("invalid nonce")]
    InvalidNonce,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("nonce counter exhausted")]
    NonceExhausted,

    /// The X25519 exchange produced an all-zero shared secret, meaning the
    /// peer supplied a low-order public key.
    #[error("weak shared secret")]
    WeakSharedSecret,

    #[error("decapsulation failed")]
    DecapsulationFailed,

    /// KDF output length outside the allowed `1..=2^20` byte range.
    #[error("invalid KDF output length: {requested}")]
    InvalidOutputLength { requested: usize },

    #[error("self-test failed: {test}")]
    SelfTestFailed { test: &'static str },

    /// The continuous RNG test observed two identical consecutive blocks.
    #[error("rng failure")]
    RngFailure,

    /// Internal failure in an underlying primitive, tagged by operation.
    #[error("crypto operation failed: {op}")]
    Internal { op: &'static str },
}
