//! Error types for the tunnel core.

use thiserror::Error;

use crate::wire::{AlertCode, AlertLevel};
use crypto::aead::CipherSuite;
use crypto::CryptoError;

/// Errors surfaced by the tunnel's public API.
///
/// Descriptions are opaque to callers and never carry secret material.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid key size")]
    InvalidKeySize,

    #[error("invalid nonce")]
    InvalidNonce,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// AEAD tag mismatch on a record or Finished message.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("unsupported cipher suite 0x{0:04x}")]
    UnsupportedCipherSuite(u16),

    #[error("cipher suite {0} is not FIPS approved")]
    CipherSuiteNotFipsApproved(CipherSuite),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("message too large: {size} exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("handshake failure: {0}")]
    HandshakeFailure(&'static str),

    /// The per-key record counter reached its hard limit.
    #[error("nonce exhausted")]
    NonceExhausted,

    #[error("rekey already in progress")]
    RekeyInProgress,

    /// A send was attempted past the rekey activation point before the
    /// peer's rekey response arrived.
    #[error("rekey required before further sends")]
    RekeyRequired,

    /// A record fell below the replay window or was already seen. Dropped
    /// silently by the transport; never fatal on its own.
    #[error("replayed or stale record")]
    ReplayedRecord,

    #[error("operation timed out")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an alert.
    #[error("peer alert: {level} {code}")]
    PeerAlert { level: AlertLevel, code: AlertCode },

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A primitive failed; the tag names the operation, never the
    /// underlying library's message.
    #[error("crypto failure during {op}")]
    Crypto { op: &'static str },
}

impl TunnelError {
    /// Wrap a primitive error with an operation tag, preserving the kinds
    /// that have a direct protocol meaning.
    pub fn from_crypto(err: CryptoError, op: &'static str) -> Self {
        match err {
            CryptoError::AuthenticationFailed => TunnelError::AuthenticationFailed,
            CryptoError::NonceExhausted => TunnelError::NonceExhausted,
            CryptoError::InvalidKey => TunnelError::InvalidPublicKey,
            CryptoError::InvalidCiphertext => TunnelError::InvalidCiphertext,
            CryptoError::InvalidNonce => TunnelError::InvalidNonce,
            CryptoError::InvalidLength { .. } => TunnelError::InvalidMessage("bad field length"),
            _ => TunnelError::Crypto { op },
        }
    }

}

impl From<CryptoError> for TunnelError {
    fn from(err: CryptoError) -> Self {
        TunnelError::from_crypto(err, "primitive")
    }
}

/// Result alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;
