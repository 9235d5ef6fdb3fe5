//! Cryptographic core for the Cascade tunnel.
//!
//! This crate provides the primitives the tunnel is built from:
//! - CH-KEM: a cascaded hybrid KEM combining X25519 and ML-KEM-1024 (FIPS 203)
//! - A SHAKE-256 key schedule with length-prefixed domain separation
//! - AES-256-GCM and ChaCha20-Poly1305 AEAD with counter-based nonces
//! - OS-CSPRNG access and FIPS-mode self-tests
//!
//! All secret material is zeroized on drop. Public APIs never expose
//! private key bytes.

pub mod aead;
pub mod chkem;
pub mod ct;
pub mod error;
pub mod kdf;
pub mod ml_kem;
pub mod rng;
pub mod selftest;
pub mod x25519;

pub use error::CryptoError;
