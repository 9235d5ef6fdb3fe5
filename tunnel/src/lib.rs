//! Post-quantum tunnel core.
//!
//! This crate implements a point-to-point, stream-oriented secure channel
//! whose key exchange is a Cascaded Hybrid KEM (CH-KEM) of X25519 and
//! ML-KEM-1024, combined through a SHAKE-256 key schedule.
//!
//! # Protocol Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Four-Message Handshake                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ClientHello     │  version, random, CH-KEM pk, suites      │
//! │  ServerHello     │  version, random, CH-KEM ct, suite       │
//! │  ClientFinished  │  verify_data under handshake keys        │
//! │  ServerFinished  │  verify_data under handshake keys        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! After the handshake, traffic flows as sequence-numbered AEAD records
//! over a framed byte-stream conduit. Rekeys run in-band: a fresh CH-KEM
//! exchange advances the master secret, and both directions cut over to
//! the new keys at an agreed activation sequence number.
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_tunnel::{Tunnel, TunnelConfig};
//!
//! let config = TunnelConfig::builder().build()?;
//! let mut tunnel = Tunnel::connect(stream, config).await?;
//! tunnel.send(b"Hello, quantum world!").await?;
//! ```

pub mod config;
pub mod error;
pub mod handshake;
pub mod observer;
pub mod replay;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use crypto::aead::CipherSuite;
pub use error::{Result, TunnelError};
pub use observer::{NoopObserver, SessionObserver};
pub use session::{Session, SessionStats};
pub use transport::Tunnel;
pub use types::{Role, SessionId, SessionState};
