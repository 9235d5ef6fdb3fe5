//! Protocol constants and shared types.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::Result;
use crypto::kdf;

/// Frame header: 1-byte type + 4-byte big-endian length.
pub const HEADER_SIZE: usize = 5;
/// Default cap on a decoded frame payload.
pub const MAX_MESSAGE_SIZE: usize = 65_536;
/// Session identifiers are 16 bytes.
pub const SESSION_ID_LEN: usize = 16;
/// Anti-replay window width in sequence numbers.
pub const REPLAY_WINDOW_WIDTH: u64 = 1024;

/// Rekey trigger defaults.
pub const DEFAULT_REKEY_AFTER_BYTES: u64 = 1 << 30;
pub const DEFAULT_REKEY_AFTER_PACKETS: u64 = 1 << 28;
pub const DEFAULT_REKEY_AFTER_SECS: u64 = 3600;

/// How far ahead of the current send counter a planned rekey activates.
pub const REKEY_ACTIVATION_LEAD: u64 = 16;

/// Protocol version; only the major half gates compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub fn is_compatible(self, other: ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl core::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 16-byte session identifier, chosen by the responder.
pub type SessionId = [u8; SESSION_ID_LEN];

/// Generate a fresh session identifier from the OS CSPRNG.
pub fn generate_session_id() -> SessionId {
    crypto::rng::random_array()
}

/// Which side of the handshake this peer played.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Session lifecycle. Transitions are monotone except
/// `Rekeying -> Established`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    HandshakeInProgress,
    Established,
    Rekeying,
    Closed,
    Failed,
}

/// Directional key material produced by a key-schedule expansion.
///
/// The handshake expansion carries explicit IVs; the traffic expansion has
/// none, so traffic records run with zero base IVs and the sequence number
/// alone forms the nonce. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub initiator_key: [u8; 32],
    pub responder_key: [u8; 32],
    pub initiator_iv: [u8; 12],
    pub responder_iv: [u8; 12],
}

impl KeyMaterial {
    /// Handshake expansion: 88 bytes split into `(ik, rk, iiv, riv)`.
    pub fn for_handshake(master: &[u8; 32]) -> Result<Self> {
        let okm = Zeroizing::new(kdf::derive(kdf::DOMAIN_HANDSHAKE, master, 88)?);
        let mut material = KeyMaterial::zeroed();
        material.initiator_key.copy_from_slice(&okm[..32]);
        material.responder_key.copy_from_slice(&okm[32..64]);
        material.initiator_iv.copy_from_slice(&okm[64..76]);
        material.responder_iv.copy_from_slice(&okm[76..88]);
        Ok(material)
    }

    /// Traffic expansion: 64 bytes split into `(ik, rk)`; IVs stay zero.
    pub fn for_traffic(master: &[u8; 32]) -> Result<Self> {
        let okm = Zeroizing::new(kdf::derive(kdf::DOMAIN_TRAFFIC, master, 64)?);
        let mut material = KeyMaterial::zeroed();
        material.initiator_key.copy_from_slice(&okm[..32]);
        material.responder_key.copy_from_slice(&okm[32..64]);
        Ok(material)
    }

    fn zeroed() -> Self {
        KeyMaterial {
            initiator_key: [0u8; 32],
            responder_key: [0u8; 32],
            initiator_iv: [0u8; 12],
            responder_iv: [0u8; 12],
        }
    }

    /// Key and IV this role writes with.
    pub fn write_half(&self, role: Role) -> (&[u8; 32], &[u8; 12]) {
        match role {
            Role::Initiator => (&self.initiator_key, &self.initiator_iv),
            Role::Responder => (&self.responder_key, &self.responder_iv),
        }
    }

    /// Key and IV this role reads with.
    pub fn read_half(&self, role: Role) -> (&[u8; 32], &[u8; 12]) {
        match role {
            Role::Initiator => (&self.responder_key, &self.responder_iv),
            Role::Responder => (&self.initiator_key, &self.initiator_iv),
        }
    }
}

/// Advance the master secret during a rekey:
/// `M' = derive_multi(Rekey, [M, fresh_secret], 32)`.
pub fn advance_master(
    master: &[u8; 32],
    fresh_secret: &[u8],
) -> Result<Zeroizing<[u8; 32]>> {
    let out = kdf::derive_multi_array::<32>(kdf::DOMAIN_REKEY, &[master, fresh_secret])?;
    Ok(Zeroizing::new(out))
}

/// XOR a sequence number into the low 8 bytes of a base IV.
pub fn record_nonce(base_iv: &[u8; 12], seq: u64) -> [u8; 12] {
    let mut nonce = *base_iv;
    for (slot, byte) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
        *slot ^= byte;
    }
    nonce
}

/// Additional authenticated data for a record: `type || be64(seq)`.
pub fn record_aad(record_type: u8, seq: u64) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = record_type;
    aad[1..].copy_from_slice(&seq.to_be_bytes());
    aad
}
