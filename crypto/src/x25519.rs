//! X25519 Diffie-Hellman (RFC 7748).
//!
//! Thin wrapper over `x25519-dalek` with contributory-behavior checking:
//! an all-zero shared secret (low-order peer point) is rejected.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const X25519_PUBLIC_KEY_LEN: usize = 32;
pub const X25519_SECRET_KEY_LEN: usize = 32;
pub const X25519_SHARED_SECRET_LEN: usize = 32;

/// An X25519 keypair. The secret scalar is zeroized on drop.
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Generate a keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Build a keypair from fixed secret bytes.
    ///
    /// Test-only behavior: production key generation always goes through
    /// [`X25519KeyPair::generate`].
    pub fn from_seed(seed: &[u8; X25519_SECRET_KEY_LEN]) -> Self {
        let secret = StaticSecret::from(*seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; X25519_PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Run the X25519 function against a peer public key.
    ///
    /// Fails with [`CryptoError::WeakSharedSecret`] when the result is the
    /// all-zero string, which happens exactly when the peer point is of low
    /// order.
    pub fn diffie_hellman(
        &self,
        peer_public: &[u8; X25519_PUBLIC_KEY_LEN],
    ) -> Result<Zeroizing<[u8; X25519_SHARED_SECRET_LEN]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        let bytes = Zeroizing::new(*shared.as_bytes());
        if crate::ct::ct_eq(bytes.as_ref(), &[0u8; X25519_SHARED_SECRET_LEN]) {
            return Err(CryptoError::WeakSharedSecret);
        }
        Ok(bytes)
    }
}

impl core::fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("X25519KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Parse a 32-byte public key from a slice.
pub fn parse_public(bytes: &[u8]) -> Result<[u8; X25519_PUBLIC_KEY_LEN], CryptoError> {
    if bytes.len() != X25519_PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidLength {
            expected: X25519_PUBLIC_KEY_LEN,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; X25519_PUBLIC_KEY_LEN];
    out.copy_from_slice(bytes);
    Ok(out)
}
