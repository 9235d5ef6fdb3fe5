//! AEAD construction shared by the record layer and the handshake.
//!
//! Two suites are supported: AES-256-GCM (0x0001) and ChaCha20-Poly1305
//! (0x0002). A handle manages a monotonically increasing 64-bit counter
//! packed big-endian into the low 8 bytes of a 12-byte nonce; explicit-nonce
//! variants exist for records that derive the nonce from their sequence
//! number and for known-answer tests.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::CryptoError;

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

/// Hard cap on the number of records sealed under one key.
pub const NONCE_COUNTER_LIMIT: u64 = 1 << 28;
/// Counter value at which the owner should rotate keys (90% of the cap).
pub const NONCE_REKEY_THRESHOLD: u64 = NONCE_COUNTER_LIMIT / 10 * 9;

/// Negotiable AEAD suites with their wire identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub const fn wire_id(self) -> u16 {
        match self {
            CipherSuite::Aes256Gcm => 0x0001,
            CipherSuite::ChaCha20Poly1305 => 0x0002,
        }
    }

    pub fn from_wire(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(CipherSuite::Aes256Gcm),
            0x0002 => Some(CipherSuite::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub const fn is_fips_approved(self) -> bool {
        matches!(self, CipherSuite::Aes256Gcm)
    }

    /// The suites this build supports, in preference order.
    pub fn supported(fips_mode: bool) -> &'static [CipherSuite] {
        if fips_mode {
            &[CipherSuite::Aes256Gcm]
        } else {
            &[CipherSuite::Aes256Gcm, CipherSuite::ChaCha20Poly1305]
        }
    }
}

impl core::fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CipherSuite::Aes256Gcm => write!(f, "AES-256-GCM"),
            CipherSuite::ChaCha20Poly1305 => write!(f, "ChaCha20-Poly1305"),
        }
    }
}

enum SuiteCipher {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

/// One-direction AEAD handle.
pub struct AeadCipher {
    cipher: SuiteCipher,
    suite: CipherSuite,
    counter: u64,
}

impl AeadCipher {
    /// Construct a handle from a 32-byte key.
    pub fn new(suite: CipherSuite, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != AEAD_KEY_LEN {
            return Err(CryptoError::InvalidLength {
                expected: AEAD_KEY_LEN,
                actual: key.len(),
            });
        }
        let cipher = match suite {
            CipherSuite::Aes256Gcm => SuiteCipher::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?,
            )),
            CipherSuite::ChaCha20Poly1305 => SuiteCipher::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?,
            )),
        };
        Ok(Self {
            cipher,
            suite,
            counter: 0,
        })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Current value of the internal nonce counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Whether the counter has crossed the 90% rotation threshold.
    pub fn needs_rekey(&self) -> bool {
        self.counter >= NONCE_REKEY_THRESHOLD
    }

    /// Seal with the internal counter; output is `nonce || ciphertext || tag`.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter >= NONCE_COUNTER_LIMIT {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = pack_nonce(self.counter);
        self.counter += 1;

        let mut out = Vec::with_capacity(AEAD_NONCE_LEN + plaintext.len() + AEAD_TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&self.seal_with_nonce(&nonce, plaintext, aad)?);
        Ok(out)
    }

    /// Open a `nonce || ciphertext || tag` blob produced by [`AeadCipher::seal`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(AEAD_NONCE_LEN);
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        self.open_with_nonce(&nonce, ciphertext, aad)
    }

    /// Seal with an explicit nonce; output is `ciphertext || tag`.
    ///
    /// The caller owns nonce uniqueness. The record layer derives the nonce
    /// from its sequence counter; the known-answer tests use fixed nonces.
    pub fn seal_with_nonce(
        &self,
        nonce: &[u8; AEAD_NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match &self.cipher {
            SuiteCipher::Aes256Gcm(cipher) => cipher
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Internal { op: "aes-gcm seal" }),
            SuiteCipher::ChaCha20Poly1305(cipher) => cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Internal { op: "chacha20 seal" }),
        }
    }

    /// Open a `ciphertext || tag` blob with an explicit nonce.
    pub fn open_with_nonce(
        &self,
        nonce: &[u8; AEAD_NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AEAD_TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match &self.cipher {
            SuiteCipher::Aes256Gcm(cipher) => cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthenticationFailed),
            SuiteCipher::ChaCha20Poly1305(cipher) => cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::AuthenticationFailed),
        }
    }
}

impl core::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("suite", &self.suite)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Pack a 64-bit counter big-endian into the low 8 bytes of a 12-byte nonce.
pub fn pack_nonce(counter: u64) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suites() -> [CipherSuite; 2] {
        [CipherSuite::Aes256Gcm, CipherSuite::ChaCha20Poly1305]
    }

    #[test]
    fn test_pack_nonce() {
        assert_eq!(pack_nonce(0), [0u8; 12]);
        assert_eq!(
            pack_nonce(0x0102030405060708),
            [0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_wire_ids() {
        assert_eq!(CipherSuite::Aes256Gcm.wire_id(), 0x0001);
        assert_eq!(CipherSuite::ChaCha20Poly1305.wire_id(), 0x0002);
        assert_eq!(CipherSuite::from_wire(0x0001), Some(CipherSuite::Aes256Gcm));
        assert_eq!(CipherSuite::from_wire(0x0003), None);
        assert!(CipherSuite::Aes256Gcm.is_fips_approved());
        assert!(!CipherSuite::ChaCha20Poly1305.is_fips_approved());
        assert_eq!(CipherSuite::supported(true), &[CipherSuite::Aes256Gcm]);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        for suite in suites() {
            let key = [0x11u8; 32];
            let mut sealer = AeadCipher::new(suite, &key).unwrap();
            let opener = AeadCipher::new(suite, &key).unwrap();

            let sealed = sealer.seal(b"hello tunnel", b"aad").unwrap();
            let opened = opener.open(&sealed, b"aad").unwrap();
            assert_eq!(opened, b"hello tunnel");
        }
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        for suite in suites() {
            let key = [0x22u8; 32];
            let mut sealer = AeadCipher::new(suite, &key).unwrap();
            let opener = AeadCipher::new(suite, &key).unwrap();
            let sealed = sealer.seal(b"", b"").unwrap();
            assert_eq!(opener.open(&sealed, b"").unwrap(), b"");
        }
    }

    #[test]
    fn test_bit_flip_detected() {
        for suite in suites() {
            let key = [0x33u8; 32];
            let mut sealer = AeadCipher::new(suite, &key).unwrap();
            let opener = AeadCipher::new(suite, &key).unwrap();

            let sealed = sealer.seal(b"integrity matters", b"").unwrap();
            for index in [12, sealed.len() - 1] {
                let mut tampered = sealed.clone();
                tampered[index] ^= 0x01;
                assert_eq!(
                    opener.open(&tampered, b""),
                    Err(CryptoError::AuthenticationFailed)
                );
            }
        }
    }

    #[test]
    fn test_aad_mismatch_detected() {
        let key = [0x44u8; 32];
        let mut sealer = AeadCipher::new(CipherSuite::Aes256Gcm, &key).unwrap();
        let opener = AeadCipher::new(CipherSuite::Aes256Gcm, &key).unwrap();
        let sealed = sealer.seal(b"payload", b"right aad").unwrap();
        assert_eq!(
            opener.open(&sealed, b"wrong aad"),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_counter_increments() {
        let key = [0x55u8; 32];
        let mut cipher = AeadCipher::new(CipherSuite::Aes256Gcm, &key).unwrap();
        assert_eq!(cipher.counter(), 0);
        cipher.seal(b"one", b"").unwrap();
        cipher.seal(b"two", b"").unwrap();
        assert_eq!(cipher.counter(), 2);
    }

    #[test]
    fn test_nonce_exhaustion() {
        let key = [0x66u8; 32];
        let mut cipher = AeadCipher::new(CipherSuite::Aes256Gcm, &key).unwrap();
        cipher.counter = NONCE_COUNTER_LIMIT - 1;
        assert!(cipher.seal(b"last one", b"").is_ok());
        assert_eq!(cipher.seal(b"too far", b""), Err(CryptoError::NonceExhausted));
    }

    #[test]
    fn test_rekey_threshold() {
        let key = [0x77u8; 32];
        let mut cipher = AeadCipher::new(CipherSuite::Aes256Gcm, &key).unwrap();
        assert!(!cipher.needs_rekey());
        cipher.counter = NONCE_REKEY_THRESHOLD;
        assert!(cipher.needs_rekey());
    }

    #[test]
    fn test_short_inputs_rejected() {
        let key = [0x88u8; 32];
        let cipher = AeadCipher::new(CipherSuite::Aes256Gcm, &key).unwrap();
        assert_eq!(
            cipher.open(&[0u8; 27], b""),
            Err(CryptoError::AuthenticationFailed)
        );
        assert_eq!(
            cipher.open_with_nonce(&[0u8; 12], &[0u8; 15], b""),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_invalid_key_size() {
        assert!(matches!(
            AeadCipher::new(CipherSuite::Aes256Gcm, &[0u8; 16]),
            Err(CryptoError::InvalidLength { expected: 32, actual: 16 })
        ));
    }
}
