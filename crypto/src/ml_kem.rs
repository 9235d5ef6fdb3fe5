//! ML-KEM-1024 (FIPS 203) key encapsulation.
//!
//! Wrapper around the `ml-kem` crate at security category 5. Key generation
//! draws the 64-byte (d, z) seed from the OS CSPRNG; encapsulation feeds the
//! deterministic path 32 bytes of OS randomness. `from_seed` exists for test
//! vectors only.
//!
//! Decapsulation uses implicit rejection: a malformed-but-well-sized
//! ciphertext yields a pseudo-random shared secret rather than an error, so
//! tampering only surfaces when the derived keys fail to authenticate.

use ml_kem::array::Array;
use ml_kem::kem::{Decapsulate, DecapsulationKey, EncapsulationKey};
use ml_kem::{EncapsulateDeterministic, EncodedSizeUser, MlKem1024Params};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::rng;

/// ML-KEM-1024 parameter sizes (FIPS 203).
pub const ML_KEM_PUBLIC_KEY_LEN: usize = 1568;
pub const ML_KEM_SECRET_KEY_LEN: usize = 3168;
pub const ML_KEM_CIPHERTEXT_LEN: usize = 1568;
pub const ML_KEM_SHARED_SECRET_LEN: usize = 32;
pub const ML_KEM_SEED_LEN: usize = 64;

/// Ciphertext from ML-KEM encapsulation.
#[derive(Clone, PartialEq, Eq)]
pub struct MlKemCiphertext {
    bytes: [u8; ML_KEM_CIPHERTEXT_LEN],
}

impl MlKemCiphertext {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_KEM_CIPHERTEXT_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_KEM_CIPHERTEXT_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ML_KEM_CIPHERTEXT_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl core::fmt::Debug for MlKemCiphertext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MlKemCiphertext").finish_non_exhaustive()
    }
}

/// ML-KEM-1024 encapsulation key.
#[derive(Clone, PartialEq, Eq)]
pub struct MlKemPublicKey {
    bytes: [u8; ML_KEM_PUBLIC_KEY_LEN],
}

impl MlKemPublicKey {
    /// Parse and validate an encapsulation key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_KEM_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_KEM_PUBLIC_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ML_KEM_PUBLIC_KEY_LEN];
        arr.copy_from_slice(bytes);
        let checked: Array<u8, _> = Array::try_from(arr.as_slice()).expect("size mismatch");
        EncapsulationKey::<MlKem1024Params>::from_bytes(&checked)
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encapsulate with randomness from the OS CSPRNG.
    pub fn encapsulate(
        &self,
    ) -> Result<(MlKemCiphertext, Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>), CryptoError> {
        let m: Zeroizing<[u8; 32]> = Zeroizing::new(rng::random_array());
        self.encapsulate_deterministic(&m)
    }

    /// Encapsulate with caller-supplied randomness.
    ///
    /// Test-only behavior outside this crate's own encapsulation path; the
    /// known-answer tests rely on it.
    pub fn encapsulate_deterministic(
        &self,
        m: &[u8; 32],
    ) -> Result<(MlKemCiphertext, Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>), CryptoError> {
        let m_array: Array<u8, _> = Array::try_from(m.as_slice()).expect("size mismatch");
        let ek = self.to_inner();
        let (ct, ss) = ek
            .encapsulate_deterministic(&m_array)
            .map_err(|_| CryptoError::Internal { op: "ml-kem encapsulate" })?;

        let mut ct_bytes = [0u8; ML_KEM_CIPHERTEXT_LEN];
        ct_bytes.copy_from_slice(ct.as_ref());

        let mut ss_bytes = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        ss_bytes.copy_from_slice(ss.as_ref());

        Ok((MlKemCiphertext { bytes: ct_bytes }, ss_bytes))
    }

    fn to_inner(&self) -> EncapsulationKey<MlKem1024Params> {
        let arr: Array<u8, _> = Array::try_from(self.bytes.as_slice()).expect("size mismatch");
        EncapsulationKey::<MlKem1024Params>::from_bytes(&arr)
            .expect("key bytes validated at construction")
    }
}

impl core::fmt::Debug for MlKemPublicKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MlKemPublicKey").finish_non_exhaustive()
    }
}

/// ML-KEM-1024 keypair. The decapsulation key is zeroized on drop.
pub struct MlKemKeyPair {
    secret: [u8; ML_KEM_SECRET_KEY_LEN],
}

impl MlKemKeyPair {
    /// Generate a keypair from a fresh OS-CSPRNG (d, z) seed.
    pub fn generate() -> Self {
        let seed: Zeroizing<[u8; ML_KEM_SEED_LEN]> = Zeroizing::new(rng::random_array());
        Self::from_seed(&seed)
    }

    /// Derive a keypair from a fixed 64-byte (d, z) seed.
    ///
    /// Test-only behavior: there is no production path that calls this with
    /// anything other than fresh OS randomness.
    pub fn from_seed(seed: &[u8; ML_KEM_SEED_LEN]) -> Self {
        let seed_array: ml_kem::Seed = Array::try_from(seed.as_slice()).expect("size mismatch");
        let dk = DecapsulationKey::<MlKem1024Params>::from(seed_array);
        let dk_bytes = dk.to_bytes();

        let mut secret = [0u8; ML_KEM_SECRET_KEY_LEN];
        secret.copy_from_slice(dk_bytes.as_ref());
        Self { secret }
    }

    pub fn public_key(&self) -> MlKemPublicKey {
        let dk = self.to_inner();
        let ek_bytes = dk.encapsulation_key().to_bytes();
        let mut bytes = [0u8; ML_KEM_PUBLIC_KEY_LEN];
        bytes.copy_from_slice(ek_bytes.as_ref());
        MlKemPublicKey { bytes }
    }

    /// Decapsulate a ciphertext.
    pub fn decapsulate(
        &self,
        ciphertext: &MlKemCiphertext,
    ) -> Result<Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>, CryptoError> {
        let dk = self.to_inner();
        let ct: Array<u8, _> =
            Array::try_from(ciphertext.bytes.as_slice()).expect("size mismatch");
        let ss = dk
            .decapsulate(&ct)
            .map_err(|_| CryptoError::DecapsulationFailed)?;

        let mut ss_bytes = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        ss_bytes.copy_from_slice(ss.as_ref());
        Ok(ss_bytes)
    }

    fn to_inner(&self) -> DecapsulationKey<MlKem1024Params> {
        let arr: Array<u8, _> = Array::try_from(self.secret.as_slice()).expect("size mismatch");
        DecapsulationKey::<MlKem1024Params>::from_bytes(&arr)
            .expect("key bytes produced by key generation")
    }
}

impl Drop for MlKemKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl core::fmt::Debug for MlKemKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MlKemKeyPair").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_sizes() {
        assert_eq!(ML_KEM_PUBLIC_KEY_LEN, 1568);
        assert_eq!(ML_KEM_SECRET_KEY_LEN, 3168);
        assert_eq!(ML_KEM_CIPHERTEXT_LEN, 1568);
        assert_eq!(ML_KEM_SHARED_SECRET_LEN, 32);
    }

    #[test]
    fn test_roundtrip() {
        let keypair = MlKemKeyPair::generate();
        let (ciphertext, encap_secret) = keypair.public_key().encapsulate().unwrap();
        let decap_secret = keypair.decapsulate(&ciphertext).unwrap();
        assert_eq!(encap_secret.as_ref(), decap_secret.as_ref());
    }

    #[test]
    fn test_deterministic_keygen() {
        let seed = [0x42u8; ML_KEM_SEED_LEN];
        let a = MlKemKeyPair::from_seed(&seed);
        let b = MlKemKeyPair::from_seed(&seed);
        assert_eq!(a.public_key().as_bytes(), b.public_key().as_bytes());
    }

    #[test]
    fn test_implicit_rejection() {
        let keypair = MlKemKeyPair::generate();
        let (ciphertext, encap_secret) = keypair.public_key().encapsulate().unwrap();

        let mut tampered = [0u8; ML_KEM_CIPHERTEXT_LEN];
        tampered.copy_from_slice(ciphertext.as_bytes());
        tampered[0] ^= 0x01;
        let tampered = MlKemCiphertext::from_bytes(&tampered).unwrap();

        // Implicit rejection: decapsulation succeeds but yields a different
        // pseudo-random secret.
        let decap_secret = keypair.decapsulate(&tampered).unwrap();
        assert_ne!(encap_secret.as_ref(), decap_secret.as_ref());
    }

    #[test]
    fn test_public_key_validation() {
        assert!(matches!(
            MlKemPublicKey::from_bytes(&[0u8; 100]),
            Err(CryptoError::InvalidLength { .. })
        ));
    }
}
