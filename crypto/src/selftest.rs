//! Power-on self-tests (POST) and conditional self-tests (CST).
//!
//! In FIPS mode a POST failure is fatal for the process; otherwise callers
//! may treat it as advisory. The pairwise consistency test runs after each
//! keypair generation in FIPS mode.

use sha3::digest::{ExtendableOutput, XofReader};
use sha3::{Digest, Sha3_256, Shake256};
use std::sync::OnceLock;

use crate::aead::{AeadCipher, CipherSuite};
use crate::chkem::{self, ChKemKeyPair};
use crate::error::CryptoError;
use crate::kdf;
use crate::ml_kem::MlKemKeyPair;

/// Run every known-answer and consistency test once, memoizing the result.
pub fn ensure_post() -> Result<(), CryptoError> {
    static POST: OnceLock<Result<(), CryptoError>> = OnceLock::new();
    POST.get_or_init(power_on_self_test).clone()
}

/// Run the full POST battery.
pub fn power_on_self_test() -> Result<(), CryptoError> {
    kat_shake256()?;
    kat_sha3_256()?;
    kat_aes_256_gcm()?;
    kat_kdf()?;
    kat_ml_kem()?;
    Ok(())
}

/// Pairwise consistency test for a freshly generated CH-KEM keypair.
///
/// Encapsulates against the keypair's own public key and checks that
/// decapsulation recovers the identical secret.
pub fn pairwise_consistency(keypair: &ChKemKeyPair) -> Result<(), CryptoError> {
    let (ciphertext, encap_secret) = chkem::encapsulate(&keypair.public_key())?;
    let decap_secret = keypair.decapsulate(&ciphertext)?;
    if !crate::ct::ct_eq(encap_secret.as_ref(), decap_secret.as_ref()) {
        return Err(CryptoError::SelfTestFailed {
            test: "chkem pairwise consistency",
        });
    }
    Ok(())
}

/// SHAKE-256 against the published empty-message vector.
fn kat_shake256() -> Result<(), CryptoError> {
    const EXPECTED: &str = "46b9dd2b0ba88d13233b3feb743eeb243fcd52ea62b81b82b50c27646ed5762f";
    let hasher = Shake256::default();
    let mut out = [0u8; 32];
    hasher.finalize_xof().read(&mut out);
    if hex::encode(out) != EXPECTED {
        return Err(CryptoError::SelfTestFailed { test: "shake-256" });
    }
    Ok(())
}

/// SHA3-256 against the published empty-message vector.
fn kat_sha3_256() -> Result<(), CryptoError> {
    const EXPECTED: &str = "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a";
    let digest = Sha3_256::digest(b"");
    if hex::encode(digest) != EXPECTED {
        return Err(CryptoError::SelfTestFailed { test: "sha3-256" });
    }
    Ok(())
}

/// AES-256-GCM against the GCM specification test vector
/// (all-zero key and nonce, one all-zero block).
fn kat_aes_256_gcm() -> Result<(), CryptoError> {
    const EXPECTED_CT: &str = "cea7403d4d606b6e074ec5d3baf39d18";
    const EXPECTED_TAG: &str = "d0d1c8a799996bf0265b98b5d48ab919";

    let cipher = AeadCipher::new(CipherSuite::Aes256Gcm, &[0u8; 32])?;
    let sealed = cipher.seal_with_nonce(&[0u8; 12], &[0u8; 16], &[])?;
    if sealed.len() != 32
        || hex::encode(&sealed[..16]) != EXPECTED_CT
        || hex::encode(&sealed[16..]) != EXPECTED_TAG
    {
        return Err(CryptoError::SelfTestFailed { test: "aes-256-gcm" });
    }

    // The sealed form must also open back to the plaintext.
    let opened = cipher.open_with_nonce(&[0u8; 12], &sealed, &[])?;
    if opened != [0u8; 16] {
        return Err(CryptoError::SelfTestFailed { test: "aes-256-gcm" });
    }
    Ok(())
}

/// KDF self-consistency: determinism and domain separation.
fn kat_kdf() -> Result<(), CryptoError> {
    let input = [0xa5u8; 32];
    let a = kdf::derive(kdf::DOMAIN_HANDSHAKE, &input, 88)?;
    let b = kdf::derive(kdf::DOMAIN_HANDSHAKE, &input, 88)?;
    let c = kdf::derive(kdf::DOMAIN_TRAFFIC, &input, 88)?;
    if a != b || a == c {
        return Err(CryptoError::SelfTestFailed { test: "kdf" });
    }
    Ok(())
}

/// ML-KEM encapsulation/decapsulation consistency from a fixed seed.
fn kat_ml_kem() -> Result<(), CryptoError> {
    let mut seed = [0u8; 64];
    for (i, byte) in seed.iter_mut().enumerate() {
        *byte = i as u8;
    }
    let keypair = MlKemKeyPair::from_seed(&seed);
    let m = [0x5cu8; 32];
    let (ciphertext, encap_secret) = keypair.public_key().encapsulate_deterministic(&m)?;
    let decap_secret = keypair.decapsulate(&ciphertext)?;
    if !crate::ct::ct_eq(encap_secret.as_ref(), decap_secret.as_ref()) {
        return Err(CryptoError::SelfTestFailed { test: "ml-kem" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_self_test_passes() {
        power_on_self_test().unwrap();
    }

    #[test]
    fn test_ensure_post_memoizes() {
        ensure_post().unwrap();
        ensure_post().unwrap();
    }

    #[test]
    fn test_pairwise_consistency_passes() {
        let keypair = ChKemKeyPair::generate();
        pairwise_consistency(&keypair).unwrap();
    }
}
