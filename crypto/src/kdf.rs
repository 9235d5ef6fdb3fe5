//! SHAKE-256 key derivation with length-prefixed domain separation.
//!
//! Every derivation feeds the XOF a domain separator and its inputs in
//! length-prefixed form: `LP(x) = be32(len(x)) || x`. The length prefixes
//! make the encoding injective, so concatenation ambiguity cannot collapse
//! two distinct input tuples onto the same key.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};

use crate::error::CryptoError;

/// Domain separator for the final CH-KEM shared secret.
pub const DOMAIN_CHKEM_SHARED_SECRET: &str = "CH-KEM-v1-SharedSecret";
/// Domain separator for handshake key expansion.
pub const DOMAIN_HANDSHAKE: &str = "CH-KEM-VPN-Handshake";
/// Domain separator for traffic key expansion.
pub const DOMAIN_TRAFFIC: &str = "CH-KEM-VPN-Traffic";
/// Domain separator for rekey master-secret advancement.
pub const DOMAIN_REKEY: &str = "CH-KEM-VPN-Rekey";

/// Largest output a single derivation may request.
pub const MAX_OUTPUT_LEN: usize = 1 << 20;

fn absorb_prefixed(hasher: &mut Shake256, data: &[u8]) {
    hasher.update(&(data.len() as u32).to_be_bytes());
    hasher.update(data);
}

fn check_output_len(n: usize) -> Result<(), CryptoError> {
    if n == 0 || n > MAX_OUTPUT_LEN {
        return Err(CryptoError::InvalidOutputLength { requested: n });
    }
    Ok(())
}

/// Derive `n` bytes as `SHAKE-256(LP(domain) || LP(input))`.
pub fn derive(domain: &str, input: &[u8], n: usize) -> Result<Vec<u8>, CryptoError> {
    check_output_len(n)?;
    let mut hasher = Shake256::default();
    absorb_prefixed(&mut hasher, domain.as_bytes());
    absorb_prefixed(&mut hasher, input);
    let mut out = vec![0u8; n];
    hasher.finalize_xof().read(&mut out);
    Ok(out)
}

/// Derive `n` bytes from multiple inputs.
///
/// The XOF absorbs `LP(domain) || be32(k) || LP(i_0) || .. || LP(i_{k-1})`,
/// so the input count is bound alongside each input's length.
pub fn derive_multi(domain: &str, inputs: &[&[u8]], n: usize) -> Result<Vec<u8>, CryptoError> {
    check_output_len(n)?;
    let mut hasher = Shake256::default();
    absorb_prefixed(&mut hasher, domain.as_bytes());
    hasher.update(&(inputs.len() as u32).to_be_bytes());
    for input in inputs {
        absorb_prefixed(&mut hasher, input);
    }
    let mut out = vec![0u8; n];
    hasher.finalize_xof().read(&mut out);
    Ok(out)
}

/// Fixed-size convenience wrapper around [`derive_multi`].
pub fn derive_multi_array<const N: usize>(
    domain: &str,
    inputs: &[&[u8]],
) -> Result<[u8; N], CryptoError> {
    let bytes = derive_multi(domain, inputs, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// SHA3-256 transcript hash over length-prefixed chunks.
///
/// Computes `SHA3-256(be32(count) || LP(c_0) || .. || LP(c_{n-1}))`. Used to
/// bind handshake messages and encapsulation context.
pub fn transcript_hash(chunks: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    Digest::update(&mut hasher, (chunks.len() as u32).to_be_bytes());
    for chunk in chunks {
        Digest::update(&mut hasher, (chunk.len() as u32).to_be_bytes());
        Digest::update(&mut hasher, chunk);
    }
    hasher.finalize().into()
}
