//! OS CSPRNG access.
//!
//! All random material in this crate comes from the operating system RNG.
//! There is no internal PRNG; deterministic `from_seed` constructors exist
//! only for test vectors and are documented as such at their definition.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Fill `buf` with bytes from the OS CSPRNG.
pub fn fill(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Draw a fixed-size array from the OS CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Continuous RNG test required in FIPS mode.
///
/// Each 32-byte block drawn through this guard is compared against the
/// previous one; a repeat indicates a stuck generator and is reported as
/// [`CryptoError::RngFailure`].
#[derive(Default)]
pub struct ContinuousRngTest {
    previous: Option<[u8; 32]>,
}

impl ContinuousRngTest {
    pub fn new() -> Self {
        Self { previous: None }
    }

    /// Draw the next 32-byte block, failing if it matches the previous one.
    pub fn next_block(&mut self) -> Result<[u8; 32], CryptoError> {
        let block: [u8; 32] = random_array();
        self.admit(block)?;
        Ok(block)
    }

    fn admit(&mut self, block: [u8; 32]) -> Result<(), CryptoError> {
        if let Some(previous) = self.previous {
            if crate::ct::ct_eq(&previous, &block) {
                return Err(CryptoError::RngFailure);
            }
        }
        self.previous = Some(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_produces_nonzero() {
        let mut buf = [0u8; 64];
        fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_continuous_test_accepts_fresh_blocks() {
        let mut guard = ContinuousRngTest::new();
        let first = guard.next_block().unwrap();
        let second = guard.next_block().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_continuous_test_rejects_repeat() {
        let mut guard = ContinuousRngTest::new();
        let block = [0x5au8; 32];
        guard.admit(block).unwrap();
        assert_eq!(guard.admit(block), Err(CryptoError::RngFailure));
    }
}
