//! Constant-time helpers.

use subtle::ConstantTimeEq;

/// Constant-time equality for byte slices.
///
/// Slices of different lengths compare unequal; the length check itself is
/// not secret (lengths are public in every protocol position this is used).
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_slices() {
        assert!(ct_eq(b"same bytes", b"same bytes"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_unequal_slices() {
        assert!(!ct_eq(b"same bytes", b"same byteZ"));
        assert!(!ct_eq(b"short", b"longer slice"));
    }
}
