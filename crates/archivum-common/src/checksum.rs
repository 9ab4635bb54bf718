//! SHA-256 helpers
//!
//! Attribute records carry the lowercase hex SHA-256 of the bytes they
//! describe. Copies are verified by recomputing the digest while streaming.

use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 of a byte slice
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 calculator
#[derive(Clone, Default)]
pub struct Sha256Calculator {
    hasher: Sha256,
    bytes: u64,
}

impl Sha256Calculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the hex digest
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Constant-shape comparison of two hex digests (case-insensitive)
#[must_use]
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len() && expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut calc = Sha256Calculator::new();
        for chunk in data.chunks(7) {
            calc.update(chunk);
        }
        assert_eq!(calc.bytes(), data.len() as u64);
        assert_eq!(calc.finalize_hex(), sha256_hex(data));
    }

    #[test]
    fn test_digests_match_ignores_case() {
        assert!(digests_match("ABCDEF", "abcdef"));
        assert!(!digests_match("abcdef", "abcde0"));
        assert!(!digests_match("abc", "abcd"));
    }
}
