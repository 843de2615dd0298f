//! Content hashing for fingerprints, signatures and partition keys.
//!
//! Hashes are rendered in web-safe base64 (`A-Z a-z 0-9 - _`) so they can
//! be embedded in URLs without escaping, and truncated to the hasher's
//! configured length.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Maximum number of characters a rendered hash may have.
pub const MAX_HASH_CHARS: usize = 32;

/// A pluggable content hasher.
pub trait Hasher: Send + Sync {
    /// Returns the raw digest bytes for `content`.
    fn raw_hash(&self, content: &[u8]) -> Vec<u8>;

    /// Number of characters in a rendered hash.
    fn hash_size_in_chars(&self) -> usize;

    /// Returns the web64 rendering of the digest, truncated to
    /// [`Hasher::hash_size_in_chars`].
    fn hash(&self, content: &[u8]) -> String {
        let mut encoded = URL_SAFE_NO_PAD.encode(self.raw_hash(content));
        encoded.truncate(self.hash_size_in_chars());
        encoded
    }

    /// Hashes a string.
    fn hash_str(&self, content: &str) -> String {
        self.hash(content.as_bytes())
    }
}

impl<T: Hasher + ?Sized> Hasher for Arc<T> {
    fn raw_hash(&self, content: &[u8]) -> Vec<u8> {
        (**self).raw_hash(content)
    }

    fn hash_size_in_chars(&self) -> usize {
        (**self).hash_size_in_chars()
    }
}

/// Returns true if `s` only contains web64 characters.
pub fn is_web64(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// SHA-256 based production hasher.
#[derive(Debug, Clone)]
pub struct Sha256Hasher {
    length: usize,
}

impl Sha256Hasher {
    /// Default rendered hash length.
    pub const DEFAULT_LENGTH: usize = 10;

    /// Creates a hasher with the default length.
    pub fn new() -> Self {
        Self::with_length(Self::DEFAULT_LENGTH)
    }

    /// Creates a hasher producing `length` characters, clamped to
    /// `1..=MAX_HASH_CHARS`.
    pub fn with_length(length: usize) -> Self {
        Self {
            length: length.clamp(1, MAX_HASH_CHARS),
        }
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Sha256Hasher {
    fn raw_hash(&self, content: &[u8]) -> Vec<u8> {
        Sha256::digest(content).to_vec()
    }

    fn hash_size_in_chars(&self) -> usize {
        self.length
    }
}

/// Deterministic short-token hasher for tests.
///
/// Uses FNV-1a with a fixed seed, so tokens are stable across runs and
/// platforms.
#[derive(Debug, Clone)]
pub struct MockHasher {
    length: usize,
}

impl MockHasher {
    const SEED: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Creates a mock hasher producing 4-character tokens.
    pub fn new() -> Self {
        Self { length: 4 }
    }

    /// Creates a mock hasher producing `length` characters (at most 10).
    pub fn with_length(length: usize) -> Self {
        Self {
            length: length.clamp(1, 10),
        }
    }

    fn fnv1a(content: &[u8]) -> u64 {
        content.iter().fold(Self::SEED, |acc, b| {
            (acc ^ u64::from(*b)).wrapping_mul(Self::PRIME)
        })
    }
}

impl Default for MockHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for MockHasher {
    fn raw_hash(&self, content: &[u8]) -> Vec<u8> {
        Self::fnv1a(content).to_be_bytes().to_vec()
    }

    fn hash_size_in_chars(&self) -> usize {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hash_is_web64_and_truncated() {
        let hasher = Sha256Hasher::new();
        let hash = hasher.hash(b"hello");
        assert_eq!(hash.len(), 10);
        assert!(is_web64(&hash));
    }

    #[test]
    fn sha256_hash_known_prefix() {
        // sha256("") = e3b0c442...
        let hasher = Sha256Hasher::with_length(8);
        assert_eq!(hasher.hash(b""), "47DEQpj8");
    }

    #[test]
    fn mock_hasher_is_stable() {
        let a = MockHasher::new();
        let b = MockHasher::new();
        assert_eq!(a.hash(b"body"), b.hash(b"body"));
        assert_eq!(a.hash(b"body").len(), 4);
        assert_ne!(a.hash(b"body"), a.hash(b"other body"));
    }

    #[test]
    fn length_is_clamped() {
        assert_eq!(Sha256Hasher::with_length(0).hash_size_in_chars(), 1);
        assert_eq!(Sha256Hasher::with_length(100).hash_size_in_chars(), 32);
        assert_eq!(MockHasher::with_length(50).hash(b"x").len(), 10);
    }

    #[test]
    fn arc_hasher_delegates() {
        let hasher: Arc<dyn Hasher> = Arc::new(MockHasher::new());
        assert_eq!(hasher.hash(b"x"), MockHasher::new().hash(b"x"));
    }

    #[test]
    fn web64_check() {
        assert!(is_web64("aZ09-_"));
        assert!(!is_web64("a.b"));
        assert!(!is_web64("a/b"));
    }
}
