//! Deterministic string hashing
//!
//! Jenkins one-at-a-time. The value is stable across runs and platforms, so it
//! can be used as a bucket key for name lookups.

/// 32-bit hash value
pub type Hash = u32;

/// Hash a byte slice
pub fn hash(key: &[u8]) -> Hash {
    let mut h: Hash = 0;

    for &b in key {
        h = h.wrapping_add(Hash::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }

    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

/// Hash a string
pub fn hash_str(key: &str) -> Hash {
    hash(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(hash_str(""), 0);
        assert_eq!(hash_str("a"), 0xca2e_9442);
        assert_eq!(
            hash_str("The quick brown fox jumps over the lazy dog"),
            0x519e_91f5
        );
        assert_eq!(hash_str("getty/tty1"), 0xb365_1ac0);
    }

    #[test]
    fn test_case_sensitive() {
        assert_ne!(hash_str("getty/tty1"), hash_str("Getty/tty1"));
    }
}
