/// Size of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A fixed-size content digest.
pub type Digest = [u8; DIGEST_LEN];

/// Hash a byte slice, returning a 32-byte BLAKE3 digest. Always taken over
/// the fully reassembled byte sequence.
pub fn hash(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Incremental form of [`hash`]. Feeding the pieces of a sequence in order
/// yields the same digest as hashing their concatenation.
#[derive(Default, Clone)]
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(&self) -> Digest {
        *self.inner.finalize().as_bytes()
    }
}

/// Short hex form of a digest for log fields.
pub fn short_hex(digest: &Digest) -> String {
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let data = b"stream echo payload";
        assert_eq!(hash(data), hash(data));
        assert_ne!(hash(data), hash(b"stream echo payloaD"));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut hasher = Hasher::new();
        for piece in data.chunks(333) {
            hasher.update(piece);
        }
        assert_eq!(hasher.finalize(), hash(&data));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(Hasher::new().finalize(), hash(&[]));
        assert_eq!(short_hex(&hash(&[])).len(), 16);
    }
}
