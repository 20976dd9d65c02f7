use std::fmt;

// payloads at or above this size are sampled instead of digested in full.
const SAMPLE_THRESHOLD: usize = 4 * 1024 * 1024;
const SAMPLE_COUNT: usize = 1000;
const SAMPLE_LEN: usize = 1024;

/// 256-bit content hash identifying one image payload.
///
/// The cache identity for in-memory byte blobs, see
/// [`AssetKey::InlineBytes`].
///
/// [`AssetKey::InlineBytes`]: crate::AssetKey::InlineBytes
#[derive(Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ByteHash([u8; 32]);
impl ByteHash {
    /// Hash `data` in one call.
    ///
    /// Payloads of 4 MiB and over are not digested in full, a spread of
    /// 1 KiB chunks is hashed instead. That tells payloads apart, which is
    /// all the cache needs, without a full SHA-512/256 pass over a large
    /// buffer.
    pub fn compute(data: &[u8]) -> ByteHash {
        let mut h = ByteHasher::new();
        h.write(data);
        h.finish()
    }

    /// The hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
impl fmt::Debug for ByteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use base64::Engine as _;
        write!(f, "{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0))
    }
}
impl fmt::Display for ByteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
impl std::hash::Hash for ByteHash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // the first 8 bytes are as good as all 32 for table placement
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        state.write_u64(u64::from_le_bytes(prefix));
    }
}

/// Incremental [`ByteHash`] writer.
#[derive(Default)]
pub struct ByteHasher(sha2::Sha512_256);
impl ByteHasher {
    /// New empty writer.
    pub fn new() -> ByteHasher {
        ByteHasher::default()
    }

    /// Feed `data` into the hash, sampling it when large.
    ///
    /// Sampling applies per call, a caller streaming many small writes gets
    /// every byte digested.
    pub fn write(&mut self, data: &[u8]) {
        use sha2::Digest;
        if data.len() < SAMPLE_THRESHOLD {
            self.0.update(data);
        } else {
            let step = data.len() / SAMPLE_COUNT;
            for start in (0..data.len()).step_by(step).take(SAMPLE_COUNT) {
                let end = (start + SAMPLE_LEN).min(data.len());
                self.0.update(&data[start..end]);
            }
        }
    }

    /// Finish computing the hash.
    pub fn finish(self) -> ByteHash {
        use sha2::Digest;
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.finalize());
        ByteHash(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_hash() {
        let a = ByteHash::compute(b"the exact same payload");
        let b = ByteHash::compute(b"the exact same payload");
        assert_eq!(a, b);
        assert_ne!(a, ByteHash::compute(b"a different payload"));
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut h = ByteHasher::new();
        h.write(b"split ");
        h.write(b"payload");
        assert_eq!(h.finish(), ByteHash::compute(b"split payload"));
    }

    #[test]
    fn sampled_inputs_still_distinguish() {
        let big = vec![0x5Au8; SAMPLE_THRESHOLD];
        let a = ByteHash::compute(&big);
        assert_eq!(a, ByteHash::compute(&big));

        let mut flipped = big;
        flipped[0] = 0xA5;
        assert_ne!(a, ByteHash::compute(&flipped));
    }

    #[test]
    fn display_is_base64() {
        let h = ByteHash::compute(b"x");
        let s = h.to_string();
        assert!(!s.is_empty());
        assert!(!s.contains('='));
    }
}
