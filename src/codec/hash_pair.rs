use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use super::Fixed;

// Two independent key sets; the pair collides only if both digests do.
const FIRST_KEYS: (u64, u64) = (0x736f_6d65_7073_6575, 0x646f_7261_6e64_6f6d);
const SECOND_KEYS: (u64, u64) = (0x6c79_6765_6e65_7261, 0x7465_6462_7974_6573);

/// Composite hashed key standing in for a long string inside an index
///
/// Both halves use SipHash-1-3 with fixed keys, so the digest of a given
/// string never changes between runs or builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HashPair(pub u64, pub u64);

impl HashPair {
    pub fn of(text: &str) -> Self {
        Self(
            digest(FIRST_KEYS, text.as_bytes()),
            digest(SECOND_KEYS, text.as_bytes()),
        )
    }
}

fn digest((k0, k1): (u64, u64), bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(k0, k1);
    hasher.write(bytes);
    hasher.finish()
}

impl From<&str> for HashPair {
    fn from(text: &str) -> Self {
        Self::of(text)
    }
}

impl Fixed for HashPair {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        self.0.encode(&mut buf[0..8]);
        self.1.encode(&mut buf[8..16]);
    }

    fn decode(buf: &[u8]) -> Self {
        Self(u64::decode(&buf[0..8]), u64::decode(&buf[8..16]))
    }
}
