use std::fmt;

use super::Fixed;

/// UTF-8 string stored in exactly `N` bytes, padded with NUL
///
/// Longer input is truncated at the last character boundary that fits.
/// Ordering is byte-wise, which matches `str` ordering for NUL-free text.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedString<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedString<N> {
    pub fn new(text: &str) -> Self {
        let mut len = text.len().min(N);
        while !text.is_char_boundary(len) {
            len -= 1;
        }

        let mut bytes = [0u8; N];
        bytes[..len].copy_from_slice(&text.as_bytes()[..len]);
        Self { bytes }
    }

    /// Length in bytes, up to the first NUL
    pub fn len(&self) -> usize {
        self.bytes.iter().position(|&b| b == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> &str {
        match std::str::from_utf8(&self.bytes[..self.len()]) {
            Ok(text) => text,
            // Only reachable for bytes decoded from a foreign file
            Err(e) => {
                let valid = e.valid_up_to();
                std::str::from_utf8(&self.bytes[..valid]).unwrap_or_default()
            }
        }
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self { bytes: [0u8; N] }
    }
}

impl<const N: usize> From<&str> for FixedString<N> {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> Fixed for FixedString<N> {
    const SIZE: usize = N;

    fn encode(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.bytes);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            bytes: <[u8; N]>::decode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string() {
        let s = FixedString::<8>::new("abc");
        assert_eq!(s.as_str(), "abc");
        assert_eq!(s.len(), 3);
        assert!(!s.is_empty());
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        // "é" is two bytes; the third byte would split it
        let s = FixedString::<3>::new("aéb");
        assert_eq!(s.as_str(), "aé");

        let s = FixedString::<2>::new("aé");
        assert_eq!(s.as_str(), "a");
    }

    #[test]
    fn test_full_width() {
        let s = FixedString::<4>::new("abcd");
        assert_eq!(s.len(), 4);
        assert_eq!(s.to_string(), "abcd");
    }

    #[test]
    fn test_ordering_matches_str() {
        let a = FixedString::<8>::new("apple");
        let b = FixedString::<8>::new("apricot");
        let c = FixedString::<8>::new("app");
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn test_encode_decode() {
        let s = FixedString::<6>::new("hello");
        let mut buf = [0xFFu8; 6];
        s.encode(&mut buf);
        assert_eq!(buf[5], 0);
        assert_eq!(FixedString::<6>::decode(&buf), s);
    }
}
