//! Fixed-width little-endian encoding for everything stored in a block
//!
//! Keys, values and records are copied into blocks byte for byte, so each
//! type declares its exact encoded size up front. Capacities of tree nodes
//! and record blocks are computed from these sizes.

mod fixed_string;
mod hash_pair;

pub use fixed_string::FixedString;
pub use hash_pair::HashPair;

/// A type with a fixed-size binary representation
pub trait Fixed: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write `self` into the first `SIZE` bytes of `buf`
    fn encode(&self, buf: &mut [u8]);

    /// Read a value from the first `SIZE` bytes of `buf`
    fn decode(buf: &[u8]) -> Self;
}

macro_rules! impl_fixed_int {
    ($($t:ty),*) => {
        $(
            impl Fixed for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn encode(&self, buf: &mut [u8]) {
                    buf[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(buf: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(&buf[..Self::SIZE]);
                    <$t>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_fixed_int!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128);

impl Fixed for bool {
    const SIZE: usize = 1;

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = *self as u8;
    }

    fn decode(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

/// Zero-sized payload, for indexes used as ordered sets
impl Fixed for () {
    const SIZE: usize = 0;

    fn encode(&self, _buf: &mut [u8]) {}

    fn decode(_buf: &[u8]) -> Self {}
}

impl<const N: usize> Fixed for [u8; N] {
    const SIZE: usize = N;

    fn encode(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(self);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&buf[..N]);
        bytes
    }
}

/// Pairs encode as the two halves back to back
impl<A: Fixed, B: Fixed> Fixed for (A, B) {
    const SIZE: usize = A::SIZE + B::SIZE;

    fn encode(&self, buf: &mut [u8]) {
        self.0.encode(&mut buf[..A::SIZE]);
        self.1.encode(&mut buf[A::SIZE..Self::SIZE]);
    }

    fn decode(buf: &[u8]) -> Self {
        (A::decode(&buf[..A::SIZE]), B::decode(&buf[A::SIZE..Self::SIZE]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Fixed + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        assert_eq!(T::decode(&buf), value);
    }

    #[test]
    fn test_integer_sizes() {
        assert_eq!(<u8 as Fixed>::SIZE, 1);
        assert_eq!(<i32 as Fixed>::SIZE, 4);
        assert_eq!(<i64 as Fixed>::SIZE, 8);
        assert_eq!(<(i64, u32) as Fixed>::SIZE, 12);
        assert_eq!(<() as Fixed>::SIZE, 0);
    }

    #[test]
    fn test_integers_little_endian() {
        let mut buf = [0u8; 8];
        0x0102_0304_0506_0708i64.encode(&mut buf);
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
        round_trip(-1i64);
        round_trip(i32::MIN);
    }

    #[test]
    fn test_pair_layout() {
        let mut buf = [0u8; 12];
        (7i64, 9u32).encode(&mut buf);
        assert_eq!(buf[0], 7);
        assert_eq!(buf[8], 9);
        round_trip((-5i64, (true, 3u8)));
    }

    #[test]
    fn test_encode_ignores_trailing_bytes() {
        let mut buf = [0xFFu8; 16];
        42u32.encode(&mut buf);
        assert_eq!(u32::decode(&buf), 42);
        assert_eq!(buf[4], 0xFF);
    }
}
