//! Carry-less arithmetic in GF(2^128).
//!
//! Field elements are `u128` values whose bit `i` is the coefficient of
//! `x^i`; addition is XOR and multiplication reduces modulo
//! `x^128 + x^7 + x^2 + x + 1`. The equivocation tag algebra needs one
//! multiplication per participant per round, so a portable shift-and-add
//! implementation is plenty.

/// Low bits of the reduction polynomial `x^7 + x^2 + x + 1`.
const REDUCTION: u128 = 0x87;

/// Multiplies two field elements.
pub fn mul(mut a: u128, mut b: u128) -> u128 {
    let mut product = 0u128;
    while b != 0 {
        if b & 1 == 1 {
            product ^= a;
        }
        b >>= 1;
        let carry = a >> 127;
        a <<= 1;
        if carry == 1 {
            a ^= REDUCTION;
        }
    }
    product
}

/// Interprets 16 bytes as a field element (little-endian).
pub fn from_bytes(bytes: &[u8; 16]) -> u128 {
    u128::from_le_bytes(*bytes)
}

/// Serializes a field element to 16 bytes (little-endian).
pub fn to_bytes(value: u128) -> [u8; 16] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_identity_and_zero() {
        let a = 0x0123_4567_89AB_CDEF_0011_2233_4455_6677u128;
        assert_eq!(mul(a, 1), a);
        assert_eq!(mul(1, a), a);
        assert_eq!(mul(a, 0), 0);
    }

    #[test]
    fn test_reduction_wraps() {
        // x^127 * x = x^128 = x^7 + x^2 + x + 1 in this field.
        assert_eq!(mul(1u128 << 127, 2), REDUCTION);
    }

    #[test]
    fn test_commutative_associative_distributive() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..32 {
            let a: u128 = rng.gen();
            let b: u128 = rng.gen();
            let c: u128 = rng.gen();
            assert_eq!(mul(a, b), mul(b, a));
            assert_eq!(mul(mul(a, b), c), mul(a, mul(b, c)));
            assert_eq!(mul(a, b ^ c), mul(a, b) ^ mul(a, c));
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let value = 0xFEDC_BA98_7654_3210_0123_4567_89AB_CDEFu128;
        assert_eq!(from_bytes(&to_bytes(value)), value);
    }
}
