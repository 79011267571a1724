//! Key hashing for segment assignment.
//!
//! Implements the endian-neutral MurmurHash2 (seed `-1`) plus a legacy
//! variant kept bit-for-bit for clusters that were formed with it. The two
//! are not interchangeable: a cluster picks one in its configuration and
//! every member must use the same.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

const M: i32 = 0x5bd1e995;
const R: u32 = 24;
const SEED: i32 = -1;

/// Typed inputs accepted by [`HashFunction::hash`].
///
/// A precomputed numeric code is hashed through its 4-byte little-endian
/// form, which is different from hashing arbitrary bytes that happen to
/// look like a number.
#[derive(Debug, Clone, Copy)]
pub enum HashInput<'a> {
    Bytes(&'a [u8]),
    Str(&'a str),
    Code(i32),
}

/// The cluster-wide hash function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashFunction {
    /// MurmurHash2 over unsigned bytes with logical shifts.
    #[default]
    Murmur2,
    /// Legacy MurmurHash2: sign-extends bytes and uses arithmetic shifts,
    /// which confines results to 31 bits.
    Murmur2Compat,
}

impl HashFunction {
    /// Hashes a typed input.
    pub fn hash(&self, input: HashInput<'_>) -> i32 {
        match input {
            HashInput::Bytes(bytes) => self.hash_bytes(bytes),
            HashInput::Str(s) => self.hash_bytes(s.as_bytes()),
            HashInput::Code(code) => self.hash_code(code),
        }
    }

    /// Hashes a raw byte payload.
    pub fn hash_bytes(&self, payload: &[u8]) -> i32 {
        match self {
            HashFunction::Murmur2 => murmur2(payload),
            HashFunction::Murmur2Compat => murmur2_compat(payload),
        }
    }

    /// Spreads a previously computed hash code.
    pub fn hash_code(&self, code: i32) -> i32 {
        self.hash_bytes(&code.to_le_bytes())
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashFunction::Murmur2 => "murmur2",
            HashFunction::Murmur2Compat => "murmur2-compat",
        }
    }
}

impl std::fmt::Display for HashFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "murmur2" => Ok(HashFunction::Murmur2),
            "murmur2-compat" => Ok(HashFunction::Murmur2Compat),
            _ => Err(format!(
                "unknown hash function '{s}'. valid options: murmur2, murmur2-compat"
            )),
        }
    }
}

/// Reduces a hash to a segment id in `[0, num_segments)`.
///
/// The sign bit is masked off rather than taking an absolute value, so
/// `i32::MIN` is handled without overflow.
pub fn segment_for_hash(hash: i32, num_segments: u32) -> u32 {
    debug_assert!(num_segments > 0, "segment count must be positive");
    ((hash & i32::MAX) as u32) % num_segments
}

/// MurmurHash2, endian-neutral form.
pub fn murmur2(payload: &[u8]) -> i32 {
    let mut h = SEED;
    let mut blocks = payload.chunks_exact(4);
    for block in &mut blocks {
        let mut k = i32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(M);
        k ^= ((k as u32) >> R) as i32;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    h = mix_tail(h, blocks.remainder(), unsigned);

    h ^= ((h as u32) >> 13) as i32;
    h = h.wrapping_mul(M);
    h ^= ((h as u32) >> 15) as i32;
    h
}

/// The legacy variant. Do not tidy: bytes are sign-extended before being
/// OR-ed into the block, and every right shift is arithmetic.
pub fn murmur2_compat(payload: &[u8]) -> i32 {
    let mut h = SEED;
    let mut blocks = payload.chunks_exact(4);
    for block in &mut blocks {
        let mut k = signed(block[0]);
        k |= signed(block[1]) << 8;
        k |= signed(block[2]) << 16;
        k |= signed(block[3]) << 24;

        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    h = mix_tail(h, blocks.remainder(), signed);

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

fn unsigned(b: u8) -> i32 {
    b as i32
}

fn signed(b: u8) -> i32 {
    b as i8 as i32
}

/// Mixes the 1-3 trailing bytes, highest offset first.
fn mix_tail(mut h: i32, tail: &[u8], widen: fn(u8) -> i32) -> i32 {
    match *tail {
        [b0, b1, b2] => {
            h ^= widen(b2) << 16;
            h ^= widen(b1) << 8;
            h ^= widen(b0);
            h = h.wrapping_mul(M);
        }
        [b0, b1] => {
            h ^= widen(b1) << 8;
            h ^= widen(b0);
            h = h.wrapping_mul(M);
        }
        [b0] => {
            h ^= widen(b0);
            h = h.wrapping_mul(M);
        }
        _ => {}
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    // reference values produced by the original 32-bit signed implementation
    #[test]
    fn murmur2_vectors() {
        assert_eq!(murmur2(b""), -1285986640);
        assert_eq!(murmur2(b"a"), 1773189722);
        assert_eq!(murmur2(b"ab"), -360032299);
        assert_eq!(murmur2(b"abc"), -691999160);
        assert_eq!(murmur2(b"abcd"), 774302232);
        assert_eq!(murmur2(b"hello"), -1944795373);
        assert_eq!(murmur2(b"hello world"), -849290505);
        assert_eq!(murmur2(&[0xff, 0x80, 0x7f, 0x01, 0xfe]), -1858051666);
    }

    #[test]
    fn murmur2_compat_vectors() {
        assert_eq!(murmur2_compat(b""), 0);
        assert_eq!(murmur2_compat(b"a"), 2000124074);
        assert_eq!(murmur2_compat(b"ab"), 359946197);
        assert_eq!(murmur2_compat(b"abc"), 691990088);
        assert_eq!(murmur2_compat(b"abcd"), 649478437);
        assert_eq!(murmur2_compat(b"hello"), 587558152);
        assert_eq!(murmur2_compat(b"hello world"), 1784532426);
        assert_eq!(murmur2_compat(&[0xff, 0x80, 0x7f, 0x01, 0xfe]), 615995892);
    }

    #[test]
    fn variants_differ_on_high_bytes() {
        // non-ascii bytes are where sign extension changes the result
        let input = "é".as_bytes();
        assert_eq!(murmur2(input), -773498973);
        assert_eq!(murmur2_compat(input), 847000627);
    }

    #[test]
    fn compat_only_produces_31_bits() {
        for i in 0..2000u32 {
            let key = format!("key-{i}");
            assert!(murmur2_compat(key.as_bytes()) >= 0, "negative hash for {key}");
        }
    }

    #[test]
    fn hash_code_uses_little_endian_bytes() {
        let f = HashFunction::Murmur2;
        assert_eq!(f.hash_code(0), 2019120388);
        assert_eq!(f.hash_code(42), -1444254834);
        assert_eq!(f.hash_code(-1), -1961804919);
        assert_eq!(f.hash_code(42), f.hash_bytes(&[42, 0, 0, 0]));

        let c = HashFunction::Murmur2Compat;
        assert_eq!(c.hash_code(0), 1159802868);
        assert_eq!(c.hash_code(42), 1444178830);
        assert_eq!(c.hash_code(-1), 952579318);
    }

    #[test]
    fn code_and_bytes_are_distinct_paths() {
        let f = HashFunction::Murmur2;
        // the string "42" and the code 42 must not collide by construction
        assert_ne!(f.hash(HashInput::Str("42")), f.hash(HashInput::Code(42)));
        assert_eq!(f.hash(HashInput::Str("hello")), f.hash(HashInput::Bytes(b"hello")));
    }

    #[test]
    fn hashing_is_deterministic() {
        for f in [HashFunction::Murmur2, HashFunction::Murmur2Compat] {
            for i in 0..500u32 {
                let payload = i.to_be_bytes();
                assert_eq!(f.hash_bytes(&payload), f.hash_bytes(&payload));
            }
        }
    }

    #[test]
    fn segment_reduction_stays_in_range() {
        assert_eq!(segment_for_hash(murmur2(b""), 60), 28);
        assert_eq!(segment_for_hash(murmur2(b"hello"), 256), 19);
        assert_eq!(segment_for_hash(murmur2_compat(b"abcd"), 60), 37);
        assert_eq!(segment_for_hash(i32::MIN, 7), 0);
        assert_eq!(segment_for_hash(-1, 1), 0);

        for n in [1u32, 2, 3, 60, 256, 1000] {
            for i in 0..300u32 {
                let h = murmur2(&i.to_le_bytes());
                assert!(segment_for_hash(h, n) < n);
            }
        }
    }

    #[test]
    fn segments_spread_evenly() {
        let n = 16u32;
        let mut counts = [0usize; 16];
        for i in 0..16_000u32 {
            let key = format!("user:{i}");
            counts[segment_for_hash(murmur2(key.as_bytes()), n) as usize] += 1;
        }
        // 1000 expected per segment; allow generous slack
        assert!(counts.iter().all(|&c| (700..1300).contains(&c)), "{counts:?}");
    }

    #[test]
    fn hash_function_names() {
        assert_eq!("murmur2".parse::<HashFunction>().unwrap(), HashFunction::Murmur2);
        assert_eq!(
            "MURMUR2-COMPAT".parse::<HashFunction>().unwrap(),
            HashFunction::Murmur2Compat
        );
        assert!("crc16".parse::<HashFunction>().is_err());
        assert_eq!(HashFunction::Murmur2Compat.to_string(), "murmur2-compat");

        let parsed: HashFunction = serde_json::from_str("\"murmur2-compat\"").unwrap();
        assert_eq!(parsed, HashFunction::Murmur2Compat);
    }
}
