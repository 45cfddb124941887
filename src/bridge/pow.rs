use bitcoin::util::uint::Uint256;
use sha2::{Digest, Sha256};
use std::fmt::Debug;

/// Target of a difficulty 1 share, `2^224 - 1`, big endian.
const DIFF1_TARGET: [u8; 32] = [
    0, 0, 0, 0, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
    255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
];

/// Below this difficulty the division is done on a numerator shifted left by 32 bits so that
/// fractional difficulties keep their precision.
const FRACTIONAL_LIMIT: f64 = (1u64 << 31) as f64;

/// Computes the proof of work of a candidate header.
pub trait PowHasher: Send + Sync + Debug {
    /// Returns the 32 byte hash, least significant byte first.
    fn hash(&self, pre_pow_hash: &[u8; 32], timestamp: u64, nonce: u64) -> [u8; 32];
}

/// Double SHA-256 over `pre_pow_hash || timestamp_le || nonce_le`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256dHasher;

impl PowHasher for Sha256dHasher {
    fn hash(&self, pre_pow_hash: &[u8; 32], timestamp: u64, nonce: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(pre_pow_hash);
        hasher.update(timestamp.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        let first = hasher.finalize();
        Sha256::digest(first).into()
    }
}

pub fn diff1_target() -> Uint256 {
    Uint256::from_be_bytes(DIFF1_TARGET)
}

/// Interprets a little endian hash as a 256 bit integer.
pub fn hash_to_uint(hash: &[u8; 32]) -> Uint256 {
    let mut be = *hash;
    be.reverse();
    Uint256::from_be_bytes(be)
}

fn uint_to_f64(value: &Uint256) -> f64 {
    value
        .to_be_bytes()
        .iter()
        .fold(0.0, |acc, b| acc * 256.0 + *b as f64)
}

/// Converts a (possibly fractional) stratum difficulty into the target a hash must not exceed.
pub fn target_from_difficulty(difficulty: f64) -> Uint256 {
    if !(difficulty > 0.0) || !difficulty.is_finite() {
        return Uint256::from_be_bytes([255; 32]);
    }
    let (numerator, scaled) = if difficulty < FRACTIONAL_LIMIT {
        (diff1_target() << 32, difficulty * 4_294_967_296.0)
    } else {
        (diff1_target(), difficulty)
    };
    let divisor = scaled.round().clamp(1.0, u64::MAX as f64) as u64;
    match Uint256::from_u64(divisor) {
        Some(divisor) => numerator / divisor,
        None => Uint256::from_be_bytes([255; 32]),
    }
}

/// Difficulty a hash equal to `target` would represent.
pub fn difficulty_from_target(target: &Uint256) -> f64 {
    let target = uint_to_f64(target);
    if target == 0.0 {
        return f64::MAX;
    }
    uint_to_f64(&diff1_target()) / target
}

/// Difficulty actually achieved by a hash.
pub fn hash_difficulty(hash: &[u8; 32]) -> f64 {
    difficulty_from_target(&hash_to_uint(hash))
}

/// Power of two closest to `difficulty` on a log scale.
pub fn pow2_round(difficulty: f64) -> f64 {
    if difficulty <= 0.0 {
        return difficulty;
    }
    2f64.powi(difficulty.log2().round() as i32)
}

/// Smallest power of two not below `difficulty`.
pub fn pow2_ceil(difficulty: f64) -> f64 {
    if difficulty <= 0.0 {
        return difficulty;
    }
    2f64.powi(difficulty.log2().ceil() as i32)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn difficulty_one_is_diff1_target() {
        assert_eq!(target_from_difficulty(1.0), diff1_target());
        let d = difficulty_from_target(&diff1_target());
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn difficulty_target_round_trip_fractional_and_large() {
        for diff in [1.0 / 16_777_216.0, 0.25, 4.0, 8192.0, 1.5e12] {
            let back = difficulty_from_target(&target_from_difficulty(diff));
            assert!(
                ((back - diff) / diff).abs() < 1e-6,
                "diff {} came back as {}",
                diff,
                back
            );
        }
    }

    #[test]
    fn higher_difficulty_is_smaller_target() {
        assert!(target_from_difficulty(2.0) < target_from_difficulty(1.0));
        assert!(target_from_difficulty(0.5) > target_from_difficulty(1.0));
    }

    #[test]
    fn hasher_is_deterministic_and_nonce_sensitive() {
        let header = [7u8; 32];
        let a = Sha256dHasher.hash(&header, 1_700_000_000_000, 1);
        let b = Sha256dHasher.hash(&header, 1_700_000_000_000, 1);
        let c = Sha256dHasher.hash(&header, 1_700_000_000_000, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn pow2_helpers() {
        assert_eq!(pow2_round(1000.0), 1024.0);
        assert_eq!(pow2_round(1024.0), 1024.0);
        assert_eq!(pow2_round(5.2), 4.0);
        assert_eq!(pow2_round(7.6), 8.0);
        assert_eq!(pow2_ceil(1000.0), 1024.0);
        assert_eq!(pow2_round(0.3), 0.25);
    }
}
