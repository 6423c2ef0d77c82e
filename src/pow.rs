//! Proof of work: 256-bit targets, compact encoding, chain work and
//! difficulty adjustment

use crate::constants::*;
use crate::error::{RejectReason, ValidationResult};
use crate::params::ChainParams;
use crate::types::*;
use std::cmp::Ordering;
use std::fmt;

/// CheckProofOfWork: ℍ × ℕ → {true, false}
///
/// The block hash, read as a big-endian 256-bit number, must be strictly
/// below ExpandTarget(bits).
pub fn check_proof_of_work(hash: &Hash, bits: u32) -> ValidationResult<()> {
    let target = expand_target(bits)?;
    if U256::from_be_bytes(hash) < target {
        Ok(())
    } else {
        Err(RejectReason::InsufficientWork)
    }
}

/// BlockWork: ℕ → ℕ
///
/// Expected number of hashes to meet the target: ⌊2²⁵⁶ / (target + 1)⌋.
/// For a target of 2^(256-d) - 1 this is exactly 2^d.
pub fn block_work(bits: u32) -> U256 {
    let target = match expand_target(bits) {
        Ok(target) => target,
        Err(_) => return U256::ZERO,
    };
    match target.checked_add(&U256::ONE) {
        // 2²⁵⁶ / (t + 1) = (2²⁵⁶ - 1 - t) / (t + 1) + 1
        Some(divisor) => (!target).div(&divisor).saturating_add(&U256::ONE),
        None => U256::ONE,
    }
}

/// Retarget: ℕ × ℕ → ℕ
///
/// For the compact target of the last block of a window and the elapsed
/// time across that window:
/// 1. Let expected = adjustmentInterval × targetBlockTime
/// 2. Let actual = clamp(elapsed, expected / 4, expected × 4)
/// 3. Let newTarget = target × actual / expected
/// 4. Return min(newTarget, powLimit)
pub fn retarget(current_bits: u32, elapsed: u64, params: &ChainParams) -> u32 {
    let expected = params.expected_window_secs();
    if expected == 0 {
        return current_bits;
    }
    let actual = elapsed.clamp(
        expected / MAX_ADJUSTMENT_FACTOR,
        expected.saturating_mul(MAX_ADJUSTMENT_FACTOR),
    );

    let limit = match expand_target(params.pow_limit) {
        Ok(limit) => limit,
        Err(_) => return current_bits,
    };
    let current = match expand_target(current_bits) {
        Ok(current) => current,
        Err(_) => return params.pow_limit,
    };

    // target × actual / expected without overflowing 256 bits
    let (quotient, remainder) = current.div_rem_u64(expected);
    let fraction = ((remainder as u128 * actual as u128) / expected as u128) as u64;
    let scaled = quotient
        .checked_mul_u64(actual)
        .and_then(|t| t.checked_add(&U256::from_u64(fraction)));

    let new_target = match scaled {
        Some(target) if target <= limit => target,
        _ => limit,
    };
    if new_target.is_zero() {
        return to_compact(&U256::ONE);
    }
    to_compact(&new_target)
}

/// Expand target from compact representation
///
/// The format is 0xEEMMMMMM where:
/// - EE is the exponent (size in bytes)
/// - MMMMMM is the mantissa, whose top bit is a sign bit
///
/// The actual target is: mantissa * 2^(8 * (exponent - 3))
pub fn expand_target(bits: u32) -> ValidationResult<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 {
        return Err(RejectReason::BadDifficulty("negative target".to_string()));
    }

    let target = if exponent <= 3 {
        U256::from_u64((mantissa >> (8 * (3 - exponent))) as u64)
    } else {
        let shift = 8 * (exponent - 3);
        let mantissa = U256::from_u64(mantissa as u64);
        if mantissa.bits() + shift > 256 {
            return Err(RejectReason::BadDifficulty("target exceeds 256 bits".to_string()));
        }
        mantissa.shl(shift)
    };

    if target.is_zero() {
        return Err(RejectReason::BadDifficulty("zero target".to_string()));
    }
    Ok(target)
}

/// Compress a target into its compact form (lossy: keeps 23 mantissa bits)
pub fn to_compact(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        target.shr(8 * (size - 3)).low_u64() as u32
    };
    // Keep the sign bit clear
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

// ============================================================================
// 256-BIT ARITHMETIC
// ============================================================================

/// 256-bit unsigned integer for targets and cumulative chain work
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256([u64; 4]); // little-endian words

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let start = 32 - (i + 1) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *word = u64::from_be_bytes(chunk);
        }
        U256(words)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            bytes[start..start + 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    fn bit(&self, index: u32) -> bool {
        (self.0[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut result = [0u64; 4];
        for i in word_shift..4 {
            let src = i - word_shift;
            result[i] = self.0[src] << bit_shift;
            if bit_shift > 0 && src > 0 {
                result[i] |= self.0[src - 1] >> (64 - bit_shift);
            }
        }
        U256(result)
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut result = [0u64; 4];
        for i in 0..(4 - word_shift) {
            let src = i + word_shift;
            result[i] = self.0[src] >> bit_shift;
            if bit_shift > 0 && src + 1 < 4 {
                result[i] |= self.0[src + 1] << (64 - bit_shift);
            }
        }
        U256(result)
    }

    pub fn checked_add(&self, other: &U256) -> Option<U256> {
        let mut result = [0u64; 4];
        let mut carry = false;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            result[i] = sum;
            carry = c1 || c2;
        }
        if carry {
            None
        } else {
            Some(U256(result))
        }
    }

    pub fn saturating_add(&self, other: &U256) -> U256 {
        self.checked_add(other).unwrap_or(U256::MAX)
    }

    fn wrapping_sub(&self, other: &U256) -> U256 {
        let mut result = [0u64; 4];
        let mut borrow = false;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            result[i] = diff;
            borrow = b1 || b2;
        }
        U256(result)
    }

    pub fn checked_mul_u64(&self, factor: u64) -> Option<U256> {
        let mut result = [0u64; 4];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry;
            result[i] = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            None
        } else {
            Some(U256(result))
        }
    }

    /// Quotient and remainder by a non-zero u64
    pub fn div_rem_u64(&self, divisor: u64) -> (U256, u64) {
        if divisor == 0 {
            return (U256::MAX, 0);
        }
        let mut result = [0u64; 4];
        let mut remainder: u128 = 0;
        for i in (0..4).rev() {
            let current = (remainder << 64) | self.0[i] as u128;
            result[i] = (current / divisor as u128) as u64;
            remainder = current % divisor as u128;
        }
        (U256(result), remainder as u64)
    }

    /// Long division; division by zero saturates
    pub fn div(&self, divisor: &U256) -> U256 {
        if divisor.is_zero() {
            return U256::MAX;
        }
        let mut quotient = U256::ZERO;
        let mut remainder = U256::ZERO;
        for i in (0..256).rev() {
            let overflow = remainder.bit(255);
            remainder = remainder.shl(1);
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if overflow || remainder >= *divisor {
                remainder = remainder.wrapping_sub(divisor);
                quotient.0[(i / 64) as usize] |= 1 << (i % 64);
            }
        }
        quotient
    }
}

impl std::ops::Not for U256 {
    type Output = U256;

    fn not(self) -> U256 {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U256({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with_window(interval: u64, block_time: u64) -> ChainParams {
        ChainParams {
            adjustment_interval: interval,
            target_block_time: block_time,
            ..ChainParams::default()
        }
    }

    #[test]
    fn test_expand_target_bitcoin_genesis() {
        let target = expand_target(0x1d00ffff).unwrap();
        let bytes = target.to_be_bytes();
        assert_eq!(&bytes[..6], &[0, 0, 0, 0, 0xff, 0xff]);
        assert!(bytes[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_expand_target_small_exponent() {
        assert_eq!(expand_target(0x03123456).unwrap(), U256::from_u64(0x123456));
        assert_eq!(expand_target(0x02123456).unwrap(), U256::from_u64(0x1234));
    }

    #[test]
    fn test_expand_target_rejects_invalid() {
        assert!(expand_target(0x1d800000 | 0x1234).is_err());
        assert!(expand_target(0x21010000).is_err());
        assert!(expand_target(0x1d000000).is_err());
    }

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x1f00ffff, 0x207fffff, 0x1b0404cb, 0x03123456] {
            assert_eq!(to_compact(&expand_target(bits).unwrap()), bits);
        }
    }

    #[test]
    fn test_check_proof_of_work() {
        let easy = REGTEST_POW_LIMIT;
        assert!(check_proof_of_work(&[0u8; 32], easy).is_ok());
        assert_eq!(check_proof_of_work(&[0xff; 32], easy), Err(RejectReason::InsufficientWork));
    }

    #[test]
    fn test_block_work_powers_of_two() {
        // target = 2^240 - 1 (bits 0x1f00ffff is 0xffff << 224, close to it)
        let target = U256::ONE.shl(240).wrapping_sub(&U256::ONE);
        let bits = to_compact(&target);
        let work = block_work(bits);
        // compact rounding keeps the top 16 bits: work lands within 2^16 + 1
        assert!(work >= U256::from_u64(1 << 16));
        assert!(work <= U256::from_u64((1 << 16) + 1));

        assert_eq!(block_work(0x207fffff), U256::from_u64(2));
    }

    #[test]
    fn test_harder_target_means_more_work() {
        assert!(block_work(0x1d00ffff) > block_work(0x1f00ffff));
    }

    #[test]
    fn test_retarget_unchanged_on_schedule() {
        let params = params_with_window(2016, 600);
        assert_eq!(retarget(0x1d00ffff, 2016 * 600, &params), 0x1d00ffff);
    }

    #[test]
    fn test_retarget_clamps_to_factor_four() {
        let params = params_with_window(2016, 600);
        let base = expand_target(0x1c00ffff).unwrap();

        let faster = expand_target(retarget(0x1c00ffff, 1, &params)).unwrap();
        let (quarter, _) = base.div_rem_u64(4);
        assert_eq!(faster, quarter);

        let slower = expand_target(retarget(0x1c00ffff, u64::MAX, &params)).unwrap();
        assert_eq!(slower, base.checked_mul_u64(4).unwrap());
    }

    #[test]
    fn test_retarget_never_above_pow_limit() {
        let params = params_with_window(10, 600);
        let bits = retarget(params.pow_limit, 100 * 600, &params);
        assert_eq!(bits, params.pow_limit);
    }

    #[test]
    fn test_u256_division() {
        let a = U256::from_u64(1_000_000).shl(100);
        let b = U256::from_u64(1000).shl(40);
        assert_eq!(a.div(&b), U256::from_u64(1000).shl(60));
        assert_eq!(U256::MAX.div(&U256::MAX), U256::ONE);
        assert_eq!(U256::from_u64(7).div(&U256::from_u64(2)), U256::from_u64(3));
    }

    #[test]
    fn test_u256_shifts() {
        let one = U256::ONE;
        assert_eq!(one.shl(255).shr(255), one);
        assert_eq!(one.shl(64).0, [0, 1, 0, 0]);
        assert_eq!(U256([0, 1, 0, 0]).shr(1).0, [1 << 63, 0, 0, 0]);
        assert_eq!(one.shl(256), U256::ZERO);
    }

    #[test]
    fn test_u256_byte_order() {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        assert_eq!(U256::from_be_bytes(&bytes), U256::ONE);
        assert_eq!(U256::ONE.to_be_bytes(), bytes);
    }
}
