//! Approximate membership filters over join key hashes.
//!
//! A filter answers "might this hash be in the bucket?" with no false
//! negatives. The fingerprint width is picked from the configured
//! false-positive target: 8-bit fingerprints give about 1/256, 16-bit about
//! 1/65536 and 32-bit about 1/4 billion.

use std::fmt;

use xorf::{Filter, Xor16, Xor32, Xor8};

/// Fingerprint width for a false-positive target.
#[must_use]
pub fn fingerprint_bits(false_positive_rate: f64) -> u8 {
    if false_positive_rate >= 1.0 / 256.0 {
        8
    } else if false_positive_rate >= 1.0 / 65_536.0 {
        16
    } else {
        32
    }
}

/// Xor filter of one bucket's key hashes.
pub enum MembershipFilter {
    /// 8-bit fingerprints
    Xor8(Xor8),
    /// 16-bit fingerprints
    Xor16(Xor16),
    /// 32-bit fingerprints
    Xor32(Xor32),
}

impl MembershipFilter {
    /// Builds a filter over `hashes`, or `None` for an empty set.
    ///
    /// Duplicate hashes are removed first; xor filter construction requires
    /// distinct keys.
    #[must_use]
    pub fn build(mut hashes: Vec<u64>, false_positive_rate: f64) -> Option<Self> {
        hashes.sort_unstable();
        hashes.dedup();
        if hashes.is_empty() {
            return None;
        }
        let filter = match fingerprint_bits(false_positive_rate) {
            8 => MembershipFilter::Xor8(Xor8::from(&hashes)),
            16 => MembershipFilter::Xor16(Xor16::from(&hashes)),
            _ => MembershipFilter::Xor32(Xor32::from(&hashes)),
        };
        Some(filter)
    }

    /// Returns `false` only if `hash` is definitely absent.
    #[inline]
    #[must_use]
    pub fn contains(&self, hash: u64) -> bool {
        match self {
            MembershipFilter::Xor8(f) => f.contains(&hash),
            MembershipFilter::Xor16(f) => f.contains(&hash),
            MembershipFilter::Xor32(f) => f.contains(&hash),
        }
    }

    /// Fingerprint width in bits.
    #[must_use]
    pub fn bits(&self) -> u8 {
        match self {
            MembershipFilter::Xor8(_) => 8,
            MembershipFilter::Xor16(_) => 16,
            MembershipFilter::Xor32(_) => 32,
        }
    }
}

impl fmt::Debug for MembershipFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipFilter")
            .field("bits", &self.bits())
            .finish()
    }
}
