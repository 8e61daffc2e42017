//! Profit ranking shared by the fluff and stem pools.
//!
//! A [`ProfitKey`] orders transactions by fee per byte of effective size,
//! most profitable first, so `BTreeMap<ProfitKey, _>::iter()` walks block
//! candidates in the order they should be taken. The ratio is compared by
//! cross-multiplication in `u128`, which neither overflows nor rounds.
//!
//! Equal ratios fall back to the insertion sequence (lower first), which
//! makes the order strict: two keys compare equal only when their
//! sequences are equal.

use std::cmp::Ordering;

use petal_core::types::Amount;

use crate::stats::Stats;

#[derive(Debug, Clone, Copy)]
pub struct ProfitKey {
    fee: Amount,
    size: u32,
    seq: u64,
}

impl ProfitKey {
    pub fn new(stats: &Stats, seq: u64) -> Self {
        Self::from_parts(stats.fee, stats.size, seq)
    }

    /// Key from raw fee and size. A zero size is treated as one byte.
    pub fn from_parts(fee: Amount, size: u32, seq: u64) -> Self {
        Self { fee, size: size.max(1), seq }
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Tie-break sequence.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Compare profitability only, ignoring the tie-break.
    ///
    /// `Less` means `self` pays more per byte than `other`.
    pub fn cmp_ratio(&self, other: &Self) -> Ordering {
        let lhs = u128::from(self.fee) * u128::from(other.size);
        let rhs = u128::from(other.fee) * u128::from(self.size);
        rhs.cmp(&lhs)
    }
}

impl Ord for ProfitKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_ratio(other).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ProfitKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ProfitKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProfitKey {}
