//! Per-transaction metrics computed once when a transaction enters a pool.

use petal_core::error::TransactionError;
use petal_core::types::{Amount, HeightRange, Transaction, TxContext};

/// Fee, size, and validity window of a pooled transaction.
///
/// Built from a validated transaction and its [`TxContext`]; immutable
/// afterwards except when a stem merge rebuilds it for the combined
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Total fee paid.
    pub fee: Amount,
    /// Fee surplus over the minimum the validator required.
    pub fee_reserve: Amount,
    /// Serialized size plus `size_correction`.
    pub size: u32,
    /// Constant added to the measured size.
    pub size_correction: u32,
    /// Heights at which the transaction may be mined.
    pub height_range: HeightRange,
}

impl Stats {
    /// Populate from a validated transaction and its context.
    ///
    /// `ctx` must come from a successful validation; it is not re-checked.
    pub fn from_context(
        tx: &Transaction,
        ctx: &TxContext,
        fee_reserve: Amount,
        size_correction: u32,
    ) -> Result<Self, TransactionError> {
        let mut stats = Self {
            fee: ctx.fee,
            fee_reserve,
            size: 0,
            size_correction,
            height_range: ctx.height,
        };
        stats.set_size(tx)?;
        Ok(stats)
    }

    /// Measure `tx` and store its corrected size.
    pub fn set_size(&mut self, tx: &Transaction) -> Result<(), TransactionError> {
        let netto = u32::try_from(tx.size_netto()?).unwrap_or(u32::MAX);
        self.size = netto.saturating_add(self.size_correction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_core::types::{Hash256, TxKernel};

    fn make_tx(fee: Amount) -> Transaction {
        Transaction {
            inputs: vec![Hash256([1; 32])],
            outputs: vec![Hash256([2; 32])],
            kernels: vec![TxKernel { fee, min_height: 5, max_height: 50, bvm_charge: 0, nonce: 0 }],
            offset: Hash256::ZERO,
        }
    }

    #[test]
    fn from_context_copies_fee_and_range() {
        let tx = make_tx(300);
        let ctx = TxContext::summarize(&tx).unwrap();
        let stats = Stats::from_context(&tx, &ctx, 20, 64).unwrap();
        assert_eq!(stats.fee, 300);
        assert_eq!(stats.fee_reserve, 20);
        assert_eq!(stats.height_range, HeightRange::new(5, 50));
        assert_eq!(stats.size_correction, 64);
    }

    #[test]
    fn size_includes_correction() {
        let tx = make_tx(300);
        let ctx = TxContext::summarize(&tx).unwrap();
        let netto = tx.size_netto().unwrap() as u32;

        let plain = Stats::from_context(&tx, &ctx, 0, 0).unwrap();
        let corrected = Stats::from_context(&tx, &ctx, 0, 100).unwrap();
        assert_eq!(plain.size, netto);
        assert_eq!(corrected.size, netto + 100);
    }

    #[test]
    fn set_size_remeasures() {
        let tx = make_tx(1);
        let ctx = TxContext::summarize(&tx).unwrap();
        let mut stats = Stats::from_context(&tx, &ctx, 0, 0).unwrap();

        let bigger = tx.combine(&make_tx(2));
        stats.set_size(&bigger).unwrap();
        assert_eq!(stats.size, bigger.size_netto().unwrap() as u32);
    }
}
