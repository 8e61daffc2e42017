//! Stem-phase (Dandelion++) holding area.
//!
//! Each element may carry an absolute deadline in the time index and may
//! sit in the profit index while it is open for aggregation. The two
//! memberships are independent.
//!
//! Only one [`StemTimer`] exists. It is kept armed for the smallest
//! deadline in the time index and disarmed when the index is empty; every
//! insert or delete that can move the minimum re-syncs it, and
//! [`Stem::on_timer`] re-derives due elements from the live index rather
//! than trusting whatever was armed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use petal_core::error::{PoolError, TransactionError};
use petal_core::traits::StemTimer;
use petal_core::types::{Amount, HeightRange, Transaction};
use tracing::{debug, trace};

use crate::profit::ProfitKey;
use crate::stats::Stats;

/// Identity of a stem element. Never reused within one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StemId(u64);

impl fmt::Display for StemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stem#{}", self.0)
    }
}

/// Hooks the owning node provides to the stem pool.
pub trait StemHandler {
    /// Re-validate `tx` against the current tip. Returns the fee reserve.
    fn validate_tx_context(
        &mut self,
        tx: &Transaction,
        height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError>;

    /// `id`'s deadline passed. It has already left the time index; the
    /// handler decides whether to fluff it, forward it and re-arm, or
    /// delete it.
    fn on_timed_out(&mut self, stem: &mut Stem, id: StemId);
}

/// A transaction held in the stem phase.
#[derive(Debug)]
pub struct Element {
    tx: Transaction,
    stats: Stats,
    time: Option<u64>,
    profit: ProfitKey,
    aggregating: bool,
}

impl Element {
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Absolute deadline in ms, if a timer is set for this element.
    pub fn deadline(&self) -> Option<u64> {
        self.time
    }

    pub fn is_aggregating(&self) -> bool {
        self.aggregating
    }

    pub fn into_tx(self) -> Transaction {
        self.tx
    }
}

/// The stem pool.
pub struct Stem {
    elements: HashMap<StemId, Element>,
    time: BTreeSet<(u64, StemId)>,
    profit: BTreeMap<ProfitKey, StemId>,
    timer: Box<dyn StemTimer>,
    /// Deadline the timer is currently armed for.
    armed: Option<u64>,
    max_merged_size: u32,
    next_id: u64,
}

impl fmt::Debug for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stem")
            .field("len", &self.elements.len())
            .field("timed", &self.time.len())
            .field("aggregating", &self.profit.len())
            .field("armed", &self.armed)
            .finish()
    }
}

impl Stem {
    /// Create an empty pool driving `timer`.
    ///
    /// `max_merged_size` caps the corrected size of a merge result.
    pub fn new(timer: Box<dyn StemTimer>, max_merged_size: u32) -> Self {
        Self {
            elements: HashMap::new(),
            time: BTreeSet::new(),
            profit: BTreeMap::new(),
            timer,
            armed: None,
            max_merged_size,
            next_id: 0,
        }
    }

    /// Take ownership of a validated transaction. The element starts in
    /// neither index.
    pub fn add_valid_tx(&mut self, tx: Transaction, stats: Stats) -> StemId {
        let id = StemId(self.next_id);
        self.next_id += 1;
        self.elements.insert(
            id,
            Element {
                tx,
                stats,
                time: None,
                profit: ProfitKey::new(&stats, id.0),
                aggregating: false,
            },
        );
        debug!(%id, fee = stats.fee, size = stats.size, "stem: added");
        id
    }

    /// Open `id` for aggregation (profit index only).
    pub fn insert_aggr(&mut self, id: StemId) -> Result<(), PoolError> {
        let elem = self.elements.get_mut(&id).ok_or(PoolError::UnknownElement(id.0))?;
        if !elem.aggregating {
            elem.aggregating = true;
            self.profit.insert(elem.profit, id);
        }
        Ok(())
    }

    /// Close `id` for aggregation. Its deadline is untouched.
    pub fn delete_aggr(&mut self, id: StemId) -> Result<(), PoolError> {
        let elem = self.elements.get_mut(&id).ok_or(PoolError::UnknownElement(id.0))?;
        if elem.aggregating {
            elem.aggregating = false;
            self.profit.remove(&elem.profit);
        }
        Ok(())
    }

    /// Merge `source` into `target`.
    ///
    /// Both must be aggregating, spend and create disjoint outputs, have
    /// overlapping validity windows, fit `max_merged_size` together, and
    /// the combined transaction must pass the handler's re-validation. On
    /// any failure neither element changes. On success `source` is deleted
    /// and `target` owns the combined transaction with rebuilt stats.
    pub fn try_merge<H: StemHandler + ?Sized>(
        &mut self,
        target: StemId,
        source: StemId,
        handler: &mut H,
    ) -> Result<(), PoolError> {
        if target == source {
            return Err(PoolError::MergeIncompatible(format!("{target} merged with itself")));
        }
        let trg = self.elements.get(&target).ok_or(PoolError::UnknownElement(target.0))?;
        let src = self.elements.get(&source).ok_or(PoolError::UnknownElement(source.0))?;

        if !trg.aggregating || !src.aggregating {
            return Err(PoolError::MergeIncompatible("element not aggregating".into()));
        }

        let height_range = trg.stats.height_range.intersection(&src.stats.height_range);
        if height_range.is_empty() {
            return Err(PoolError::MergeIncompatible(format!(
                "height ranges {} and {} do not overlap",
                trg.stats.height_range, src.stats.height_range
            )));
        }

        if trg.tx.overlaps(&src.tx) {
            return Err(PoolError::MergeIncompatible("shared input or output".into()));
        }

        let merged = trg.tx.combine(&src.tx);
        let fee = trg
            .stats
            .fee
            .checked_add(src.stats.fee)
            .ok_or(TransactionError::FeeOverflow)?;

        let mut stats = Stats {
            fee,
            fee_reserve: 0,
            size: 0,
            size_correction: trg.stats.size_correction,
            height_range,
        };
        stats.set_size(&merged)?;
        if stats.size > self.max_merged_size {
            return Err(PoolError::MergeIncompatible(format!(
                "merged size {} exceeds {}",
                stats.size, self.max_merged_size
            )));
        }

        stats.fee_reserve = handler.validate_tx_context(&merged, &height_range, fee)?;

        // Commit.
        self.delete(source);
        let elem = self.elements.get_mut(&target).ok_or(PoolError::UnknownElement(target.0))?;
        self.profit.remove(&elem.profit);
        elem.tx = merged;
        elem.stats = stats;
        elem.profit = ProfitKey::new(&stats, target.0);
        self.profit.insert(elem.profit, target);

        debug!(%target, %source, fee, size = stats.size, "stem: merged");
        Ok(())
    }

    /// Remove an element from both indexes and re-sync the timer.
    pub fn delete(&mut self, id: StemId) -> Option<Element> {
        let elem = self.elements.remove(&id)?;
        if elem.aggregating {
            self.profit.remove(&elem.profit);
        }
        if let Some(deadline) = elem.time {
            self.time.remove(&(deadline, id));
            self.sync_timer();
        }
        trace!(%id, "stem: deleted");
        Some(elem)
    }

    /// Cancel the timer and delete every element.
    pub fn clear(&mut self) {
        self.kill_timer();
        self.elements.clear();
        self.time.clear();
        self.profit.clear();
    }

    /// Remove `id` from the time index, keeping the element.
    pub fn delete_timer(&mut self, id: StemId) {
        if self.delete_timer_raw(id) {
            self.sync_timer();
        }
    }

    /// Set `id`'s deadline to now + `timeout_ms`, replacing any previous
    /// one, and re-arm if it became the nearest.
    pub fn set_timer(&mut self, id: StemId, timeout_ms: u64) -> Result<(), PoolError> {
        if !self.elements.contains_key(&id) {
            return Err(PoolError::UnknownElement(id.0));
        }
        self.delete_timer_raw(id);

        let deadline = self.timer.now_ms().saturating_add(timeout_ms);
        if let Some(elem) = self.elements.get_mut(&id) {
            elem.time = Some(deadline);
        }
        self.time.insert((deadline, id));
        self.sync_timer();

        trace!(%id, timeout_ms, deadline, "stem: timer set");
        Ok(())
    }

    /// Cancel the system timer.
    pub fn kill_timer(&mut self) {
        if self.armed.take().is_some() {
            self.timer.cancel();
        }
    }

    /// The nearest element and the ms left until its deadline (0 if due).
    pub fn next_timeout(&self) -> Option<(StemId, u64)> {
        let &(deadline, id) = self.time.first()?;
        Some((id, deadline.saturating_sub(self.timer.now_ms())))
    }

    /// The system timer fired.
    ///
    /// Hands every element whose deadline has passed to
    /// [`StemHandler::on_timed_out`], nearest first, then re-arms for the
    /// new minimum or disarms.
    pub fn on_timer<H: StemHandler + ?Sized>(&mut self, handler: &mut H) {
        // Whatever was armed has fired.
        self.armed = None;

        while let Some((id, remaining)) = self.next_timeout() {
            if remaining > 0 {
                break;
            }
            self.delete_timer_raw(id);
            trace!(%id, "stem: timed out");
            handler.on_timed_out(self, id);
        }

        self.sync_timer();
    }

    // --- Queries ---

    pub fn get(&self, id: StemId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn contains(&self, id: StemId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Aggregating elements, most profitable first.
    pub fn iter_aggr(&self) -> impl Iterator<Item = StemId> + '_ {
        self.profit.values().copied()
    }

    pub fn ids(&self) -> Vec<StemId> {
        let mut ids: Vec<StemId> = self.elements.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Deadline the system timer is armed for.
    pub fn armed_deadline(&self) -> Option<u64> {
        self.armed
    }

    /// Smallest deadline in the time index.
    pub fn min_deadline(&self) -> Option<u64> {
        self.time.first().map(|(deadline, _)| *deadline)
    }

    pub fn now_ms(&self) -> u64 {
        self.timer.now_ms()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn timed_len(&self) -> usize {
        self.time.len()
    }

    pub fn aggr_len(&self) -> usize {
        self.profit.len()
    }

    // --- Internals ---

    fn delete_timer_raw(&mut self, id: StemId) -> bool {
        let Some(elem) = self.elements.get_mut(&id) else {
            return false;
        };
        match elem.time.take() {
            Some(deadline) => self.time.remove(&(deadline, id)),
            None => false,
        }
    }

    /// Make the armed deadline match the time index minimum.
    fn sync_timer(&mut self) {
        match self.min_deadline() {
            None => self.kill_timer(),
            Some(deadline) if self.armed != Some(deadline) => {
                let timeout_ms = deadline.saturating_sub(self.timer.now_ms());
                self.timer.arm(timeout_ms);
                self.armed = Some(deadline);
                trace!(deadline, timeout_ms, "stem: timer armed");
            }
            Some(_) => {}
        }
    }
}

impl Drop for Stem {
    fn drop(&mut self) {
        self.kill_timer();
    }
}
