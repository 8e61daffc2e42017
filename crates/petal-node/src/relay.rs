//! Dandelion++ relay policy over the three pools.
//!
//! [`RelayNode`] owns the fluff, stem, and dependent pools and decides what
//! happens to every transaction: aggregate, forward on the stem, fluff,
//! displace a weaker conflict, or expire with the chain tip.
//!
//! The stem pool calls back into the policy through [`StemHandler`], so the
//! policy state lives in a separate `RelayCore` that can be borrowed
//! mutably next to the stem pool.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use petal_core::error::PoolError;
use petal_core::traits::{ContextValidator, PeerSink, StemTimer};
use petal_core::types::{Amount, ContextHash, Height, HeightRange, Transaction, TxContext};
use petal_pool::{Dependent, DependentId, Fluff, FluffId, ProfitKey, SendId, State, Stats, Stem, StemHandler, StemId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::config::NodeConfig;
use crate::error::PetalError;

/// Opaque peer identifier assigned by the host.
pub type PeerId = u64;

/// What one [`RelayNode::on_new_tip`] sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TipSweep {
    /// Fluff elements that became outdated.
    pub outdated: usize,
    /// Pre-fluffed elements that reached their wait height.
    pub fluffed: usize,
    /// Outdated elements past the retention depth, deleted.
    pub purged: usize,
    /// Stem elements no longer valid, deleted.
    pub stem_dropped: usize,
    /// Dependent elements removed because they or an ancestor expired.
    pub dependent_dropped: usize,
}

/// Pool sizes at a glance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub tip: Height,
    pub fluff: usize,
    pub profit: usize,
    pub pre_fluffed: usize,
    pub outdated: usize,
    pub send_queue: usize,
    pub stem: usize,
    pub aggregating: usize,
    pub dependent: usize,
    pub timer_deadline: Option<u64>,
}

/// A peer's position in the fluff send queue. Holds one reference on the
/// record it points at.
#[derive(Debug, Default)]
struct PeerCursor {
    position: Option<SendId>,
}

/// Policy state the stem pool calls back into.
struct RelayCore {
    config: NodeConfig,
    fluff: Fluff,
    dependent: Dependent,
    validator: Arc<dyn ContextValidator>,
    sink: Arc<dyn PeerSink>,
    rng: StdRng,
    tip: Height,
}

impl RelayCore {
    /// Relay-time check: still mineable in the next block or later, and
    /// accepted by the external validator.
    fn check_context(
        &self,
        tx: &Transaction,
        height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError> {
        let next = self.tip.saturating_add(1);
        if height.max < next {
            return Err(PoolError::stale(format!("expired: valid {height}, next block {next}")));
        }
        self.validator.validate_tx_context(tx, height, fees)
    }

    /// Like [`check_context`](Self::check_context), but the transaction must
    /// be mineable in the very next block.
    fn check_stem_context(
        &self,
        tx: &Transaction,
        height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError> {
        let next = self.tip.saturating_add(1);
        if height.min > next {
            return Err(PoolError::stale(format!("not yet valid: valid {height}, next block {next}")));
        }
        self.check_context(tx, height, fees)
    }

    fn stats_for(&self, tx: &Transaction, ctx: &TxContext, reserve: Amount) -> Result<Stats, PoolError> {
        Ok(Stats::from_context(tx, ctx, reserve, self.config.limits.size_correction)?)
    }

    /// Insert as `Fluffed` and broadcast.
    fn add_fluffed(&mut self, tx: Transaction, stats: Stats) -> Result<FluffId, PoolError> {
        let key = tx.key();
        let id = self.fluff.add_valid_tx(tx, stats, key, State::Fluffed, 0)?;
        if let Some(elem) = self.fluff.get(id) {
            self.sink.broadcast_fluff(elem.tx());
        }
        Ok(id)
    }

    /// Move a stem element into the fluff pool and broadcast it.
    fn fluff_out_of_stem(&mut self, stem: &mut Stem, id: StemId) {
        let Some(elem) = stem.delete(id) else {
            return;
        };
        let mut stats = *elem.stats();
        let tx = elem.into_tx();

        match self.check_context(&tx, &stats.height_range, stats.fee) {
            Ok(reserve) => stats.fee_reserve = reserve,
            Err(e) => {
                debug!(%id, %e, "stale stem tx dropped instead of fluffing");
                return;
            }
        }
        match self.add_fluffed(tx, stats) {
            Ok(fluff_id) => debug!(%id, %fluff_id, "stem tx fluffed"),
            Err(e) => debug!(%id, %e, "stem tx already public"),
        }
    }

    /// Out of aggregation: fluff or forward with a fresh embargo.
    fn relay(&mut self, stem: &mut Stem, id: StemId) {
        if stem.delete_aggr(id).is_err() {
            return;
        }
        let Some(elem) = stem.get(id) else {
            return;
        };
        let stats = *elem.stats();
        if let Err(e) = self.check_stem_context(elem.tx(), &stats.height_range, stats.fee) {
            debug!(%id, %e, "stem tx no longer valid");
            stem.delete(id);
            return;
        }

        if self.roll_fluff() {
            self.fluff_out_of_stem(stem, id);
            return;
        }

        self.sink.send_stem(elem.tx());
        let d = &self.config.dandelion;
        let embargo = self.rng.gen_range(d.stem_timeout_min_ms..=d.stem_timeout_max_ms);
        if let Err(e) = stem.set_timer(id, embargo) {
            debug!(%id, %e, "embargo not set");
        }
        debug!(%id, embargo, "stem tx forwarded");
    }

    fn roll_fluff(&mut self) -> bool {
        // Uniform in [0, 65535), so u16::MAX always fluffs and 0 never does.
        let roll: u16 = self.rng.gen_range(0..u16::MAX);
        roll < self.config.dandelion.fluff_probability
    }
}

impl StemHandler for RelayCore {
    fn validate_tx_context(
        &mut self,
        tx: &Transaction,
        height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError> {
        self.check_stem_context(tx, height, fees)
    }

    fn on_timed_out(&mut self, stem: &mut Stem, id: StemId) {
        match stem.get(id).map(|e| e.is_aggregating()) {
            Some(true) => self.relay(stem, id),
            Some(false) => {
                debug!(%id, "embargo expired, fluffing");
                self.fluff_out_of_stem(stem, id);
            }
            None => {}
        }
    }
}

/// The node-side owner of the pools.
pub struct RelayNode {
    stem: Stem,
    core: RelayCore,
    cursors: HashMap<PeerId, PeerCursor>,
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode").field("snapshot", &self.snapshot()).finish()
    }
}

impl RelayNode {
    /// Build a relay from a validated configuration.
    pub fn new(
        config: NodeConfig,
        validator: Arc<dyn ContextValidator>,
        sink: Arc<dyn PeerSink>,
        timer: Box<dyn StemTimer>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let stem = Stem::new(timer, config.dandelion.max_merged_size);
        let dependent = Dependent::new(config.dependent);
        Self {
            stem,
            core: RelayCore {
                config,
                fluff: Fluff::new(),
                dependent,
                validator,
                sink,
                rng,
                tip: 0,
            },
            cursors: HashMap::new(),
        }
    }

    // --- Inbound transactions ---

    /// A stem-phase transaction from the local wallet or a stem peer.
    ///
    /// Rejected when the same conflict key is already public. With
    /// aggregation on, the transaction waits for merge partners until its
    /// window closes or it reaches the target output count; otherwise it is
    /// relayed at once.
    pub fn on_stem_tx(&mut self, tx: Transaction) -> Result<StemId, PetalError> {
        let ctx = TxContext::summarize(&tx)?;
        let key = tx.key();
        if self.core.fluff.find_active(&key).is_some() {
            return Err(PoolError::DuplicateConflict(key.to_string()).into());
        }

        let reserve = self.core.check_stem_context(&tx, &ctx.height, ctx.fee)?;
        let stats = self.core.stats_for(&tx, &ctx, reserve)?;
        let id = self.stem.add_valid_tx(tx, stats);

        let d = &self.core.config.dandelion;
        if d.aggregation_enabled() {
            let window = d.aggregation_time_ms;
            let target = d.aggregation_outputs;
            self.stem.insert_aggr(id)?;
            self.stem.set_timer(id, window)?;
            self.aggregate(id, target);
            if self.stem.get(id).is_some_and(|e| e.tx().outputs.len() >= target) {
                self.core.relay(&mut self.stem, id);
            }
        } else {
            self.core.relay(&mut self.stem, id);
        }
        Ok(id)
    }

    /// A fluffed transaction seen on the network (or submitted publicly).
    ///
    /// A conflicting active element is displaced only by a strictly more
    /// profitable transaction; the loser becomes outdated at the current
    /// tip. Stem elements spending the same outputs are dropped. A
    /// transaction not mineable before a future height is held
    /// `PreFluffed` until then.
    pub fn on_fluff_tx(&mut self, tx: Transaction) -> Result<FluffId, PetalError> {
        Ok(self.admit_public(tx, 0)?)
    }

    /// A speculative transaction spending outputs of the dependent
    /// element identified by `parent_context` (or a root when `None`).
    ///
    /// Goes through the same relay-time check as a public transaction, so
    /// an expired or validator-rejected transaction never enters the forest.
    pub fn on_dependent_tx(
        &mut self,
        tx: Transaction,
        parent_context: Option<ContextHash>,
        context: ContextHash,
    ) -> Result<DependentId, PetalError> {
        let ctx = TxContext::summarize(&tx)?;
        self.core.check_context(&tx, &ctx.height, ctx.fee)?;
        let parent = match parent_context {
            Some(hash) => Some(
                self.core
                    .dependent
                    .find_by_context(&hash)
                    .ok_or_else(|| PoolError::stale(format!("unknown parent context {hash}")))?,
            ),
            None => None,
        };
        let key = tx.key();
        Ok(self.core.dependent.add_valid_tx(tx, &ctx, key, context, parent)?)
    }

    /// Publish the best dependent chain: every element on it not yet
    /// fluffed goes into the fluff pool under the public-transaction rules
    /// and is marked.
    ///
    /// An element is never published ahead of its parent's height: a chain
    /// whose transactions start above the next block waits `PreFluffed`. An
    /// element that is stale, or loses a conflict with a public transaction,
    /// is deleted with its subtree; the prefix above it stays promoted.
    pub fn promote_best_chain(&mut self) -> Result<Vec<FluffId>, PetalError> {
        let Some(best) = self.core.dependent.best() else {
            return Ok(Vec::new());
        };

        let mut promoted = Vec::new();
        let mut not_before: Height = 0;
        for id in self.core.dependent.chain(best) {
            let Some(elem) = self.core.dependent.get(id) else {
                continue;
            };
            let tx = elem.tx().clone();
            let already = elem.is_fluff();
            let ctx = TxContext::summarize(&tx)?;
            not_before = not_before.max(ctx.height.min);
            if already {
                continue;
            }

            // The same transaction already public counts as promoted.
            let public = self.core.fluff.find_active(&tx.key());
            if public.and_then(|f| self.core.fluff.get(f)).is_some_and(|e| *e.tx() == tx) {
                self.core.dependent.set_fluff(id)?;
                continue;
            }

            match self.admit_public(tx, not_before) {
                Ok(fluff_id) => {
                    self.core.dependent.set_fluff(id)?;
                    promoted.push(fluff_id);
                }
                Err(e @ (PoolError::StaleContext { .. } | PoolError::DuplicateConflict(_))) => {
                    let dropped = self.core.dependent.delete(id);
                    debug!(%id, %e, dropped = dropped.len(), "dependent subtree dropped on promotion");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(%best, promoted = promoted.len(), "dependent chain promoted");
        Ok(promoted)
    }

    // --- Chain and timer events ---

    /// The stem timer fired.
    pub fn on_timer(&mut self) {
        self.stem.on_timer(&mut self.core);
    }

    /// A new block at `height` became the tip.
    pub fn on_new_tip(&mut self, height: Height) -> TipSweep {
        self.core.tip = height;
        let next = height.saturating_add(1);
        let mut sweep = TipSweep::default();

        for state in [State::PreFluffed, State::Fluffed] {
            for id in self.core.fluff.ids_in_state(state) {
                let expired = self
                    .core
                    .fluff
                    .get(id)
                    .is_some_and(|e| e.stats().height_range.max < next);
                if expired && self.core.fluff.set_state(id, State::Outdated, height).is_ok() {
                    sweep.outdated += 1;
                }
            }
        }

        for id in self.core.fluff.wait_fluff_up_to(height) {
            if self.core.fluff.set_state(id, State::Fluffed, 0).is_ok() {
                if let Some(elem) = self.core.fluff.get(id) {
                    self.core.sink.broadcast_fluff(elem.tx());
                }
                sweep.fluffed += 1;
            }
        }

        if let Some(threshold) = height.checked_sub(self.core.config.limits.outdated_retention) {
            for id in self.core.fluff.outdated_up_to(threshold) {
                if self.core.fluff.delete(id).is_some() {
                    sweep.purged += 1;
                }
            }
        }

        for id in self.stem.ids() {
            let expired = self.stem.get(id).is_some_and(|e| e.stats().height_range.max < next);
            if expired && self.stem.delete(id).is_some() {
                sweep.stem_dropped += 1;
            }
        }

        // Parents come first, so a subtree already dropped is skipped.
        for id in self.core.dependent.ids() {
            let expired = self.core.dependent.get(id).is_some_and(|e| {
                TxContext::summarize(e.tx()).map_or(true, |ctx| ctx.height.max < next)
            });
            if expired {
                sweep.dependent_dropped += self.core.dependent.delete(id).len();
            }
        }

        info!(
            height,
            outdated = sweep.outdated,
            fluffed = sweep.fluffed,
            purged = sweep.purged,
            stem_dropped = sweep.stem_dropped,
            dependent_dropped = sweep.dependent_dropped,
            "new tip"
        );
        sweep
    }

    // --- Block assembly ---

    /// Fluffed transactions for a block of at most `size_budget` bytes, most
    /// profitable first.
    pub fn select_for_block(&self, size_budget: u32) -> Vec<Transaction> {
        self.core
            .fluff
            .select(size_budget)
            .into_iter()
            .filter_map(|id| self.core.fluff.get(id).map(|e| e.tx().clone()))
            .collect()
    }

    /// [`select_for_block`](Self::select_for_block) with the configured budget.
    pub fn block_candidates(&self) -> Vec<Transaction> {
        self.select_for_block(self.core.config.limits.block_size_budget)
    }

    // --- Peer fan-out ---

    /// Next fluffed transaction `peer` has not been given yet, in FIFO
    /// order. The peer's reference moves forward with it.
    pub fn next_for_peer(&mut self, peer: PeerId) -> Option<Transaction> {
        let cursor = self.cursors.entry(peer).or_default();
        let next = self.core.fluff.next_send(cursor.position)?;
        self.core.fluff.acquire(next);
        if let Some(prev) = cursor.position.replace(next) {
            self.core.fluff.release(prev);
        }
        trace!(peer, ?next, "peer cursor advanced");

        let owner = self.core.fluff.send_owner(next)?;
        self.core.fluff.get(owner).map(|e| e.tx().clone())
    }

    /// Forget `peer`, releasing the record its cursor holds.
    pub fn drop_peer(&mut self, peer: PeerId) {
        if let Some(cursor) = self.cursors.remove(&peer) {
            if let Some(pos) = cursor.position {
                self.core.fluff.release(pos);
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.cursors.len()
    }

    // --- Accessors ---

    pub fn fluff(&self) -> &Fluff {
        &self.core.fluff
    }

    pub fn stem(&self) -> &Stem {
        &self.stem
    }

    pub fn dependent(&self) -> &Dependent {
        &self.core.dependent
    }

    pub fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    pub fn tip(&self) -> Height {
        self.core.tip
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let fluff = &self.core.fluff;
        PoolSnapshot {
            tip: self.core.tip,
            fluff: fluff.len(),
            profit: fluff.profit_len(),
            pre_fluffed: fluff.wait_fluff_len(),
            outdated: fluff.outdated_len(),
            send_queue: fluff.send_queue_len(),
            stem: self.stem.len(),
            aggregating: self.stem.aggr_len(),
            dependent: self.core.dependent.len(),
            timer_deadline: self.stem.armed_deadline(),
        }
    }

    /// Empty every pool and forget all peers. The stem timer is cancelled
    /// first.
    pub fn clear(&mut self) {
        self.stem.clear();
        self.cursors.clear();
        self.core.fluff.clear();
        self.core.dependent.clear();
    }

    // --- Internals ---

    /// Admit `tx` as public. A conflicting active element is displaced only
    /// by a strictly more profitable transaction; the loser becomes outdated
    /// at the current tip. Stem elements spending the same outputs are
    /// dropped. Held `PreFluffed` while the next block is below the larger
    /// of its minimum height and `not_before`.
    fn admit_public(&mut self, tx: Transaction, not_before: Height) -> Result<FluffId, PoolError> {
        let ctx = TxContext::summarize(&tx)?;
        let key = tx.key();
        let reserve = self.core.check_context(&tx, &ctx.height, ctx.fee)?;
        let stats = self.core.stats_for(&tx, &ctx, reserve)?;

        if let Some(existing) = self.core.fluff.find_active(&key) {
            let incumbent = self.core.fluff.get(existing).map(|e| *e.profit());
            let challenger = ProfitKey::new(&stats, u64::MAX);
            if incumbent.is_none_or(|inc| challenger.cmp_ratio(&inc) != Ordering::Less) {
                return Err(PoolError::DuplicateConflict(key.to_string()));
            }
            self.core.fluff.set_state(existing, State::Outdated, self.core.tip)?;
            debug!(%existing, %key, "displaced by more profitable conflict");
        }

        self.drop_stem_conflicts(&tx);

        let next = self.core.tip.saturating_add(1);
        let min = ctx.height.min.max(not_before);
        if min > next {
            let wait = min - 1;
            self.core.fluff.add_valid_tx(tx, stats, key, State::PreFluffed, wait)
        } else {
            self.core.add_fluffed(tx, stats)
        }
    }

    /// Merge other aggregating elements into `id`, most profitable first,
    /// until it carries `target` outputs.
    fn aggregate(&mut self, id: StemId, target: usize) {
        let candidates: Vec<StemId> = self.stem.iter_aggr().filter(|&c| c != id).collect();
        for source in candidates {
            if self.stem.get(id).is_none_or(|e| e.tx().outputs.len() >= target) {
                break;
            }
            match self.stem.try_merge(id, source, &mut self.core) {
                Ok(()) => debug!(%id, %source, "aggregated"),
                Err(e) => trace!(%id, %source, %e, "not aggregated"),
            }
        }
    }

    fn drop_stem_conflicts(&mut self, tx: &Transaction) {
        let conflicting: Vec<StemId> = self
            .stem
            .ids()
            .into_iter()
            .filter(|id| self.stem.get(*id).is_some_and(|e| e.tx().overlaps(tx)))
            .collect();
        for id in conflicting {
            self.stem.delete(id);
            debug!(%id, "stem tx superseded by public conflict");
        }
    }
}
