//! Public (fluff-phase) transaction pool.
//!
//! Every element lives in one arena and is referenced from up to four
//! indexes plus the send queue:
//! - conflict key multiset: always
//! - profit order: only while `Fluffed` (mining candidates)
//! - wait-to-fluff list, keyed by height: only while `PreFluffed`
//! - outdated-history list, keyed by height: only while `Outdated`
//!
//! Which indexes an element belongs to is a pure function of its state,
//! [`Features::get`]. [`Fluff::set_state`] diffs the old and new feature
//! vectors and touches exactly the memberships that change.
//!
//! Fluffed elements also own a record in the FIFO send queue. Peer send
//! tasks walk the queue and take references on records; a record is
//! unlinked only once its owner and every peer have let go.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;

use petal_core::error::PoolError;
use petal_core::types::{Height, Transaction, TxKey};
use tracing::{debug, trace};

use crate::profit::ProfitKey;
use crate::stats::Stats;

/// Identity of a fluff element. Never reused within one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FluffId(u64);

impl fmt::Display for FluffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fluff#{}", self.0)
    }
}

/// Identity of a send-queue record. Ascending ids are FIFO order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(u64);

/// Lifecycle state of a fluff element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Held back until its wait height: reserves its conflict key but is
    /// neither broadcast nor offered for blocks.
    PreFluffed,
    /// Public: broadcast to peers and eligible for blocks.
    Fluffed,
    /// No longer valid at the tip; kept until buried deep enough to drop.
    Outdated,
}

impl State {
    pub const ALL: [State; 3] = [State::PreFluffed, State::Fluffed, State::Outdated];

    /// Whether `self -> next` is a legal transition. Same-state is legal.
    ///
    /// `Outdated` is absorbing and a public transaction cannot be taken
    /// back, so only the forward edges are allowed.
    pub fn can_transition_to(self, next: State) -> bool {
        matches!(
            (self, next),
            (State::PreFluffed, _)
                | (State::Fluffed, State::Fluffed)
                | (State::Fluffed, State::Outdated)
                | (State::Outdated, State::Outdated)
        )
    }
}

/// Index memberships implied by a [`State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Features {
    pub send_and_profit: bool,
    pub tx_set: bool,
    pub wait_fluff: bool,
    pub outdated: bool,
}

impl Features {
    pub fn get(state: State) -> Self {
        match state {
            State::PreFluffed => Self { tx_set: true, wait_fluff: true, ..Self::default() },
            State::Fluffed => Self { tx_set: true, send_and_profit: true, ..Self::default() },
            State::Outdated => Self { tx_set: true, outdated: true, ..Self::default() },
        }
    }
}

/// A transaction held by the fluff pool.
#[derive(Debug)]
pub struct Element {
    tx: Transaction,
    stats: Stats,
    key: TxKey,
    state: State,
    profit: ProfitKey,
    hist_height: Height,
    send: Option<SendId>,
}

impl Element {
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn key(&self) -> &TxKey {
        &self.key
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn profit(&self) -> &ProfitKey {
        &self.profit
    }

    /// Height of the history list entry (wait height or outdated height).
    /// Meaningless while `Fluffed`.
    pub fn hist_height(&self) -> Height {
        self.hist_height
    }

    pub fn send(&self) -> Option<SendId> {
        self.send
    }

    /// Give up the owned transaction.
    pub fn into_tx(self) -> Transaction {
        self.tx
    }
}

#[derive(Debug)]
struct SendRecord {
    owner: Option<FluffId>,
    refs: u32,
}

/// The public transaction pool.
#[derive(Debug, Default)]
pub struct Fluff {
    elements: HashMap<FluffId, Element>,
    txs: BTreeSet<(TxKey, FluffId)>,
    profit: BTreeMap<ProfitKey, FluffId>,
    wait_fluff: BTreeSet<(Height, FluffId)>,
    outdated: BTreeSet<(Height, FluffId)>,
    send_queue: BTreeMap<SendId, SendRecord>,
    next_id: u64,
    next_send: u64,
}

impl Fluff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated transaction in `state`.
    ///
    /// `hist_height` keys the history list the state implies (wait height
    /// for `PreFluffed`, outdated height for `Outdated`) and is ignored for
    /// `Fluffed`.
    ///
    /// Fails with [`PoolError::DuplicateConflict`] when a non-outdated
    /// element with the same key is present; resolving the conflict is the
    /// caller's policy.
    pub fn add_valid_tx(
        &mut self,
        tx: Transaction,
        stats: Stats,
        key: TxKey,
        state: State,
        hist_height: Height,
    ) -> Result<FluffId, PoolError> {
        if state != State::Outdated && self.find_active(&key).is_some() {
            return Err(PoolError::DuplicateConflict(key.to_string()));
        }

        let id = FluffId(self.next_id);
        self.next_id += 1;

        self.elements.insert(
            id,
            Element {
                tx,
                stats,
                key,
                state,
                profit: ProfitKey::new(&stats, id.0),
                hist_height,
                send: None,
            },
        );
        self.apply_features(id, Features::default(), Features::get(state), None);

        debug!(%id, %key, ?state, fee = stats.fee, size = stats.size, "fluff: added");
        Ok(id)
    }

    /// Move an element to `state`.
    ///
    /// No-op when the state is unchanged. `hist_height` is recorded when
    /// the new state puts the element in a history list.
    ///
    /// # Panics
    ///
    /// On an illegal transition (see [`State::can_transition_to`]); that is
    /// a caller bug and continuing would corrupt the indexes.
    pub fn set_state(
        &mut self,
        id: FluffId,
        state: State,
        hist_height: Height,
    ) -> Result<(), PoolError> {
        let elem = self.elements.get_mut(&id).ok_or(PoolError::UnknownElement(id.0))?;
        let old = elem.state;
        if old == state {
            return Ok(());
        }
        assert!(
            old.can_transition_to(state),
            "illegal fluff transition {old:?} -> {state:?} for {id}"
        );

        let old_height = elem.hist_height;
        elem.state = state;
        elem.hist_height = hist_height;
        self.apply_features(id, Features::get(old), Features::get(state), Some(old_height));

        trace!(%id, ?old, new = ?state, hist_height, "fluff: state changed");
        Ok(())
    }

    /// Remove an element from every index it is in and release its send
    /// record. Returns the element, or `None` for an unknown id.
    pub fn delete(&mut self, id: FluffId) -> Option<Element> {
        let state = self.elements.get(&id)?.state;
        self.apply_features(id, Features::get(state), Features::default(), None);
        let elem = self.elements.remove(&id)?;
        trace!(%id, "fluff: deleted");
        Some(elem)
    }

    /// Drop one reference on a send record; unlink it at zero.
    pub fn release(&mut self, send: SendId) {
        let Some(record) = self.send_queue.get_mut(&send) else {
            return;
        };
        record.refs = record.refs.saturating_sub(1);
        if record.refs == 0 {
            self.send_queue.remove(&send);
        }
    }

    /// Take a reference on a send record for a peer task.
    ///
    /// Returns `false` if the record is already gone.
    pub fn acquire(&mut self, send: SendId) -> bool {
        match self.send_queue.get_mut(&send) {
            Some(record) => {
                record.refs += 1;
                true
            }
            None => false,
        }
    }

    /// First live record after `after` (or from the front), in FIFO order.
    ///
    /// Records whose owner has left the fluffed state are skipped.
    pub fn next_send(&self, after: Option<SendId>) -> Option<SendId> {
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.send_queue
            .range((lower, Bound::Unbounded))
            .find(|(_, record)| record.owner.is_some())
            .map(|(id, _)| *id)
    }

    /// Element a send record belongs to, if it still has one.
    pub fn send_owner(&self, send: SendId) -> Option<FluffId> {
        self.send_queue.get(&send).and_then(|record| record.owner)
    }

    /// Delete every element and drop the whole send queue, including
    /// records still referenced by peers.
    pub fn clear(&mut self) {
        self.elements.clear();
        self.txs.clear();
        self.profit.clear();
        self.wait_fluff.clear();
        self.outdated.clear();
        self.send_queue.clear();
    }

    // --- Queries ---

    pub fn get(&self, id: FluffId) -> Option<&Element> {
        self.elements.get(&id)
    }

    /// The non-outdated element holding `key`, if any.
    pub fn find_active(&self, key: &TxKey) -> Option<FluffId> {
        self.find_all(key)
            .into_iter()
            .find(|id| self.elements.get(id).is_some_and(|e| e.state != State::Outdated))
    }

    /// All elements (any state) holding `key`, oldest first.
    pub fn find_all(&self, key: &TxKey) -> Vec<FluffId> {
        let lo = (*key, FluffId(0));
        let hi = (*key, FluffId(u64::MAX));
        self.txs.range(lo..=hi).map(|(_, id)| *id).collect()
    }

    /// Fluffed elements, most profitable first.
    pub fn iter_profit(&self) -> impl Iterator<Item = (FluffId, &Element)> {
        self.profit
            .values()
            .filter_map(|id| self.elements.get(id).map(|e| (*id, e)))
    }

    /// Greedy profit-order fill of a block with `size_budget` bytes.
    ///
    /// Elements too large for the remaining space are skipped so smaller
    /// ones may still fit.
    pub fn select(&self, size_budget: u32) -> Vec<FluffId> {
        let mut selected = Vec::new();
        let mut remaining = size_budget;

        for (id, elem) in self.iter_profit() {
            if remaining == 0 {
                break;
            }
            if elem.stats.size <= remaining {
                selected.push(id);
                remaining -= elem.stats.size;
            }
        }

        selected
    }

    /// Outdated elements whose outdated height is at most `height`, lowest
    /// height first.
    pub fn outdated_up_to(&self, height: Height) -> Vec<FluffId> {
        Self::hist_up_to(&self.outdated, height)
    }

    /// Pre-fluffed elements whose wait height is at most `height`, lowest
    /// height first.
    pub fn wait_fluff_up_to(&self, height: Height) -> Vec<FluffId> {
        Self::hist_up_to(&self.wait_fluff, height)
    }

    /// Ids of all elements in the given state.
    pub fn ids_in_state(&self, state: State) -> Vec<FluffId> {
        let mut ids: Vec<FluffId> = self
            .elements
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Index memberships an element actually has, read from the indexes
    /// themselves rather than from its state.
    pub fn memberships(&self, id: FluffId) -> Option<Features> {
        let elem = self.elements.get(&id)?;
        Some(Features {
            send_and_profit: self.profit.contains_key(&elem.profit)
                && elem.send.is_some_and(|s| self.send_owner(s) == Some(id)),
            tx_set: self.txs.contains(&(elem.key, id)),
            wait_fluff: self.wait_fluff.contains(&(elem.hist_height, id)),
            outdated: self.outdated.contains(&(elem.hist_height, id)),
        })
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn tx_set_len(&self) -> usize {
        self.txs.len()
    }

    pub fn profit_len(&self) -> usize {
        self.profit.len()
    }

    pub fn wait_fluff_len(&self) -> usize {
        self.wait_fluff.len()
    }

    pub fn outdated_len(&self) -> usize {
        self.outdated.len()
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    // --- Internals ---

    /// Move `id` from the memberships of `f0` to those of `f`.
    ///
    /// History lists are left using `old_height` (defaults to the current
    /// height) and entered using the current one.
    fn apply_features(&mut self, id: FluffId, f0: Features, f: Features, old_height: Option<Height>) {
        let Some(elem) = self.elements.get_mut(&id) else {
            return;
        };
        let key = elem.key;
        let profit = elem.profit;
        let height = elem.hist_height;
        let old_height = old_height.unwrap_or(height);

        if f0.tx_set != f.tx_set {
            if f.tx_set {
                self.txs.insert((key, id));
            } else {
                self.txs.remove(&(key, id));
            }
        }

        if f0.send_and_profit != f.send_and_profit {
            if f.send_and_profit {
                let send = SendId(self.next_send);
                self.next_send += 1;
                self.send_queue.insert(send, SendRecord { owner: Some(id), refs: 1 });
                elem.send = Some(send);
                self.profit.insert(profit, id);
            } else {
                self.profit.remove(&profit);
                if let Some(send) = elem.send.take() {
                    if let Some(record) = self.send_queue.get_mut(&send) {
                        record.owner = None;
                    }
                    self.release(send);
                }
            }
        }

        Self::set_hist(&mut self.wait_fluff, id, f0.wait_fluff, f.wait_fluff, old_height, height);
        Self::set_hist(&mut self.outdated, id, f0.outdated, f.outdated, old_height, height);
    }

    fn set_hist(
        list: &mut BTreeSet<(Height, FluffId)>,
        id: FluffId,
        was: bool,
        is: bool,
        old_height: Height,
        height: Height,
    ) {
        if was == is {
            return;
        }
        if is {
            list.insert((height, id));
        } else {
            list.remove(&(old_height, id));
        }
    }

    fn hist_up_to(list: &BTreeSet<(Height, FluffId)>, height: Height) -> Vec<FluffId> {
        list.range(..=(height, FluffId(u64::MAX))).map(|(_, id)| *id).collect()
    }
}
