//! Speculative dependent transactions.
//!
//! A forest of transactions that spend outputs of other, still unconfirmed
//! transactions. Every element carries the running totals (fee, BVM charge,
//! size, depth) of the path from its root, so the node can cap speculative
//! work and pick the best-paying chain. Parent links are ids resolved
//! through the arena; a parent that is gone is detected, never followed.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use petal_core::constants::{
    DEFAULT_DEPENDENT_MAX_BVM_CHARGE, DEFAULT_DEPENDENT_MAX_DEPTH, DEFAULT_DEPENDENT_MAX_SIZE,
};
use petal_core::error::{PoolError, TransactionError};
use petal_core::types::{Amount, ContextHash, Transaction, TxContext, TxKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of a dependent element. Never reused within one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependentId(u64);

impl DependentId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DependentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep#{}", self.0)
    }
}

/// Resource caps applied to every root-to-leaf chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependentLimits {
    pub max_depth: u32,
    pub max_size: u32,
    pub max_bvm_charge: u32,
}

impl Default for DependentLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_DEPENDENT_MAX_DEPTH,
            max_size: DEFAULT_DEPENDENT_MAX_SIZE,
            max_bvm_charge: DEFAULT_DEPENDENT_MAX_BVM_CHARGE,
        }
    }
}

/// Running totals over a root-to-element path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cumulative {
    pub fee: Amount,
    pub bvm_charge: u32,
    pub size: u32,
    pub depth: u32,
}

impl Cumulative {
    /// `self` extended by one transaction.
    fn extend(&self, fee: Amount, bvm_charge: u32, size: u32) -> Result<Self, TransactionError> {
        Ok(Self {
            fee: self.fee.checked_add(fee).ok_or(TransactionError::FeeOverflow)?,
            bvm_charge: self
                .bvm_charge
                .checked_add(bvm_charge)
                .ok_or(TransactionError::ChargeOverflow)?,
            size: self.size.saturating_add(size),
            depth: self.depth + 1,
        })
    }
}

#[derive(Debug)]
pub struct Element {
    tx: Transaction,
    parent: Option<DependentId>,
    children: BTreeSet<DependentId>,
    own: Cumulative,
    cumulative: Cumulative,
    key: TxKey,
    context: ContextHash,
    fluff: bool,
}

impl Element {
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn parent(&self) -> Option<DependentId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = DependentId> + '_ {
        self.children.iter().copied()
    }

    /// This transaction's own contribution (depth 1).
    pub fn own(&self) -> &Cumulative {
        &self.own
    }

    pub fn cumulative(&self) -> &Cumulative {
        &self.cumulative
    }

    pub fn key(&self) -> &TxKey {
        &self.key
    }

    pub fn context(&self) -> &ContextHash {
        &self.context
    }

    /// Whether this element has been promoted into the fluff pool.
    pub fn is_fluff(&self) -> bool {
        self.fluff
    }
}

/// The dependent pool.
#[derive(Debug, Default)]
pub struct Dependent {
    elements: HashMap<DependentId, Element>,
    txs: BTreeSet<(TxKey, DependentId)>,
    contexts: BTreeSet<(ContextHash, DependentId)>,
    roots: BTreeSet<DependentId>,
    best: Option<DependentId>,
    limits: DependentLimits,
    next_id: u64,
}

impl Dependent {
    pub fn new(limits: DependentLimits) -> Self {
        Self { limits, ..Self::default() }
    }

    pub fn limits(&self) -> &DependentLimits {
        &self.limits
    }

    /// Add `tx` as a child of `parent` (or as a root).
    ///
    /// Rejects a parent that is not live, a key already used by a sibling
    /// or an ancestor, and chains that would exceed the configured limits.
    pub fn add_valid_tx(
        &mut self,
        tx: Transaction,
        ctx: &TxContext,
        key: TxKey,
        context: ContextHash,
        parent: Option<DependentId>,
    ) -> Result<DependentId, PoolError> {
        let base = match parent {
            Some(pid) => {
                let p = self.elements.get(&pid).ok_or(PoolError::DanglingParent(pid.0))?;
                p.cumulative
            }
            None => Cumulative::default(),
        };

        if self.siblings(parent).any(|sid| self.elements.get(&sid).is_some_and(|s| s.key == key))
            || self.ancestors(parent).any(|aid| self.elements.get(&aid).is_some_and(|a| a.key == key))
        {
            return Err(PoolError::DuplicateConflict(key.to_string()));
        }

        let size = u32::try_from(tx.size_netto()?).unwrap_or(u32::MAX);
        let own = Cumulative { fee: ctx.fee, bvm_charge: ctx.bvm_charge, size, depth: 1 };
        let cumulative = base.extend(ctx.fee, ctx.bvm_charge, size)?;
        self.check_limits(&cumulative)?;

        let id = DependentId(self.next_id);
        self.next_id += 1;

        match parent {
            Some(pid) => {
                if let Some(p) = self.elements.get_mut(&pid) {
                    p.children.insert(id);
                }
            }
            None => {
                self.roots.insert(id);
            }
        }
        self.txs.insert((key, id));
        self.contexts.insert((context, id));
        self.elements.insert(
            id,
            Element {
                tx,
                parent,
                children: BTreeSet::new(),
                own,
                cumulative,
                key,
                context,
                fluff: false,
            },
        );

        if self.should_update_best(id) {
            self.best = Some(id);
        }

        debug!(
            %id,
            %key,
            depth = cumulative.depth,
            fee = cumulative.fee,
            size = cumulative.size,
            "dependent: added"
        );
        Ok(id)
    }

    /// Remove `id` and every descendant. Returns the removed ids, `id` first.
    pub fn delete(&mut self, id: DependentId) -> Vec<DependentId> {
        let Some(parent) = self.elements.get(&id).map(|e| e.parent) else {
            return Vec::new();
        };
        match parent {
            Some(pid) => {
                if let Some(p) = self.elements.get_mut(&pid) {
                    p.children.remove(&id);
                }
            }
            None => {
                self.roots.remove(&id);
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(elem) = self.elements.remove(&next) else {
                continue;
            };
            self.txs.remove(&(elem.key, next));
            self.contexts.remove(&(elem.context, next));
            stack.extend(elem.children.iter().rev());
            removed.push(next);
        }

        if self.best.is_some_and(|b| !self.elements.contains_key(&b)) {
            self.recompute_best();
        }

        debug!(%id, removed = removed.len(), "dependent: deleted subtree");
        removed
    }

    /// Remove everything and reset `best`.
    pub fn clear(&mut self) {
        self.elements.clear();
        self.txs.clear();
        self.contexts.clear();
        self.roots.clear();
        self.best = None;
    }

    /// Mark `id` as promoted into the fluff pool.
    pub fn set_fluff(&mut self, id: DependentId) -> Result<(), PoolError> {
        let elem = self.elements.get_mut(&id).ok_or(PoolError::UnknownElement(id.0))?;
        elem.fluff = true;
        Ok(())
    }

    // --- Queries ---

    pub fn get(&self, id: DependentId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn best(&self) -> Option<DependentId> {
        self.best
    }

    /// Ids from the root down to `id`, inclusive. Empty if `id` is unknown.
    pub fn chain(&self, id: DependentId) -> Vec<DependentId> {
        if !self.elements.contains_key(&id) {
            return Vec::new();
        }
        let mut path: Vec<DependentId> = self.ancestors(Some(id)).collect();
        path.reverse();
        path
    }

    pub fn find_by_context(&self, context: &ContextHash) -> Option<DependentId> {
        self.contexts
            .range((*context, DependentId(0))..=(*context, DependentId(u64::MAX)))
            .next()
            .map(|(_, id)| *id)
    }

    pub fn find_by_key(&self, key: &TxKey) -> Vec<DependentId> {
        self.txs
            .range((*key, DependentId(0))..=(*key, DependentId(u64::MAX)))
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn roots(&self) -> impl Iterator<Item = DependentId> + '_ {
        self.roots.iter().copied()
    }

    /// Every live id, oldest first. A parent always precedes its children.
    pub fn ids(&self) -> Vec<DependentId> {
        let mut ids: Vec<DependentId> = self.elements.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn key_index_len(&self) -> usize {
        self.txs.len()
    }

    pub fn context_index_len(&self) -> usize {
        self.contexts.len()
    }

    // --- Internals ---

    /// Walk from `start` up to its root, `start` included.
    fn ancestors(&self, start: Option<DependentId>) -> impl Iterator<Item = DependentId> + '_ {
        std::iter::successors(start, |id| self.elements.get(id).and_then(|e| e.parent))
    }

    fn siblings(&self, parent: Option<DependentId>) -> Box<dyn Iterator<Item = DependentId> + '_> {
        match parent.and_then(|pid| self.elements.get(&pid)) {
            Some(p) => Box::new(p.children.iter().copied()),
            None => Box::new(self.roots.iter().copied()),
        }
    }

    fn check_limits(&self, c: &Cumulative) -> Result<(), PoolError> {
        let checks = [
            ("depth", c.depth, self.limits.max_depth),
            ("size", c.size, self.limits.max_size),
            ("bvm charge", c.bvm_charge, self.limits.max_bvm_charge),
        ];
        for (what, value, max) in checks {
            if value > max {
                return Err(PoolError::LimitExceeded {
                    what,
                    value: u64::from(value),
                    max: u64::from(max),
                });
            }
        }
        Ok(())
    }

    /// Whether `candidate` should replace the current best.
    fn should_update_best(&self, candidate: DependentId) -> bool {
        let Some(cand) = self.elements.get(&candidate) else {
            return false;
        };
        match self.best.and_then(|b| self.elements.get(&b)) {
            None => true,
            Some(best) => rank(&cand.cumulative, &best.cumulative) == Ordering::Greater,
        }
    }

    fn recompute_best(&mut self) {
        self.best = None;
        let mut ids: Vec<DependentId> = self.elements.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if self.should_update_best(id) {
                self.best = Some(id);
            }
        }
    }
}

/// Selection priority of a chain ending at an element. `Greater` is better:
/// higher fee per byte, then shallower, then higher total fee.
fn rank(a: &Cumulative, b: &Cumulative) -> Ordering {
    let lhs = u128::from(a.fee) * u128::from(b.size.max(1));
    let rhs = u128::from(b.fee) * u128::from(a.size.max(1));
    lhs.cmp(&rhs)
        .then(b.depth.cmp(&a.depth))
        .then(a.fee.cmp(&b.fee))
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_core::types::{Hash256, TxKernel};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn make_tx(input: u8, fee: Amount, charge: u32) -> Transaction {
        Transaction {
            inputs: vec![Hash256([input; 32])],
            outputs: vec![Hash256([input.wrapping_add(100); 32])],
            kernels: vec![TxKernel {
                fee,
                min_height: 0,
                max_height: u64::MAX,
                bvm_charge: charge,
                nonce: 0,
            }],
            offset: Hash256::ZERO,
        }
    }

    fn add(
        pool: &mut Dependent,
        input: u8,
        fee: Amount,
        parent: Option<DependentId>,
    ) -> Result<DependentId, PoolError> {
        add_charged(pool, input, fee, 0, parent)
    }

    fn add_charged(
        pool: &mut Dependent,
        input: u8,
        fee: Amount,
        charge: u32,
        parent: Option<DependentId>,
    ) -> Result<DependentId, PoolError> {
        let tx = make_tx(input, fee, charge);
        let ctx = TxContext::summarize(&tx).unwrap();
        let key = tx.key();
        let context = Hash256([input ^ 0x5a; 32]);
        pool.add_valid_tx(tx, &ctx, key, context, parent)
    }

    fn assert_cumulative(pool: &Dependent) {
        for id in pool.elements.keys() {
            let e = pool.get(*id).unwrap();
            let base = e
                .parent()
                .map(|p| *pool.get(p).unwrap().cumulative())
                .unwrap_or_default();
            assert_eq!(e.cumulative().fee, base.fee + e.own().fee);
            assert_eq!(e.cumulative().size, base.size + e.own().size);
            assert_eq!(e.cumulative().bvm_charge, base.bvm_charge + e.own().bvm_charge);
            assert_eq!(e.cumulative().depth, base.depth + 1);
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    #[test]
    fn root_has_depth_one() {
        let mut pool = Dependent::default();
        let r = add(&mut pool, 1, 100, None).unwrap();
        let e = pool.get(r).unwrap();
        assert_eq!(e.cumulative().depth, 1);
        assert_eq!(e.cumulative().fee, 100);
        assert_eq!(e.parent(), None);
        assert_eq!(pool.roots().collect::<Vec<_>>(), vec![r]);
    }

    #[test]
    fn chain_accumulates() {
        let mut pool = Dependent::default();
        let a = add_charged(&mut pool, 1, 100, 10, None).unwrap();
        let b = add_charged(&mut pool, 2, 50, 20, Some(a)).unwrap();
        let c = add_charged(&mut pool, 3, 25, 30, Some(b)).unwrap();

        let e = pool.get(c).unwrap();
        assert_eq!(e.cumulative().fee, 175);
        assert_eq!(e.cumulative().bvm_charge, 60);
        assert_eq!(e.cumulative().depth, 3);
        assert_eq!(pool.chain(c), vec![a, b, c]);
        assert_cumulative(&pool);
    }

    #[test]
    fn dangling_parent_rejected() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 100, None).unwrap();
        pool.delete(a);
        let err = add(&mut pool, 2, 100, Some(a)).unwrap_err();
        assert_eq!(err, PoolError::DanglingParent(a.as_u64()));
        assert!(pool.is_empty());
    }

    #[test]
    fn sibling_conflict_rejected() {
        let mut pool = Dependent::default();
        let root = add(&mut pool, 1, 100, None).unwrap();
        add(&mut pool, 2, 50, Some(root)).unwrap();
        let err = add(&mut pool, 2, 80, Some(root)).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateConflict(_)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn root_conflict_rejected() {
        let mut pool = Dependent::default();
        add(&mut pool, 1, 100, None).unwrap();
        assert!(matches!(add(&mut pool, 1, 90, None), Err(PoolError::DuplicateConflict(_))));
    }

    #[test]
    fn ancestor_conflict_rejected() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 100, None).unwrap();
        let b = add(&mut pool, 2, 100, Some(a)).unwrap();
        assert!(matches!(add(&mut pool, 1, 100, Some(b)), Err(PoolError::DuplicateConflict(_))));
    }

    #[test]
    fn same_key_in_other_branch_allowed() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 100, None).unwrap();
        let b = add(&mut pool, 2, 100, None).unwrap();
        add(&mut pool, 3, 10, Some(a)).unwrap();
        add(&mut pool, 3, 10, Some(b)).unwrap();
        let key = make_tx(3, 10, 0).key();
        assert_eq!(pool.find_by_key(&key).len(), 2);
    }

    #[test]
    fn depth_limit() {
        let mut pool = Dependent::new(DependentLimits { max_depth: 2, ..DependentLimits::default() });
        let a = add(&mut pool, 1, 100, None).unwrap();
        let b = add(&mut pool, 2, 100, Some(a)).unwrap();
        let err = add(&mut pool, 3, 100, Some(b)).unwrap_err();
        assert_eq!(err, PoolError::LimitExceeded { what: "depth", value: 3, max: 2 });
    }

    #[test]
    fn charge_limit() {
        let mut pool =
            Dependent::new(DependentLimits { max_bvm_charge: 100, ..DependentLimits::default() });
        let a = add_charged(&mut pool, 1, 10, 60, None).unwrap();
        let err = add_charged(&mut pool, 2, 10, 60, Some(a)).unwrap_err();
        assert!(matches!(err, PoolError::LimitExceeded { what: "bvm charge", .. }));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn size_limit() {
        let mut pool = Dependent::new(DependentLimits { max_size: 1, ..DependentLimits::default() });
        assert!(matches!(
            add(&mut pool, 1, 10, None),
            Err(PoolError::LimitExceeded { what: "size", .. })
        ));
    }

    // ------------------------------------------------------------------
    // Best selection
    // ------------------------------------------------------------------

    #[test]
    fn best_follows_fee_rate() {
        let mut pool = Dependent::default();
        let poor = add(&mut pool, 1, 10, None).unwrap();
        assert_eq!(pool.best(), Some(poor));
        let rich = add(&mut pool, 2, 1_000, None).unwrap();
        assert_eq!(pool.best(), Some(rich));
        add(&mut pool, 3, 20, None).unwrap();
        assert_eq!(pool.best(), Some(rich));
    }

    #[test]
    fn cheap_child_does_not_displace_parent() {
        let mut pool = Dependent::default();
        let root = add(&mut pool, 1, 1_000, None).unwrap();
        add(&mut pool, 2, 1, Some(root)).unwrap();
        assert_eq!(pool.best(), Some(root));
    }

    #[test]
    fn rich_child_takes_over() {
        let mut pool = Dependent::default();
        let root = add(&mut pool, 1, 10, None).unwrap();
        let child = add(&mut pool, 2, 10_000, Some(root)).unwrap();
        assert_eq!(pool.best(), Some(child));
        assert_eq!(pool.chain(child), vec![root, child]);
    }

    #[test]
    fn rank_prefers_shallower_then_fee() {
        let a = Cumulative { fee: 100, bvm_charge: 0, size: 100, depth: 1 };
        let b = Cumulative { fee: 100, bvm_charge: 0, size: 100, depth: 2 };
        assert_eq!(rank(&a, &b), Ordering::Greater);

        let c = Cumulative { fee: 200, bvm_charge: 0, size: 200, depth: 1 };
        assert_eq!(rank(&c, &a), Ordering::Greater);
        assert_eq!(rank(&a, &a), Ordering::Equal);
    }

    #[test]
    fn deleting_best_recomputes() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 50, None).unwrap();
        let b = add(&mut pool, 2, 500, None).unwrap();
        assert_eq!(pool.best(), Some(b));
        pool.delete(b);
        assert_eq!(pool.best(), Some(a));
        pool.delete(a);
        assert_eq!(pool.best(), None);
    }

    #[test]
    fn ids_list_parents_first() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 100, None).unwrap();
        let b = add(&mut pool, 2, 100, Some(a)).unwrap();
        let c = add(&mut pool, 3, 100, None).unwrap();
        let d = add(&mut pool, 4, 100, Some(b)).unwrap();
        assert_eq!(pool.ids(), vec![a, b, c, d]);

        pool.delete(b);
        assert_eq!(pool.ids(), vec![a, c]);
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    #[test]
    fn delete_removes_subtree() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 100, None).unwrap();
        let b = add(&mut pool, 2, 100, Some(a)).unwrap();
        let c = add(&mut pool, 3, 100, Some(b)).unwrap();
        let d = add(&mut pool, 4, 100, Some(a)).unwrap();
        let other = add(&mut pool, 5, 100, None).unwrap();

        let removed = pool.delete(b);
        assert_eq!(removed, vec![b, c]);
        assert!(pool.get(c).is_none());
        assert_eq!(pool.get(a).unwrap().children().collect::<Vec<_>>(), vec![d]);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.key_index_len(), 3);
        assert_eq!(pool.context_index_len(), 3);
        assert!(pool.get(other).is_some());
        assert_cumulative(&pool);
    }

    #[test]
    fn delete_unknown_is_noop() {
        let mut pool = Dependent::default();
        assert!(pool.delete(DependentId(9)).is_empty());
    }

    #[test]
    fn clear_resets_everything() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 1, 100, None).unwrap();
        add(&mut pool, 2, 100, Some(a)).unwrap();
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.best(), None);
        assert_eq!(pool.key_index_len(), 0);
        assert_eq!(pool.context_index_len(), 0);
        assert_eq!(pool.roots().count(), 0);
        pool.clear();
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    #[test]
    fn find_by_context_and_fluff_flag() {
        let mut pool = Dependent::default();
        let a = add(&mut pool, 7, 100, None).unwrap();
        assert_eq!(pool.find_by_context(&Hash256([7 ^ 0x5a; 32])), Some(a));
        assert_eq!(pool.find_by_context(&Hash256([0; 32])), None);

        assert!(!pool.get(a).unwrap().is_fluff());
        pool.set_fluff(a).unwrap();
        assert!(pool.get(a).unwrap().is_fluff());
        assert_eq!(pool.set_fluff(DependentId(99)), Err(PoolError::UnknownElement(99)));
    }
}
