//! Shared test helpers for integration and property tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use petal_core::error::PoolError;
use petal_core::traits::{ContextValidator, PeerSink, StemTimer};
use petal_core::types::*;
use petal_node::{NodeConfig, RelayNode};
use petal_pool::Stats;

/// Output commitment from a seed byte.
pub fn commitment(seed: u8) -> Hash256 {
    Hash256([seed; 32])
}

/// Transaction spending `inputs` into `outputs`, one kernel.
pub fn make_tx(inputs: &[u8], outputs: &[u8], fee: Amount, range: HeightRange) -> Transaction {
    Transaction {
        inputs: inputs.iter().map(|&s| commitment(s)).collect(),
        outputs: outputs.iter().map(|&s| commitment(s)).collect(),
        kernels: vec![TxKernel {
            fee,
            min_height: range.min,
            max_height: range.max,
            bvm_charge: 0,
            nonce: 0,
        }],
        offset: Hash256::ZERO,
    }
}

/// One-in, one-out transaction valid at every height.
pub fn simple_tx(input: u8, output: u8, fee: Amount) -> Transaction {
    make_tx(&[input], &[output], fee, HeightRange::FULL)
}

/// Stats with no reserve and no size correction.
pub fn stats_for(tx: &Transaction) -> Stats {
    let ctx = TxContext::summarize(tx).unwrap();
    Stats::from_context(tx, &ctx, 0, 0).unwrap()
}

/// Hand-driven clock. Records every arm (`Some(timeout)`) and cancel
/// (`None`) so tests can check what the pool asked for.
#[derive(Clone, Default)]
pub struct ManualTimer {
    now: Arc<AtomicU64>,
    log: Arc<Mutex<Vec<Option<u64>>>>,
}

impl ManualTimer {
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<Option<u64>> {
        self.log.lock().clone()
    }
}

impl StemTimer for ManualTimer {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn arm(&mut self, timeout_ms: u64) {
        self.log.lock().push(Some(timeout_ms));
    }

    fn cancel(&mut self) {
        self.log.lock().push(None);
    }
}

/// Accepts everything; the whole fee is reported as reserve.
pub struct AcceptAll;

impl ContextValidator for AcceptAll {
    fn validate_tx_context(
        &self,
        _tx: &Transaction,
        _height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError> {
        Ok(fees)
    }
}

/// Messages a relay node emitted, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Stem(Transaction),
    Fluff(Transaction),
}

/// Sink that queues everything for a test network to deliver.
#[derive(Default)]
pub struct QueueSink {
    queue: Mutex<VecDeque<Outbound>>,
}

impl QueueSink {
    pub fn drain(&self) -> Vec<Outbound> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl PeerSink for QueueSink {
    fn send_stem(&self, tx: &Transaction) {
        self.queue.lock().push_back(Outbound::Stem(tx.clone()));
    }

    fn broadcast_fluff(&self, tx: &Transaction) {
        self.queue.lock().push_back(Outbound::Fluff(tx.clone()));
    }
}

/// A relay node with a manual clock and a queueing sink.
pub struct TestRelay {
    pub node: RelayNode,
    pub sink: Arc<QueueSink>,
    pub clock: ManualTimer,
}

impl TestRelay {
    pub fn new(config: NodeConfig) -> Self {
        let sink = Arc::new(QueueSink::default());
        let clock = ManualTimer::default();
        let node = RelayNode::new(config, Arc::new(AcceptAll), sink.clone(), Box::new(clock.clone()));
        Self { node, sink, clock }
    }

    /// Move the clock forward and fire the stem timer.
    pub fn tick(&mut self, ms: u64) {
        self.clock.advance(ms);
        self.node.on_timer();
    }
}

/// Deterministic config: fixed seed, short timeouts, no size correction.
pub fn relay_config(seed: u64, fluff_probability: u16, aggregation_time_ms: u64) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.rng_seed = Some(seed);
    cfg.dandelion.fluff_probability = fluff_probability;
    cfg.dandelion.aggregation_time_ms = aggregation_time_ms;
    cfg.dandelion.stem_timeout_min_ms = 1_000;
    cfg.dandelion.stem_timeout_max_ms = 2_000;
    cfg.limits.size_correction = 0;
    cfg
}
