//! Async owner of a [`RelayNode`].
//!
//! Uses a command-channel architecture: [`PoolHandle`] sends [`PoolEvent`]s
//! over an unbounded mpsc channel to one background tokio task, which
//! applies them to the relay in arrival order. The stem timer posts into
//! the same channel, so timer callbacks are serialized with everything
//! else. The relay sits behind a `parking_lot::Mutex` that the loop holds
//! while applying an event; handle queries and peer cursor moves take the
//! same lock and so never interleave with a half-applied event.

use std::sync::Arc;

use parking_lot::Mutex;
use petal_core::traits::{ContextValidator, PeerSink};
use petal_core::types::{ContextHash, Height, Transaction};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::PetalError;
use crate::relay::{PeerId, PoolSnapshot, RelayNode};
use crate::timer::TokioTimer;

/// Inputs to the pool service loop.
#[derive(Debug)]
pub enum PoolEvent {
    /// Stem-phase transaction from the wallet or a stem peer.
    StemTx(Transaction),
    /// Publicly broadcast transaction.
    FluffTx(Transaction),
    /// Speculative transaction chained off `parent`'s context.
    DependentTx {
        tx: Transaction,
        parent: Option<ContextHash>,
        context: ContextHash,
    },
    /// Publish the best dependent chain.
    PromoteBest,
    /// A new block became the tip.
    NewTip(Height),
    /// The stem timer fired.
    TimerFired,
    /// Reply once every earlier event has been applied.
    Flush(oneshot::Sender<()>),
    /// Stop the loop and clear the pools.
    Shutdown,
}

/// Cloneable handle to a running pool service.
#[derive(Clone)]
pub struct PoolHandle {
    events: mpsc::UnboundedSender<PoolEvent>,
    relay: Arc<Mutex<RelayNode>>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("running", &!self.events.is_closed())
            .finish()
    }
}

impl PoolHandle {
    fn send(&self, event: PoolEvent) -> Result<(), PetalError> {
        self.events.send(event).map_err(|_| PetalError::ServiceStopped)
    }

    pub fn submit_stem(&self, tx: Transaction) -> Result<(), PetalError> {
        self.send(PoolEvent::StemTx(tx))
    }

    pub fn submit_fluff(&self, tx: Transaction) -> Result<(), PetalError> {
        self.send(PoolEvent::FluffTx(tx))
    }

    pub fn submit_dependent(
        &self,
        tx: Transaction,
        parent: Option<ContextHash>,
        context: ContextHash,
    ) -> Result<(), PetalError> {
        self.send(PoolEvent::DependentTx { tx, parent, context })
    }

    pub fn promote_best(&self) -> Result<(), PetalError> {
        self.send(PoolEvent::PromoteBest)
    }

    pub fn new_tip(&self, height: Height) -> Result<(), PetalError> {
        self.send(PoolEvent::NewTip(height))
    }

    /// Wait until every event sent before this call has been applied.
    pub async fn flush(&self) -> Result<(), PetalError> {
        let (done, wait) = oneshot::channel();
        self.send(PoolEvent::Flush(done))?;
        wait.await.map_err(|_| PetalError::ServiceStopped)
    }

    pub fn shutdown(&self) -> Result<(), PetalError> {
        self.send(PoolEvent::Shutdown)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.relay.lock().snapshot()
    }

    pub fn block_candidates(&self) -> Vec<Transaction> {
        self.relay.lock().block_candidates()
    }

    pub fn select_for_block(&self, size_budget: u32) -> Vec<Transaction> {
        self.relay.lock().select_for_block(size_budget)
    }

    pub fn next_for_peer(&self, peer: PeerId) -> Option<Transaction> {
        self.relay.lock().next_for_peer(peer)
    }

    pub fn drop_peer(&self, peer: PeerId) {
        self.relay.lock().drop_peer(peer);
    }
}

/// Starts the service task.
pub struct PoolService;

impl PoolService {
    /// Validate `config`, build the relay with a tokio-backed stem timer,
    /// and spawn the event loop on the current runtime.
    pub fn spawn(
        config: NodeConfig,
        validator: Arc<dyn ContextValidator>,
        sink: Arc<dyn PeerSink>,
    ) -> Result<(PoolHandle, JoinHandle<()>), PetalError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PetalError::NoRuntime)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timer = TokioTimer::new(runtime.clone(), events_tx.clone());
        let relay = Arc::new(Mutex::new(RelayNode::new(config, validator, sink, Box::new(timer))));

        let task = runtime.spawn(run(relay.clone(), events_rx));
        Ok((PoolHandle { events: events_tx, relay }, task))
    }
}

async fn run(relay: Arc<Mutex<RelayNode>>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    info!("pool service started");
    while let Some(event) = events.recv().await {
        match event {
            PoolEvent::Shutdown => break,
            PoolEvent::Flush(done) => {
                let _ = done.send(());
            }
            other => apply(&mut relay.lock(), other),
        }
    }
    events.close();
    relay.lock().clear();
    info!("pool service stopped");
}

fn apply(relay: &mut RelayNode, event: PoolEvent) {
    match event {
        PoolEvent::StemTx(tx) => match relay.on_stem_tx(tx) {
            Ok(id) => debug!(%id, "stem tx accepted"),
            Err(e) => debug!(%e, "stem tx rejected"),
        },
        PoolEvent::FluffTx(tx) => match relay.on_fluff_tx(tx) {
            Ok(id) => debug!(%id, "fluff tx accepted"),
            Err(e) => debug!(%e, "fluff tx rejected"),
        },
        PoolEvent::DependentTx { tx, parent, context } => {
            match relay.on_dependent_tx(tx, parent, context) {
                Ok(id) => debug!(%id, "dependent tx accepted"),
                Err(e) => debug!(%e, "dependent tx rejected"),
            }
        }
        PoolEvent::PromoteBest => {
            if let Err(e) = relay.promote_best_chain() {
                warn!(%e, "dependent promotion stopped");
            }
        }
        PoolEvent::NewTip(height) => {
            relay.on_new_tip(height);
        }
        PoolEvent::TimerFired => relay.on_timer(),
        PoolEvent::Flush(_) | PoolEvent::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_core::error::PoolError;
    use petal_core::types::{Amount, Hash256, HeightRange, TxKernel};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSink {
        stems: Mutex<usize>,
        fluffs: Mutex<usize>,
    }

    impl PeerSink for CountingSink {
        fn send_stem(&self, _tx: &Transaction) {
            *self.stems.lock() += 1;
        }
        fn broadcast_fluff(&self, _tx: &Transaction) {
            *self.fluffs.lock() += 1;
        }
    }

    struct AcceptAll;

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

    fn make_tx(input: u8, fee: Amount, max: Height) -> Transaction {
        Transaction {
            inputs: vec![Hash256([input; 32])],
            outputs: vec![Hash256([input.wrapping_add(1); 32])],
            kernels: vec![TxKernel { fee, min_height: 0, max_height: max, bvm_charge: 0, nonce: 0 }],
            offset: Hash256::ZERO,
        }
    }

    fn config() -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.rng_seed = Some(3);
        cfg.dandelion.fluff_probability = 0;
        cfg.dandelion.aggregation_time_ms = 0;
        cfg.dandelion.stem_timeout_min_ms = 100;
        cfg.dandelion.stem_timeout_max_ms = 200;
        cfg
    }

    fn start(cfg: NodeConfig) -> (PoolHandle, JoinHandle<()>, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        let (handle, task) = PoolService::spawn(cfg, Arc::new(AcceptAll), sink.clone()).unwrap();
        (handle, task, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn embargo_timer_fluffs_through_loop() {
        let (handle, _task, sink) = start(config());
        handle.submit_stem(make_tx(1, 100, 1_000)).unwrap();
        handle.flush().await.unwrap();

        let snap = handle.snapshot();
        assert_eq!(snap.stem, 1);
        assert!(snap.timer_deadline.is_some());
        assert_eq!(*sink.stems.lock(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.flush().await.unwrap();

        let snap = handle.snapshot();
        assert_eq!(snap.stem, 0);
        assert_eq!(snap.profit, 1);
        assert_eq!(snap.timer_deadline, None);
        assert_eq!(*sink.fluffs.lock(), 1);
    }

    #[tokio::test]
    async fn tip_and_block_candidates() {
        let (handle, _task, _sink) = start(config());
        handle.submit_fluff(make_tx(1, 100, 10)).unwrap();
        handle.submit_fluff(make_tx(2, 300, 1_000)).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(handle.block_candidates().len(), 2);

        handle.new_tip(10).unwrap();
        handle.flush().await.unwrap();
        let snap = handle.snapshot();
        assert_eq!(snap.tip, 10);
        assert_eq!(snap.outdated, 1);
        let candidates = handle.block_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kernels[0].fee, 300);
    }

    #[tokio::test]
    async fn dependent_promotion_through_loop() {
        let (handle, _task, sink) = start(config());
        let root = Hash256([1; 32]);
        handle.submit_dependent(make_tx(1, 100, 1_000), None, root).unwrap();
        handle.submit_dependent(make_tx(3, 500, 1_000), Some(root), Hash256([2; 32])).unwrap();
        handle.promote_best().unwrap();
        handle.flush().await.unwrap();

        let snap = handle.snapshot();
        assert_eq!(snap.dependent, 2);
        assert_eq!(snap.profit, 2);
        assert_eq!(*sink.fluffs.lock(), 2);
    }

    #[tokio::test]
    async fn peers_read_through_handle() {
        let (handle, _task, _sink) = start(config());
        handle.submit_fluff(make_tx(1, 100, 1_000)).unwrap();
        handle.flush().await.unwrap();

        assert!(handle.next_for_peer(9).is_some());
        assert!(handle.next_for_peer(9).is_none());
        handle.drop_peer(9);
        assert_eq!(handle.snapshot().send_queue, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_and_clears() {
        let (handle, task, _sink) = start(config());
        handle.submit_fluff(make_tx(1, 100, 1_000)).unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();

        assert_eq!(handle.snapshot().fluff, 0);
        assert!(matches!(
            handle.submit_fluff(make_tx(2, 100, 1_000)),
            Err(PetalError::ServiceStopped)
        ));
        assert!(matches!(handle.flush().await, Err(PetalError::ServiceStopped)));
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        let sink = Arc::new(CountingSink::default());
        let err = PoolService::spawn(config(), Arc::new(AcceptAll), sink).unwrap_err();
        assert!(matches!(err, PetalError::NoRuntime));
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let mut cfg = config();
        cfg.dandelion.stem_timeout_min_ms = 500;
        let sink = Arc::new(CountingSink::default());
        let err = PoolService::spawn(cfg, Arc::new(AcceptAll), sink).unwrap_err();
        assert!(matches!(err, PetalError::Config(_)));
    }
}
