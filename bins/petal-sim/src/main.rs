//! Petal relay network simulator.
//!
//! Runs several pool services in one process, wires them into a ring
//! (stem goes to the next node, fluff to everyone), feeds them random
//! transactions and double spends, advances the chain tip, and reports
//! what each pool holds at the end.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use petal_core::error::PoolError;
use petal_core::traits::{ContextValidator, PeerSink};
use petal_core::types::{Amount, Hash256, HeightRange, Transaction, TxKernel};
use petal_node::{NodeConfig, PetalError, PoolHandle, PoolService};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Petal simulator: in-process Dandelion++ relays.
#[derive(Parser, Debug)]
#[command(name = "petal-sim", version, about = "Simulate a ring of Dandelion++ relay nodes")]
struct Args {
    /// Optional TOML config shared by every node (PETAL_* env vars apply on top)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of relay nodes in the ring
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Number of transactions to submit
    #[arg(long, default_value_t = 50)]
    txs: u64,

    /// Share of transactions followed by a public double spend, in percent
    #[arg(long, default_value_t = 10)]
    double_spend_pct: u32,

    /// Number of blocks to advance the tip by
    #[arg(long, default_value_t = 5)]
    blocks: u64,

    /// Milliseconds between blocks
    #[arg(long, default_value_t = 1_000)]
    block_interval_ms: u64,

    /// Minimum fee the simulated validator requires
    #[arg(long, default_value_t = 1_000)]
    min_fee: Amount,

    /// Seed for transaction generation and node RNGs
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

/// Accepts any transaction paying at least `min_fee`; the surplus is the
/// reserve.
struct MinFeeValidator {
    min_fee: Amount,
}

impl ContextValidator for MinFeeValidator {
    fn validate_tx_context(
        &self,
        _tx: &Transaction,
        _height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError> {
        fees.checked_sub(self.min_fee)
            .ok_or_else(|| PoolError::stale(format!("fee {fees} below minimum {}", self.min_fee)))
    }
}

#[derive(Debug)]
enum Wire {
    Stem(Transaction),
    Fluff(Transaction),
}

/// Outbound side of one node: everything goes to the router tagged with
/// the sender.
struct ChannelSink {
    from: usize,
    out: mpsc::UnboundedSender<(usize, Wire)>,
}

impl PeerSink for ChannelSink {
    fn send_stem(&self, tx: &Transaction) {
        let _ = self.out.send((self.from, Wire::Stem(tx.clone())));
    }

    fn broadcast_fluff(&self, tx: &Transaction) {
        let _ = self.out.send((self.from, Wire::Fluff(tx.clone())));
    }
}

/// Deliver messages between nodes until every sender is gone.
async fn route(nodes: Vec<PoolHandle>, mut wire: mpsc::UnboundedReceiver<(usize, Wire)>) {
    let mut stem_hops = 0u64;
    let mut fluff_msgs = 0u64;
    while let Some((from, msg)) = wire.recv().await {
        let result = match msg {
            Wire::Stem(tx) => {
                stem_hops += 1;
                nodes[(from + 1) % nodes.len()].submit_stem(tx)
            }
            Wire::Fluff(tx) => {
                fluff_msgs += 1;
                nodes
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != from)
                    .try_for_each(|(_, node)| node.submit_fluff(tx.clone()))
            }
        };
        if let Err(e) = result {
            debug!(from, %e, "delivery failed");
        }
    }
    info!(stem_hops, fluff_msgs, "router stopped");
}

/// A one-in, one-out transaction with a unique input.
fn random_tx(rng: &mut StdRng, n: u64, max_height: u64) -> Transaction {
    let input = Hash256::digest(&n.to_le_bytes());
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&n.to_le_bytes());
    out[8..].copy_from_slice(&rng.gen_range(0..u64::MAX).to_le_bytes());
    Transaction {
        inputs: vec![input],
        outputs: vec![Hash256::digest(&out)],
        kernels: vec![TxKernel {
            fee: rng.gen_range(500..50_000),
            min_height: 0,
            max_height,
            bvm_charge: 0,
            nonce: n,
        }],
        offset: Hash256::ZERO,
    }
}

async fn run(args: Args) -> Result<(), PetalError> {
    let mut base = NodeConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        base.log_level = level;
    }
    init_logging(&base.log_level, &args.log_format);

    info!("Petal simulator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        nodes = args.nodes,
        txs = args.txs,
        blocks = args.blocks,
        fluff_probability = base.dandelion.fluff_probability,
        aggregation_ms = base.dandelion.aggregation_time_ms,
        "starting"
    );

    let validator: Arc<dyn ContextValidator> = Arc::new(MinFeeValidator { min_fee: args.min_fee });
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(args.nodes);
    let mut tasks = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let mut config = base.clone();
        config.rng_seed = Some(args.seed.wrapping_add(i as u64));
        let sink = Arc::new(ChannelSink { from: i, out: wire_tx.clone() });
        let (handle, task) = PoolService::spawn(config, validator.clone(), sink)?;
        handles.push(handle);
        tasks.push(task);
    }
    drop(wire_tx);
    let router = tokio::spawn(route(handles.clone(), wire_rx));

    let mut rng = StdRng::seed_from_u64(args.seed);
    let expiry = args.blocks.saturating_mul(2).max(1);
    let mut double_spends = 0u64;
    for n in 0..args.txs {
        let max_height = if rng.gen_range(0..4) == 0 { rng.gen_range(1..=expiry) } else { u64::MAX };
        let tx = random_tx(&mut rng, n, max_height);
        let entry = rng.gen_range(0..args.nodes);

        if rng.gen_range(0..100) < args.double_spend_pct {
            // Same input, fresh output and fee, published directly.
            let mut rival = random_tx(&mut rng, n, u64::MAX);
            rival.inputs = tx.inputs.clone();
            let target = rng.gen_range(0..args.nodes);
            handles[target].submit_fluff(rival)?;
            double_spends += 1;
        }
        handles[entry].submit_stem(tx)?;
    }
    info!(double_spends, "transactions submitted");

    let mut interval = tokio::time::interval(Duration::from_millis(args.block_interval_ms));
    interval.tick().await;
    for height in 1..=args.blocks {
        interval.tick().await;
        for handle in &handles {
            handle.new_tip(height)?;
        }
        debug!(height, "tip advanced");
    }

    // Let the last embargoes run out.
    let d = &base.dandelion;
    let settle = d.stem_timeout_max_ms + d.aggregation_time_ms + 100;
    tokio::time::sleep(Duration::from_millis(settle)).await;

    for (i, handle) in handles.iter().enumerate() {
        handle.flush().await?;
        let snap = handle.snapshot();
        let candidates = handle.block_candidates();
        info!(
            node = i,
            tip = snap.tip,
            public = snap.profit,
            pre_fluffed = snap.pre_fluffed,
            outdated = snap.outdated,
            stem = snap.stem,
            candidates = candidates.len(),
            "final pool"
        );
        if snap.stem > 0 {
            warn!(node = i, stem = snap.stem, "stem transactions still embargoed");
        }
    }

    for handle in &handles {
        handle.shutdown()?;
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!(%e, "pool service task failed");
        }
    }
    router.abort();
    info!("simulation complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.nodes < 2 {
        eprintln!("--nodes must be at least 2");
        process::exit(2);
    }
    if let Err(e) = run(args).await {
        error!("simulation failed: {}", e);
        eprintln!("simulation failed: {e}");
        process::exit(1);
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` gives structured JSON lines; anything else is
/// human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
