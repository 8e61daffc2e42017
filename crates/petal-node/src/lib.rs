//! # petal-node — the node that owns the pools.
//!
//! - [`relay::RelayNode`] — Dandelion++ policy: aggregation, stem forwarding,
//!   fluffing, conflict resolution, tip sweeps, peer fan-out
//! - [`service::PoolService`] — tokio event loop serializing all pool mutation
//! - [`timer::TokioTimer`] — the stem pool's single timer
//! - [`config::NodeConfig`] — file and environment configuration

pub mod config;
pub mod error;
pub mod relay;
pub mod service;
pub mod timer;

pub use config::{DandelionConfig, NodeConfig, PoolLimits};
pub use error::{ConfigError, PetalError};
pub use relay::{PeerId, PoolSnapshot, RelayNode, TipSweep};
pub use service::{PoolEvent, PoolHandle, PoolService};
pub use timer::TokioTimer;
