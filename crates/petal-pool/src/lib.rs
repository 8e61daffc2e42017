//! # petal-pool — the transaction pool proper.
//!
//! Three independent pools, each a synchronous single-owner structure:
//! - [`fluff::Fluff`] — public mempool with lifecycle states and send fan-out
//! - [`stem::Stem`] — Dandelion++ stem holding area with one shared timer
//! - [`dependent::Dependent`] — forest of speculative dependent chains
//!
//! [`stats::Stats`] and [`profit::ProfitKey`] are shared by fluff and stem.
//!
//! None of the pools lock internally. Every mutation must come from the one
//! owner (normally the node's event loop); a multi-threaded host has to
//! serialize calls behind its own mutex.

pub mod dependent;
pub mod fluff;
pub mod profit;
pub mod stats;
pub mod stem;

pub use dependent::{Dependent, DependentId, DependentLimits};
pub use fluff::{Features, Fluff, FluffId, SendId, State};
pub use profit::ProfitKey;
pub use stats::Stats;
pub use stem::{Stem, StemHandler, StemId};
