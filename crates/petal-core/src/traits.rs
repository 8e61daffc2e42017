//! Trait interfaces between the pool and the node that owns it.
//!
//! - [`StemTimer`] — the single system timer backing the stem pool
//!   (petal-node implements it on tokio)
//! - [`ContextValidator`] — relay-time re-validation against the chain tip
//! - [`PeerSink`] — outbound transaction relay

use crate::error::PoolError;
use crate::types::{Amount, HeightRange, Transaction};

/// A one-shot timer that the stem pool keeps armed for its nearest deadline.
///
/// The pool guarantees it never has more than one timer outstanding:
/// every [`arm`](Self::arm) replaces whatever was armed before. The timer
/// is also the pool's clock, so tests can drive time by hand.
pub trait StemTimer: Send {
    /// Current time in milliseconds on a monotonic clock.
    fn now_ms(&self) -> u64;

    /// Arm (or re-arm) the timer to fire after `timeout_ms` milliseconds.
    fn arm(&mut self, timeout_ms: u64);

    /// Cancel a pending timer. No-op if nothing is armed.
    fn cancel(&mut self);
}

/// Context-dependent validation performed just before a transaction is
/// relayed or merged.
///
/// Context-free checks are assumed done; this only answers whether the
/// transaction is still acceptable at the current tip.
pub trait ContextValidator: Send + Sync {
    /// Re-check `tx` with validity window `height` and total `fees`.
    ///
    /// Returns the fee reserve (the surplus over the minimum required fee)
    /// or [`PoolError::StaleContext`].
    fn validate_tx_context(
        &self,
        tx: &Transaction,
        height: &HeightRange,
        fees: Amount,
    ) -> Result<Amount, PoolError>;
}

/// Outbound relay to peers. Peer selection is the implementor's business.
pub trait PeerSink: Send + Sync {
    /// Forward a stem-phase transaction to one relay peer.
    fn send_stem(&self, tx: &Transaction);

    /// Broadcast a fluffed transaction to all peers.
    fn broadcast_fluff(&self, tx: &Transaction);
}
