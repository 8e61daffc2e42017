//! The stem pool's single timer, backed by tokio.
//!
//! Arming spawns one sleep task that posts [`PoolEvent::TimerFired`] to the
//! service loop; re-arming or cancelling aborts it first, so at most one
//! task is ever pending. The clock is tokio's, which lets tests pause and
//! advance time.

use std::time::Duration;

use petal_core::traits::StemTimer;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::service::PoolEvent;

pub struct TokioTimer {
    runtime: Handle,
    events: mpsc::UnboundedSender<PoolEvent>,
    epoch: Instant,
    pending: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimer")
            .field("now_ms", &self.now_ms())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl TokioTimer {
    /// Timer that spawns on `runtime` and reports to `events`.
    pub fn new(runtime: Handle, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self { runtime, events, epoch: Instant::now(), pending: None }
    }
}

impl StemTimer for TokioTimer {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn arm(&mut self, timeout_ms: u64) {
        self.cancel();
        let events = self.events.clone();
        self.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            // The service may be gone; nothing to fire into then.
            let _ = events.send(PoolEvent::TimerFired);
        }));
        trace!(timeout_ms, "tokio timer armed");
    }

    fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
