use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::error::{Result, TunnelError};

/// Default cap on concurrently relayed flows
pub const DEFAULT_MAX_FLOWS: usize = 10_000;

/// RAII guard holding one active-flow slot
#[derive(Debug)]
pub struct FlowGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owner of all background relay tasks
///
/// Relays are spawned detached from the handler that set them up, but they
/// stay tracked here so shutdown can stop accepting work and wait for them.
#[derive(Debug, Clone)]
pub struct RelaySupervisor {
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
    max_flows: usize,
}

impl RelaySupervisor {
    pub fn new(max_flows: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
            max_flows,
        }
    }

    /// Reserve a flow slot
    ///
    /// Fails with [`TunnelError::Overloaded`] when the cap is reached.
    pub fn try_acquire(&self) -> Result<FlowGuard> {
        let mut current = self.active.load(Ordering::Acquire);

        loop {
            if current >= self.max_flows {
                return Err(TunnelError::Overloaded(current));
            }

            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(FlowGuard {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Run `relay` in the background, releasing `guard` when it finishes
    pub fn spawn<F>(&self, guard: FlowGuard, relay: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            let _guard = guard;
            relay.await;
        });
    }

    /// Get the current active flow count
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_flows(&self) -> usize {
        self.max_flows
    }

    /// Number of relay tasks still running
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for running relays to finish, up to `timeout`
    ///
    /// Returns `true` if everything drained in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

impl Default for RelaySupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FLOWS)
    }
}
