use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Scheduler tunables sampled at decision points (admission, worker spawn,
/// idle wait).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a worker waits on an empty queue before exiting.
    pub idle_timeout: Duration,
    /// Per-queue cap on requests waiting for a worker.
    pub max_pending_ops: usize,
    /// Per-queue cap on worker threads.
    pub max_workers: usize,
    /// Cap on worker threads across all queues; 0 means unlimited.
    pub max_global_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_pending_ops: 20,
            max_workers: 20,
            max_global_threads: 0,
        }
    }
}

/// Runtime-adjustable view of [`PoolConfig`] held by the manager.
///
/// Setters may run at any time; the scheduler only reads these at its
/// decision points, so a change never disturbs work already in flight.
#[derive(Debug)]
pub(crate) struct Tunables {
    idle_timeout_ms: AtomicU64,
    max_pending_ops: AtomicUsize,
    max_workers: AtomicUsize,
    max_global_threads: AtomicUsize,
}

impl Tunables {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            idle_timeout_ms: AtomicU64::new(config.idle_timeout.as_millis() as u64),
            max_pending_ops: AtomicUsize::new(config.max_pending_ops),
            max_workers: AtomicUsize::new(config.max_workers),
            max_global_threads: AtomicUsize::new(config.max_global_threads),
        }
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Acquire))
    }

    pub(crate) fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub(crate) fn max_pending_ops(&self) -> usize {
        self.max_pending_ops.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_pending_ops(&self, max: usize) {
        self.max_pending_ops.store(max, Ordering::Release);
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_workers(&self, max: usize) {
        self.max_workers.store(max, Ordering::Release);
    }

    pub(crate) fn max_global_threads(&self) -> usize {
        self.max_global_threads.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_global_threads(&self, max: usize) {
        self.max_global_threads.store(max, Ordering::Release);
    }
}

/// Counters tracked per manager. Suitable for metrics exposure; not part of
/// any wire protocol.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub requests_accepted: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub workers_exited: AtomicU64,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
    pub transfers_cancelled: AtomicU64,
}
