//! Process-wide registry mapping transfer labels to their queues.
//!
//! The manager admits requests by locating or lazily creating the owning
//! queue, enforces the global worker cap, and owns the tunables every
//! scheduling decision samples. One manager instance serves the whole
//! gateway; tests construct their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::TransferEngine;

use super::error::PoolError;
use super::queue::{ProduceOutcome, TpcQueue};
use super::request::TpcRequest;
use super::types::{PoolConfig, PoolMetrics, Tunables};

pub(crate) struct ManagerInner<E: TransferEngine> {
    engine: Arc<E>,
    pool_map: DashMap<String, Arc<TpcQueue<E>>>,
    tunables: Tunables,
    metrics: PoolMetrics,
    global_thread_count: AtomicUsize,
    next_worker_id: AtomicUsize,
    shutting_down: AtomicBool,
}

impl<E: TransferEngine> ManagerInner<E> {
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn next_worker_id(&self) -> usize {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn global_thread_count(&self) -> usize {
        self.global_thread_count.load(Ordering::Acquire)
    }

    /// Claim a global worker slot.
    ///
    /// The cap check and the increment must be one atomic step or concurrent
    /// admissions could over-commit past the cap, hence the
    /// compare-exchange loop. A zero cap means unlimited.
    pub(crate) fn try_reserve_global_slot(&self) -> bool {
        let limit = self.tunables.max_global_threads();
        let mut current = self.global_thread_count.load(Ordering::Acquire);
        loop {
            if limit != 0 && current >= limit {
                return false;
            }
            match self.global_thread_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Give back a slot reserved for a worker that never started.
    pub(crate) fn release_global_slot(&self) {
        self.global_thread_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Worker-thread exit hook: release the slot, then re-check queues that
    /// admitted work under a saturated global cap and have no worker to
    /// loop back for it.
    pub(crate) fn worker_exited(inner: &Arc<Self>) {
        inner.global_thread_count.fetch_sub(1, Ordering::AcqRel);
        inner.metrics.workers_exited.fetch_add(1, Ordering::Relaxed);
        if !inner.is_shutting_down() {
            Self::kick_starved_queues(inner);
        }
    }

    fn kick_starved_queues(inner: &Arc<Self>) {
        // Collect first so no registry shard lock is held while taking
        // queue locks.
        let queues: Vec<Arc<TpcQueue<E>>> = inner
            .pool_map
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for queue in queues {
            TpcQueue::ensure_worker(&queue, inner);
        }
    }

    /// Forget a queue whose last worker has exited. The queue may already be
    /// gone; the removal is then a no-op.
    pub(crate) fn queue_done(&self, label: &str) {
        log::info!("worker pool for {label} is idle and all workers have exited");
        self.pool_map.remove(label);
    }
}

/// The third-party-copy request manager.
///
/// Cloning is cheap and shares the same pool; request handlers typically
/// each hold a clone.
pub struct TpcRequestManager<E: TransferEngine> {
    inner: Arc<ManagerInner<E>>,
}

impl<E: TransferEngine> Clone for TpcRequestManager<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TransferEngine> TpcRequestManager<E> {
    pub fn new(config: PoolConfig, engine: Arc<E>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                pool_map: DashMap::new(),
                tunables: Tunables::new(&config),
                metrics: PoolMetrics::default(),
                global_thread_count: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Admit a request for processing.
    ///
    /// On success the request is owned jointly with the pool until its
    /// status turns terminal; the producer awaits that through
    /// [`TpcRequest::wait_for`]. `Err(PoolError::QueueFull)` is backpressure:
    /// nothing was enqueued and the caller decides the user-visible
    /// response.
    ///
    /// A queue found mid-teardown (its `done` latch set) removes itself from
    /// the registry as soon as its last worker leaves; admission retries
    /// until the fresh lookup no longer races with that removal.
    pub fn produce(&self, request: Arc<TpcRequest<E::Transfer>>) -> Result<(), PoolError> {
        loop {
            if self.inner.is_shutting_down() {
                return Err(PoolError::ShuttingDown);
            }
            let queue = self.lookup_or_create(request.label());
            match TpcQueue::produce(&queue, &self.inner, Arc::clone(&request)) {
                ProduceOutcome::Accepted => {
                    self.inner
                        .metrics
                        .requests_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                ProduceOutcome::Rejected => {
                    self.inner
                        .metrics
                        .requests_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::QueueFull(request.label().to_string()));
                }
                ProduceOutcome::SpawnFailed(message) => {
                    self.inner
                        .metrics
                        .requests_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::SpawnFailed(message));
                }
                ProduceOutcome::Closed => std::thread::yield_now(),
            }
        }
    }

    fn lookup_or_create(&self, label: &str) -> Arc<TpcQueue<E>> {
        // Read path first: most admissions hit an existing queue.
        if let Some(queue) = self.inner.pool_map.get(label) {
            return Arc::clone(queue.value());
        }
        match self.inner.pool_map.entry(label.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let queue = TpcQueue::new(label.to_string());
                entry.insert(Arc::clone(&queue));
                log::info!("created new transfer queue for {label}");
                queue
            }
        }
    }

    pub fn set_worker_idle_timeout(&self, timeout: Duration) {
        self.inner.tunables.set_idle_timeout(timeout);
    }

    pub fn set_max_pending_ops(&self, max: usize) {
        self.inner.tunables.set_max_pending_ops(max);
    }

    pub fn set_max_workers(&self, max: usize) {
        self.inner.tunables.set_max_workers(max);
    }

    /// Cap worker threads across all queues; 0 means unlimited.
    pub fn set_max_global_threads(&self, max: usize) {
        self.inner.tunables.set_max_global_threads(max);
    }

    pub fn max_global_threads(&self) -> usize {
        self.inner.tunables.max_global_threads()
    }

    /// Workers currently running across all queues.
    pub fn global_thread_count(&self) -> usize {
        self.inner.global_thread_count()
    }

    /// Pending depth of the queue for `label`, if one exists.
    pub fn pending_depth(&self, label: &str) -> Option<usize> {
        self.inner
            .pool_map
            .get(label)
            .map(|queue| queue.pending_depth())
    }

    /// Labels with a live queue.
    pub fn active_labels(&self) -> Vec<String> {
        self.inner
            .pool_map
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Drain the pool: stop admitting, cancel all pending and in-flight
    /// requests, and wait up to `timeout` for every worker to exit.
    ///
    /// Returns true when the global worker count reached zero in time.
    /// In-flight transfers observe the shutdown within one engine wait tick
    /// and complete with a cancellation status.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutting_down.store(true, Ordering::Release);
        log::info!(
            "shutdown requested; draining {} transfer queue(s)",
            self.inner.pool_map.len()
        );

        let queues: Vec<(String, Arc<TpcQueue<E>>)> = self
            .inner
            .pool_map
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (label, queue) in queues {
            if queue.shut_down(&self.inner) {
                self.inner.pool_map.remove(&label);
            }
        }

        let start = Instant::now();
        loop {
            let live = self.inner.global_thread_count();
            if live == 0 {
                log::info!(
                    "shutdown drain complete ({:.2}s)",
                    start.elapsed().as_secs_f64()
                );
                return true;
            }
            if start.elapsed() >= timeout {
                log::warn!("shutdown timeout reached with {live} worker(s) still live");
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
