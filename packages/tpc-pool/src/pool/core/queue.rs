//! Per-label FIFO of pending transfers and the workers serving it.
//!
//! A queue is created lazily by the manager on the first request for a label
//! and removes itself once its last worker exits. All queue state lives under
//! one mutex; each worker waits on its own condition variable so admission
//! can wake exactly the worker it chooses. Operations that may spawn a worker
//! take the queue as an `Arc` because the worker thread keeps a reference to
//! it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::engine::TransferEngine;

use super::manager::ManagerInner;
use super::request::{STATUS_CANCELLED, STATUS_ENGINE_FAILURE, TpcRequest};
use super::worker;

/// Per-worker record kept by the queue.
///
/// The idle flag is only read and written under the queue mutex; the condvar
/// is paired with that same mutex.
pub(crate) struct WorkerSlot {
    pub(crate) id: usize,
    pub(crate) idle: AtomicBool,
    pub(crate) cv: Condvar,
}

/// Outcome of one admission attempt against a queue.
pub(crate) enum ProduceOutcome {
    /// Enqueued; a worker is awake or on its way.
    Accepted,
    /// Pending depth is at its cap.
    Rejected,
    /// The queue latched `done` and is unwinding; the manager must retry.
    Closed,
    /// A worker thread could not be spawned and no worker exists to ever
    /// drain the request, so it was backed out of the queue.
    SpawnFailed(String),
}

struct QueueState<H> {
    pending: VecDeque<Arc<TpcRequest<H>>>,
    /// Spawn order, oldest first.
    workers: Vec<Arc<WorkerSlot>>,
    done: bool,
}

pub(crate) struct TpcQueue<E: TransferEngine> {
    label: String,
    state: Mutex<QueueState<E::Transfer>>,
}

impl<E: TransferEngine> TpcQueue<E> {
    pub(crate) fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                workers: Vec::new(),
                done: false,
            }),
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub(crate) fn pending_depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Admit one request.
    ///
    /// If any worker is idle, the oldest one is woken: concentrating work on
    /// long-lived workers lets newer ones age out through the idle timeout,
    /// keeping the steady-state pool minimal. Otherwise a worker is spawned
    /// when both the per-queue cap and the global cap have room; with all
    /// workers busy and caps reached the request simply waits for a worker
    /// to loop back.
    pub(crate) fn produce(
        queue: &Arc<Self>,
        inner: &Arc<ManagerInner<E>>,
        request: Arc<TpcRequest<E::Transfer>>,
    ) -> ProduceOutcome {
        let mut state = queue.state.lock();
        if state.done {
            return ProduceOutcome::Closed;
        }
        if state.pending.len() >= inner.tunables().max_pending_ops() {
            log::warn!(
                "transfer queue for {} is full; rejecting request",
                queue.label
            );
            return ProduceOutcome::Rejected;
        }
        state.pending.push_back(request);

        for slot in &state.workers {
            if slot.idle.load(Ordering::Relaxed) {
                slot.cv.notify_one();
                return ProduceOutcome::Accepted;
            }
        }

        let below_cap = state.workers.len() < inner.tunables().max_workers();
        if below_cap && inner.try_reserve_global_slot() {
            if let Err(err) = Self::spawn_worker_locked(queue, &mut state, inner) {
                inner.release_global_slot();
                log::error!("failed to spawn worker for {}: {err}", queue.label);
                if state.workers.is_empty() {
                    // Nothing will ever drain the queue; back the request out
                    // so the producer sees the failure instead of hanging.
                    state.pending.pop_back();
                    return ProduceOutcome::SpawnFailed(err.to_string());
                }
            }
        }

        ProduceOutcome::Accepted
    }

    /// Pop the head of the queue without blocking.
    pub(crate) fn try_consume(&self) -> Option<Arc<TpcRequest<E::Transfer>>> {
        self.state.lock().pending.pop_front()
    }

    /// Wait up to `timeout` for work, flagging the worker idle while it
    /// waits. Returns early when the queue latches `done` so unwinding is
    /// not delayed by a full idle timeout.
    pub(crate) fn consume_until(
        &self,
        timeout: Duration,
        slot: &WorkerSlot,
    ) -> Option<Arc<TpcRequest<E::Transfer>>> {
        let mut state = self.state.lock();
        slot.idle.store(true, Ordering::Relaxed);
        slot.cv
            .wait_while_for(&mut state, |s| s.pending.is_empty() && !s.done, timeout);
        slot.idle.store(false, Ordering::Relaxed);
        state.pending.pop_front()
    }

    /// Worker exit path after an idle timeout.
    ///
    /// A request admitted between the timed-out wait and this call would be
    /// stranded if the worker simply left, so the exit decision is re-made
    /// under the lock: pending work is handed back to the worker instead.
    /// Otherwise the `done` latch is set (no further admissions succeed),
    /// the worker record is dropped, and the last worker out asks the
    /// manager to forget the queue.
    pub(crate) fn retire(
        queue: &Arc<Self>,
        inner: &Arc<ManagerInner<E>>,
        slot: &Arc<WorkerSlot>,
    ) -> Option<Arc<TpcRequest<E::Transfer>>> {
        let mut state = queue.state.lock();
        if let Some(request) = state.pending.pop_front() {
            return Some(request);
        }
        state.done = true;
        state.workers.retain(|other| !Arc::ptr_eq(other, slot));
        // Wake the remaining idle workers so they observe the latch promptly.
        for other in &state.workers {
            other.cv.notify_one();
        }
        let last_out = state.workers.is_empty();
        drop(state);
        if last_out {
            inner.queue_done(&queue.label);
        }
        None
    }

    /// Worker exit path for a fatal engine error.
    ///
    /// Unlike [`retire`](Self::retire) the worker cannot take more work: its
    /// multi-handle is unusable. When the last worker leaves this way, any
    /// requests still pending are completed with an engine-failure status
    /// rather than stranded.
    pub(crate) fn done(queue: &Arc<Self>, inner: &Arc<ManagerInner<E>>, slot: &Arc<WorkerSlot>) {
        let mut state = queue.state.lock();
        state.done = true;
        state.workers.retain(|other| !Arc::ptr_eq(other, slot));
        for other in &state.workers {
            other.cv.notify_one();
        }
        let last_out = state.workers.is_empty();
        let stranded = if last_out {
            std::mem::take(&mut state.pending)
        } else {
            VecDeque::new()
        };
        drop(state);

        for request in stranded {
            request.set_done(
                STATUS_ENGINE_FAILURE,
                "transfer worker exited before the request could run",
            );
            inner
                .metrics()
                .transfers_failed
                .fetch_add(1, Ordering::Relaxed);
        }
        if last_out {
            inner.queue_done(&queue.label);
        }
    }

    /// Spawn a worker for a queue that has pending work but no workers.
    ///
    /// Called by the manager when a global slot frees up: a queue admitted
    /// under a saturated global cap has nobody to loop back for its work
    /// until this runs.
    pub(crate) fn ensure_worker(queue: &Arc<Self>, inner: &Arc<ManagerInner<E>>) {
        let mut state = queue.state.lock();
        if state.done || state.pending.is_empty() || !state.workers.is_empty() {
            return;
        }
        if !inner.try_reserve_global_slot() {
            return;
        }
        if let Err(err) = Self::spawn_worker_locked(queue, &mut state, inner) {
            inner.release_global_slot();
            log::error!("failed to spawn worker for {}: {err}", queue.label);
        }
    }

    /// Drain path for manager shutdown: latch `done`, cancel everything
    /// pending, and wake the workers so they observe both. With no workers
    /// to dispatch to, pending requests are completed directly.
    ///
    /// Returns true when the queue has no workers left and can be dropped
    /// from the registry immediately.
    pub(crate) fn shut_down(&self, inner: &Arc<ManagerInner<E>>) -> bool {
        let mut state = self.state.lock();
        state.done = true;
        if state.workers.is_empty() {
            let pending = std::mem::take(&mut state.pending);
            drop(state);
            for request in pending {
                request.cancel();
                request.set_done(STATUS_CANCELLED, "cancelled");
                inner
                    .metrics()
                    .transfers_cancelled
                    .fetch_add(1, Ordering::Relaxed);
            }
            return true;
        }
        for request in &state.pending {
            request.cancel();
        }
        for slot in &state.workers {
            slot.cv.notify_one();
        }
        false
    }

    fn spawn_worker_locked(
        queue: &Arc<Self>,
        state: &mut QueueState<E::Transfer>,
        inner: &Arc<ManagerInner<E>>,
    ) -> std::io::Result<()> {
        let slot = Arc::new(WorkerSlot {
            id: inner.next_worker_id(),
            idle: AtomicBool::new(false),
            cv: Condvar::new(),
        });
        let thread_queue = Arc::clone(queue);
        let thread_slot = Arc::clone(&slot);
        let thread_inner = Arc::clone(inner);
        std::thread::Builder::new()
            .name(format!("tpc-worker-{}", slot.id))
            .spawn(move || worker::run(thread_queue, thread_slot, thread_inner))?;
        state.workers.push(slot);
        inner
            .metrics()
            .workers_spawned
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
