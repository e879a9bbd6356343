//! Worker thread: pulls requests off one queue and drives them through the
//! transfer engine.
//!
//! Each worker owns one engine multi-handle for its whole lifetime. The
//! engine wait is bounded to one second so cancellation and shutdown are
//! observed between ticks even while the engine is blocked.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::engine::TransferEngine;

use super::manager::ManagerInner;
use super::queue::{TpcQueue, WorkerSlot};
use super::request::{STATUS_CANCELLED, STATUS_ENGINE_FAILURE, TpcRequest};

/// Upper bound on one engine wait; also the cancellation granularity.
const ENGINE_WAIT_TICK: Duration = Duration::from_secs(1);

enum TransferOutcome {
    /// The request reached a terminal status; the worker can take more work.
    Complete,
    /// The multi-handle is unrecoverable; the worker must exit.
    WorkerFatal,
}

/// Releases the worker's global thread slot when the thread exits, however
/// it exits.
struct GlobalSlotGuard<E: TransferEngine> {
    inner: Arc<ManagerInner<E>>,
}

impl<E: TransferEngine> Drop for GlobalSlotGuard<E> {
    fn drop(&mut self) {
        ManagerInner::worker_exited(&self.inner);
    }
}

/// Worker main loop.
pub(crate) fn run<E: TransferEngine>(
    queue: Arc<TpcQueue<E>>,
    slot: Arc<WorkerSlot>,
    inner: Arc<ManagerInner<E>>,
) {
    let _slot_guard = GlobalSlotGuard {
        inner: Arc::clone(&inner),
    };
    log::info!(
        "worker {} for transfer queue {} starting",
        slot.id,
        queue.label()
    );

    let mut multi = match inner.engine().multi_new() {
        Ok(multi) => multi,
        Err(err) => {
            log::error!(
                "unable to create an engine multi-handle; fatal error for worker {}: {err}",
                slot.id
            );
            TpcQueue::done(&queue, &inner, &slot);
            return;
        }
    };

    loop {
        let request = match next_request(&queue, &slot, &inner) {
            Some(request) => request,
            None => break,
        };
        match run_transfer(&inner, &mut multi, &request) {
            TransferOutcome::Complete => {}
            TransferOutcome::WorkerFatal => {
                log::error!(
                    "worker {} multi-handle caused an internal error; worker exiting",
                    slot.id
                );
                TpcQueue::done(&queue, &inner, &slot);
                return;
            }
        }
    }

    log::info!(
        "worker {} for transfer queue {} exiting",
        slot.id,
        queue.label()
    );
}

/// Dequeue the next request, idling up to the configured timeout.
///
/// Returning `None` means the worker has retired: the queue has already
/// removed its record and, if it was the last worker, scheduled the queue's
/// removal from the manager. Once the queue is done (a sibling retired or
/// the pool is shutting down) the idle wait is skipped so the unwind stays
/// prompt.
fn next_request<E: TransferEngine>(
    queue: &Arc<TpcQueue<E>>,
    slot: &Arc<WorkerSlot>,
    inner: &Arc<ManagerInner<E>>,
) -> Option<Arc<TpcRequest<E::Transfer>>> {
    if let Some(request) = queue.try_consume() {
        return Some(request);
    }
    if !queue.is_done() && !inner.is_shutting_down() {
        if let Some(request) = queue.consume_until(inner.tunables().idle_timeout(), slot) {
            return Some(request);
        }
    }
    TpcQueue::retire(queue, inner, slot)
}

/// Drive one request to a terminal status.
///
/// State machine: attach the handle, then alternate non-blocking perform
/// steps with bounded waits, draining completion messages as they appear.
/// The first "transfer done" message carries the result code and ends the
/// loop.
fn run_transfer<E: TransferEngine>(
    inner: &Arc<ManagerInner<E>>,
    multi: &mut E::Multi,
    request: &Arc<TpcRequest<E::Transfer>>,
) -> TransferOutcome {
    let engine = inner.engine();

    // A request cancelled before pickup completes without moving any bytes.
    if cancelled(inner, request) {
        finish_cancelled(inner, request);
        return TransferOutcome::Complete;
    }

    if let Err(err) = engine.add(multi, request.handle()) {
        // The multi-handle itself is intact; only this request fails.
        let message = err.to_string();
        log::error!("{message}");
        request.set_done(STATUS_ENGINE_FAILURE, message);
        inner
            .metrics()
            .transfers_failed
            .fetch_add(1, Ordering::Relaxed);
        return TransferOutcome::Complete;
    }
    request.set_progress(0);

    let mut result: Option<i32> = None;
    let mut removed = false;
    let mut fatal = false;
    loop {
        if cancelled(inner, request) {
            engine.remove(multi, request.handle());
            finish_cancelled(inner, request);
            return TransferOutcome::Complete;
        }

        let running = match engine.perform(multi) {
            Ok(running) => running,
            Err(err) => {
                let message = err.to_string();
                log::error!("{message}");
                engine.remove(multi, request.handle());
                request.set_done(STATUS_ENGINE_FAILURE, message);
                inner
                    .metrics()
                    .transfers_failed
                    .fetch_add(1, Ordering::Relaxed);
                return TransferOutcome::WorkerFatal;
            }
        };

        while let Some(completion) = engine.info_read(multi) {
            if result.is_none() {
                result = Some(completion.code);
                engine.remove(multi, request.handle());
                removed = true;
            }
        }
        if result.is_some() || running == 0 {
            break;
        }

        if let Err(err) = engine.wait(multi, ENGINE_WAIT_TICK) {
            log::error!("engine wait failure for {}: {err}", request.label());
            fatal = true;
            break;
        }
    }

    match result {
        Some(code) => {
            request.set_done(code, "Transfer complete");
            inner
                .metrics()
                .transfers_completed
                .fetch_add(1, Ordering::Relaxed);
            TransferOutcome::Complete
        }
        None => {
            if !removed {
                engine.remove(multi, request.handle());
            }
            let message = "internal engine state error - no transfer results returned";
            log::error!("{message} (queue {})", request.label());
            request.set_done(STATUS_ENGINE_FAILURE, message);
            inner
                .metrics()
                .transfers_failed
                .fetch_add(1, Ordering::Relaxed);
            if fatal {
                TransferOutcome::WorkerFatal
            } else {
                TransferOutcome::Complete
            }
        }
    }
}

fn cancelled<E: TransferEngine>(
    inner: &Arc<ManagerInner<E>>,
    request: &Arc<TpcRequest<E::Transfer>>,
) -> bool {
    request.is_cancelled() || inner.is_shutting_down()
}

fn finish_cancelled<E: TransferEngine>(
    inner: &Arc<ManagerInner<E>>,
    request: &Arc<TpcRequest<E::Transfer>>,
) {
    request.set_done(STATUS_CANCELLED, "cancelled");
    inner
        .metrics()
        .transfers_cancelled
        .fetch_add(1, Ordering::Relaxed);
}
