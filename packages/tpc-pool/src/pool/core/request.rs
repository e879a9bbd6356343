//! The transfer request value object.
//!
//! A request is shared between the producer that awaits its completion and
//! the worker that drives it. Producers poll progress lock-free through the
//! atomics; completion is published once under the mutex and wakes every
//! waiter.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Status value while a transfer has not yet reached a terminal state.
pub const STATUS_PENDING: i32 = -1;
/// Terminal status for a cancelled transfer.
pub const STATUS_CANCELLED: i32 = 499;
/// Terminal status for an engine-side failure.
pub const STATUS_ENGINE_FAILURE: i32 = 500;

#[derive(Debug)]
struct Completion {
    status: i32,
    message: String,
}

/// One third-party-copy transfer, from admission to terminal status.
///
/// `H` is the engine's per-transfer handle type; the pool carries it without
/// interpreting it. Once the status becomes terminal (>= 0) it never changes
/// again.
#[derive(Debug)]
pub struct TpcRequest<H> {
    label: String,
    scitag: Option<u32>,
    handle: H,
    progress_offset: AtomicU64,
    active: AtomicBool,
    cancel: AtomicBool,
    /// Mirror of the completion status for lock-free producer polls.
    status: AtomicI32,
    completion: Mutex<Completion>,
    completion_cv: Condvar,
}

impl<H> TpcRequest<H> {
    /// Build a request for `handle`, grouped under `label`.
    ///
    /// Requests sharing a label share a queue; labels are typically derived
    /// from the remote peer so parallelism against it stays bounded. `scitag`
    /// is carried opaquely for the front end.
    pub fn new(label: impl Into<String>, scitag: Option<u32>, handle: H) -> Self {
        let label = label.into();
        debug_assert!(!label.is_empty(), "request label must be non-empty");
        Self {
            label,
            scitag,
            handle,
            progress_offset: AtomicU64::new(0),
            active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            status: AtomicI32::new(STATUS_PENDING),
            completion: Mutex::new(Completion {
                status: STATUS_PENDING,
                message: String::new(),
            }),
            completion_cv: Condvar::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scitag(&self) -> Option<u32> {
        self.scitag
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Bytes transferred so far, as last reported by the worker.
    pub fn progress(&self) -> u64 {
        self.progress_offset.load(Ordering::Acquire)
    }

    /// True once the transfer has been picked up by a worker.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Current status without blocking: [`STATUS_PENDING`] until terminal.
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn is_terminal(&self) -> bool {
        self.status() >= 0
    }

    /// Completion description; empty until the status is terminal.
    pub fn message(&self) -> String {
        self.completion.lock().message.clone()
    }

    /// Request cooperative cancellation.
    ///
    /// Does not complete the request by itself: the owning worker observes
    /// the flag within one engine wait tick and finishes the request with
    /// [`STATUS_CANCELLED`]. A request cancelled before pickup is still
    /// dispatched and completed the same way without moving any bytes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Block up to `timeout` for a terminal status.
    ///
    /// Returns the status at wake-up, which is still [`STATUS_PENDING`] when
    /// the timeout elapsed first. The predicate is re-checked on every wake.
    pub fn wait_for(&self, timeout: Duration) -> i32 {
        let mut completion = self.completion.lock();
        if completion.status < 0 {
            self.completion_cv
                .wait_while_for(&mut completion, |c| c.status < 0, timeout);
        }
        completion.status
    }

    /// Block until the status is terminal.
    pub fn wait(&self) -> i32 {
        let mut completion = self.completion.lock();
        self.completion_cv
            .wait_while(&mut completion, |c| c.status < 0);
        completion.status
    }

    /// Record transfer progress. Called only by the owning worker.
    ///
    /// Offset 0 marks the request active; the recorded offset never
    /// decreases.
    pub fn set_progress(&self, offset: u64) {
        if offset == 0 {
            self.active.store(true, Ordering::Release);
        }
        self.progress_offset.fetch_max(offset, Ordering::AcqRel);
    }

    /// Publish the terminal status and wake every waiter.
    ///
    /// A second call is a caller bug; it is logged and ignored so the first
    /// terminal value stays immutable.
    pub fn set_done(&self, status: i32, message: impl Into<String>) {
        debug_assert!(status >= 0, "terminal status must be non-negative");
        let mut completion = self.completion.lock();
        if completion.status >= 0 {
            log::warn!(
                "ignoring duplicate completion for {} (status already {})",
                self.label,
                completion.status
            );
            return;
        }
        completion.status = status;
        completion.message = message.into();
        self.status.store(status, Ordering::Release);
        self.completion_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_pending_and_inactive() {
        let request = TpcRequest::new("a.example.org", None, ());
        assert_eq!(request.status(), STATUS_PENDING);
        assert!(!request.is_terminal());
        assert!(!request.is_active());
        assert!(!request.is_cancelled());
        assert_eq!(request.progress(), 0);
        assert_eq!(request.message(), "");
    }

    #[test]
    fn set_done_is_terminal_and_immutable() {
        let request = TpcRequest::new("a.example.org", Some(42), ());
        request.set_done(0, "Transfer complete");
        assert_eq!(request.status(), 0);
        assert_eq!(request.message(), "Transfer complete");

        // The duplicate completion is ignored.
        request.set_done(500, "late failure");
        assert_eq!(request.status(), 0);
        assert_eq!(request.message(), "Transfer complete");

        // Repeated reads of a terminal status are stable.
        assert_eq!(request.status(), request.status());
    }

    #[test]
    fn wait_for_times_out_with_pending_sentinel() {
        let request = TpcRequest::new("a.example.org", None, ());
        let status = request.wait_for(Duration::from_millis(20));
        assert_eq!(status, STATUS_PENDING);
    }

    #[test]
    fn wait_for_observes_completion_from_another_thread() {
        let request = Arc::new(TpcRequest::new("a.example.org", None, ()));
        let completer = Arc::clone(&request);
        let waiter = thread::spawn(move || request.wait_for(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        completer.set_done(204, "Transfer complete");
        assert_eq!(waiter.join().unwrap(), 204);
    }

    #[test]
    fn progress_is_monotone_and_marks_active() {
        let request = TpcRequest::new("a.example.org", None, ());
        request.set_progress(0);
        assert!(request.is_active());
        request.set_progress(1024);
        request.set_progress(512);
        assert_eq!(request.progress(), 1024);
        request.set_progress(2048);
        assert_eq!(request.progress(), 2048);
        assert!(request.is_active());
    }

    #[test]
    fn cancel_sets_flag_without_completing() {
        let request = TpcRequest::new("a.example.org", None, ());
        request.cancel();
        assert!(request.is_cancelled());
        assert_eq!(request.status(), STATUS_PENDING);
    }
}
