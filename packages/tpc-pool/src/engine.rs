//! Transfer engine abstraction.
//!
//! The pool never moves bytes itself; each worker drives its requests through
//! an injected engine shaped like a curl-style multi interface. A worker owns
//! exactly one multi coordinator and feeds it one transfer at a time. Engines
//! are assumed thread-safe per coordinator but not across coordinators, which
//! is why coordinators are never shared between workers.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by a [`TransferEngine`] implementation.
///
/// The variant messages end up verbatim in the completion message of the
/// request that hit them, so implementations should include the engine's own
/// error text.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("failed to create engine multi-handle: {0}")]
    MultiInit(String),
    #[error("failed to add transfer to engine multi-handle: {0}")]
    Add(String),
    #[error("internal engine multi-handle error: {0}")]
    Perform(String),
    #[error("engine wait failure: {0}")]
    Wait(String),
}

/// Completion message drained from a multi coordinator.
///
/// `code` is engine-defined: zero for a successful transfer, non-zero for an
/// engine-side failure. The pool records it as the request status without
/// interpreting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCompletion {
    pub code: i32,
}

/// The operations the pool requires of a transfer engine.
///
/// `Transfer` is the per-request handle prepared by the front end; the pool
/// carries it opaquely from admission to the worker that runs it. `Multi` is
/// the engine's coordinator object; dropping it releases the engine
/// resources.
pub trait TransferEngine: Send + Sync + 'static {
    type Transfer: Send + Sync;
    type Multi: Send;

    /// Create a coordinator for one worker.
    fn multi_new(&self) -> Result<Self::Multi, EngineError>;

    /// Attach a prepared transfer to the coordinator.
    fn add(&self, multi: &mut Self::Multi, transfer: &Self::Transfer) -> Result<(), EngineError>;

    /// Non-blocking progress step. Returns the number of still-running
    /// transfers on the coordinator.
    fn perform(&self, multi: &mut Self::Multi) -> Result<usize, EngineError>;

    /// Drain one completion message, if any is queued.
    fn info_read(&self, multi: &mut Self::Multi) -> Option<TransferCompletion>;

    /// Detach a transfer from the coordinator. Must be safe to call for a
    /// transfer that already completed.
    fn remove(&self, multi: &mut Self::Multi, transfer: &Self::Transfer);

    /// Block until engine activity or `timeout`, whichever comes first.
    fn wait(&self, multi: &mut Self::Multi, timeout: Duration) -> Result<(), EngineError>;
}
