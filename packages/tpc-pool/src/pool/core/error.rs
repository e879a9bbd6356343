use thiserror::Error;

/// Admission-time failures returned to the producer.
///
/// `QueueFull` and `ShuttingDown` are backpressure: the caller decides the
/// user-visible response (typically 503). No request status is written for
/// either.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("transfer queue for {0} is full")]
    QueueFull(String),
    #[error("request manager is shutting down")]
    ShuttingDown,
    #[error("worker thread spawn failed: {0}")]
    SpawnFailed(String),
}
