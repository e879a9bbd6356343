pub mod error;
pub mod manager;
pub mod request;
pub mod types;

pub(crate) mod queue;
pub(crate) mod worker;

pub use error::PoolError;
pub use manager::TpcRequestManager;
pub use request::{STATUS_CANCELLED, STATUS_ENGINE_FAILURE, STATUS_PENDING, TpcRequest};
pub use types::{PoolConfig, PoolMetrics};
