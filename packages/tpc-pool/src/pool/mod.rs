pub mod core;

pub use core::{
    PoolConfig, PoolError, PoolMetrics, STATUS_CANCELLED, STATUS_ENGINE_FAILURE, STATUS_PENDING,
    TpcRequest, TpcRequestManager,
};
