//! Scheduling for third-party-copy (TPC) transfers.
//!
//! A storage gateway accepting TPC requests needs to bound how many outbound
//! transfers run at once, both per remote peer and process-wide, without
//! holding an OS thread per waiting client. This crate provides that core:
//! requests are grouped by a caller-supplied label into per-label queues,
//! each queue grows and shrinks its own pool of worker threads on demand,
//! and overflow is rejected so the front end can push back on clients.
//!
//! The byte-moving engine is injected through [`TransferEngine`], so the
//! scheduler can be driven by a real curl-style library in production and a
//! deterministic stub in tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tpc_pool::{PoolConfig, TpcRequest, TpcRequestManager};
//! # use tpc_pool::{EngineError, TransferCompletion, TransferEngine};
//! # struct MyEngine;
//! # impl TransferEngine for MyEngine {
//! #     type Transfer = ();
//! #     type Multi = ();
//! #     fn multi_new(&self) -> Result<(), EngineError> { Ok(()) }
//! #     fn add(&self, _: &mut (), _: &()) -> Result<(), EngineError> { Ok(()) }
//! #     fn perform(&self, _: &mut ()) -> Result<usize, EngineError> { Ok(0) }
//! #     fn info_read(&self, _: &mut ()) -> Option<TransferCompletion> { None }
//! #     fn remove(&self, _: &mut (), _: &()) {}
//! #     fn wait(&self, _: &mut (), _: Duration) -> Result<(), EngineError> { Ok(()) }
//! # }
//!
//! let manager = TpcRequestManager::new(PoolConfig::default(), Arc::new(MyEngine));
//! let request = Arc::new(TpcRequest::new("dest.example.org", None, ()));
//! if manager.produce(Arc::clone(&request)).is_ok() {
//!     let status = request.wait_for(Duration::from_secs(300));
//!     println!("transfer finished with status {status}");
//! }
//! ```

pub mod engine;
pub mod pool;

pub use engine::{EngineError, TransferCompletion, TransferEngine};
pub use pool::{
    PoolConfig, PoolError, PoolMetrics, STATUS_CANCELLED, STATUS_ENGINE_FAILURE, STATUS_PENDING,
    TpcRequest, TpcRequestManager,
};
