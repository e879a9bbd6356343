//! End-to-end scheduler scenarios driven by a deterministic stub engine.
//!
//! The stub gives each transfer a scripted behavior (complete, block until
//! released, fail at a specific engine step, yield no result) so the tests
//! can hold workers in flight, observe caps and backpressure, and exercise
//! every completion path without a real transfer library.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tpc_pool::{
    EngineError, PoolConfig, PoolError, STATUS_CANCELLED, STATUS_ENGINE_FAILURE, STATUS_PENDING,
    TpcRequest, TpcRequestManager, TransferCompletion, TransferEngine,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Latch a blocked transfer waits on until the test releases it.
#[derive(Default)]
struct Gate {
    released: AtomicBool,
}

impl Gate {
    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
enum Behavior {
    /// Complete on the first perform step with the given engine code.
    Complete(i32),
    /// Stay running until the gate is released, then complete with code 0.
    BlockUntil(Arc<Gate>),
    /// Refuse the add step.
    RejectAdd,
    /// Fail the perform step, poisoning the worker's multi-handle.
    FailPerform,
    /// Report nothing running without ever yielding a completion message.
    NoResult,
}

struct StubTransfer {
    behavior: Behavior,
}

struct StubMulti {
    active: Option<Behavior>,
    finished: VecDeque<TransferCompletion>,
}

struct StubEngine;

impl TransferEngine for StubEngine {
    type Transfer = StubTransfer;
    type Multi = StubMulti;

    fn multi_new(&self) -> Result<StubMulti, EngineError> {
        Ok(StubMulti {
            active: None,
            finished: VecDeque::new(),
        })
    }

    fn add(&self, multi: &mut StubMulti, transfer: &StubTransfer) -> Result<(), EngineError> {
        match &transfer.behavior {
            Behavior::RejectAdd => Err(EngineError::Add("stub engine refused the handle".into())),
            behavior => {
                multi.active = Some(behavior.clone());
                Ok(())
            }
        }
    }

    fn perform(&self, multi: &mut StubMulti) -> Result<usize, EngineError> {
        match multi.active.take() {
            None => Ok(0),
            Some(Behavior::Complete(code)) => {
                multi.finished.push_back(TransferCompletion { code });
                Ok(0)
            }
            Some(Behavior::BlockUntil(gate)) => {
                if gate.is_released() {
                    multi.finished.push_back(TransferCompletion { code: 0 });
                    Ok(0)
                } else {
                    multi.active = Some(Behavior::BlockUntil(gate));
                    Ok(1)
                }
            }
            Some(Behavior::FailPerform) => {
                Err(EngineError::Perform("stub multi-handle poisoned".into()))
            }
            Some(Behavior::NoResult) => Ok(0),
            Some(Behavior::RejectAdd) => Ok(0),
        }
    }

    fn info_read(&self, multi: &mut StubMulti) -> Option<TransferCompletion> {
        multi.finished.pop_front()
    }

    fn remove(&self, multi: &mut StubMulti, _transfer: &StubTransfer) {
        multi.active = None;
    }

    fn wait(&self, _multi: &mut StubMulti, _timeout: Duration) -> Result<(), EngineError> {
        // Short tick so cancellation tests run fast.
        thread::sleep(Duration::from_millis(2));
        Ok(())
    }
}

fn manager_with(config: PoolConfig) -> TpcRequestManager<StubEngine> {
    TpcRequestManager::new(config, Arc::new(StubEngine))
}

fn request(label: &str, behavior: Behavior) -> Arc<TpcRequest<StubTransfer>> {
    Arc::new(TpcRequest::new(label, None, StubTransfer { behavior }))
}

/// Poll `condition` every millisecond up to `timeout`.
fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn single_request_completes_without_global_limit() {
    init_logs();
    let manager = manager_with(PoolConfig::default());
    let req = request("a.example.org", Behavior::Complete(0));

    manager.produce(Arc::clone(&req)).unwrap();
    assert!(
        eventually(Duration::from_millis(50), || manager.global_thread_count() >= 1),
        "a worker should start promptly"
    );
    assert_eq!(req.wait(), 0);
    assert_eq!(req.message(), "Transfer complete");
    assert!(req.is_active());
}

#[test]
fn global_cap_bounds_worker_count_across_labels() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_global_threads: 2,
        max_workers: 10,
        idle_timeout: Duration::from_millis(100),
        ..PoolConfig::default()
    });

    let gates: Vec<Arc<Gate>> = (0..3).map(|_| Arc::new(Gate::default())).collect();
    let requests: Vec<_> = ["a.example.org", "b.example.org", "c.example.org"]
        .iter()
        .zip(&gates)
        .map(|(label, gate)| request(label, Behavior::BlockUntil(Arc::clone(gate))))
        .collect();
    for req in &requests {
        manager.produce(Arc::clone(req)).unwrap();
    }

    // Sample the counter through the contention window.
    let sample_until = Instant::now() + Duration::from_millis(100);
    while Instant::now() < sample_until {
        assert!(manager.global_thread_count() <= 2, "global cap exceeded");
        thread::sleep(Duration::from_millis(5));
    }

    for gate in &gates {
        gate.release();
    }
    for req in &requests {
        assert_eq!(req.wait_for(Duration::from_secs(5)), 0);
    }
    assert!(
        eventually(Duration::from_secs(2), || manager.global_thread_count() == 0),
        "workers should exit after the idle timeout"
    );
}

#[test]
fn full_queue_rejects_overflow() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_pending_ops: 1,
        max_workers: 1,
        ..PoolConfig::default()
    });

    let gate = Arc::new(Gate::default());
    let slow = request("dest.example.org", Behavior::BlockUntil(Arc::clone(&gate)));
    manager.produce(Arc::clone(&slow)).unwrap();
    assert!(
        eventually(Duration::from_secs(1), || slow.is_active()),
        "the slow transfer should be picked up"
    );

    let queued = request("dest.example.org", Behavior::Complete(0));
    manager.produce(Arc::clone(&queued)).unwrap();
    assert_eq!(manager.pending_depth("dest.example.org"), Some(1));

    let overflow = request("dest.example.org", Behavior::Complete(0));
    match manager.produce(Arc::clone(&overflow)) {
        Err(PoolError::QueueFull(label)) => assert_eq!(label, "dest.example.org"),
        other => panic!("expected QueueFull, got {other:?}"),
    }
    // Backpressure writes no status.
    assert_eq!(overflow.status(), STATUS_PENDING);
    assert_eq!(manager.metrics().requests_rejected.load(Ordering::Relaxed), 1);

    gate.release();
    assert_eq!(slow.wait_for(Duration::from_secs(5)), 0);
    assert_eq!(queued.wait_for(Duration::from_secs(5)), 0);
}

#[test]
fn idle_timeout_reaps_worker_and_queue() {
    init_logs();
    let manager = manager_with(PoolConfig {
        idle_timeout: Duration::from_millis(100),
        ..PoolConfig::default()
    });

    let gate = Arc::new(Gate::default());
    let req = request("a.example.org", Behavior::BlockUntil(gate));
    manager.produce(Arc::clone(&req)).unwrap();
    req.cancel();

    assert_eq!(req.wait_for(Duration::from_secs(5)), STATUS_CANCELLED);
    assert_eq!(req.message(), "cancelled");
    assert!(
        eventually(Duration::from_millis(500), || {
            manager.global_thread_count() == 0 && manager.active_labels().is_empty()
        }),
        "worker and queue should be gone after the idle timeout"
    );
    assert_eq!(manager.pending_depth("a.example.org"), None);
}

#[test]
fn requests_on_one_label_run_in_fifo_order() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_workers: 1,
        ..PoolConfig::default()
    });

    let gate = Arc::new(Gate::default());
    let first = request("peer.example.org", Behavior::BlockUntil(Arc::clone(&gate)));
    let second = request("peer.example.org", Behavior::Complete(0));

    manager.produce(Arc::clone(&first)).unwrap();
    assert!(eventually(Duration::from_secs(1), || first.is_active()));
    manager.produce(Arc::clone(&second)).unwrap();

    // The single worker is held by the first request, so the second cannot
    // have started.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(second.status(), STATUS_PENDING);
    assert!(!second.is_active());

    gate.release();
    assert_eq!(second.wait_for(Duration::from_secs(5)), 0);
    // FIFO: by the time the second finished, the first already had.
    assert!(first.is_terminal());
    assert_eq!(first.status(), 0);
}

#[test]
fn concurrent_admission_stays_within_global_cap() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_global_threads: 3,
        max_workers: 10,
        idle_timeout: Duration::from_millis(100),
        ..PoolConfig::default()
    });

    let labels = ["a.example.org", "b.example.org", "c.example.org"];
    let requests: Vec<_> = (0..10)
        .map(|i| request(labels[i % labels.len()], Behavior::Complete(0)))
        .collect();

    let producers: Vec<_> = requests
        .iter()
        .map(|req| {
            let manager = manager.clone();
            let req = Arc::clone(req);
            thread::spawn(move || manager.produce(req))
        })
        .collect();

    let watchdog = {
        let manager = manager.clone();
        thread::spawn(move || {
            let sample_until = Instant::now() + Duration::from_millis(200);
            while Instant::now() < sample_until {
                assert!(manager.global_thread_count() <= 3, "global cap exceeded");
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    for producer in producers {
        producer.join().unwrap().unwrap();
    }
    for req in &requests {
        assert_eq!(req.wait_for(Duration::from_secs(5)), 0);
    }
    watchdog.join().unwrap();
    assert_eq!(
        manager.metrics().transfers_completed.load(Ordering::Relaxed),
        10
    );
}

#[test]
fn rejected_add_fails_request_but_worker_survives() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_workers: 1,
        ..PoolConfig::default()
    });

    let bad = request("peer.example.org", Behavior::RejectAdd);
    manager.produce(Arc::clone(&bad)).unwrap();
    assert_eq!(bad.wait_for(Duration::from_secs(5)), STATUS_ENGINE_FAILURE);
    assert!(
        bad.message().contains("failed to add transfer"),
        "message should carry the engine error text, got: {}",
        bad.message()
    );

    // The same worker keeps serving the queue afterwards.
    let good = request("peer.example.org", Behavior::Complete(0));
    manager.produce(Arc::clone(&good)).unwrap();
    assert_eq!(good.wait_for(Duration::from_secs(5)), 0);
}

#[test]
fn perform_failure_is_fatal_for_worker_but_label_recovers() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_workers: 1,
        ..PoolConfig::default()
    });

    let poisoned = request("peer.example.org", Behavior::FailPerform);
    manager.produce(Arc::clone(&poisoned)).unwrap();
    assert_eq!(
        poisoned.wait_for(Duration::from_secs(5)),
        STATUS_ENGINE_FAILURE
    );
    assert!(poisoned.message().contains("multi-handle"));

    // The worker died, the queue unwound; a later request for the same label
    // gets a fresh queue and completes. Admission may briefly retry while
    // the old queue removes itself.
    let retry = request("peer.example.org", Behavior::Complete(0));
    manager.produce(Arc::clone(&retry)).unwrap();
    assert_eq!(retry.wait_for(Duration::from_secs(5)), 0);
}

#[test]
fn missing_engine_result_reports_internal_error() {
    init_logs();
    let manager = manager_with(PoolConfig::default());

    let silent = request("peer.example.org", Behavior::NoResult);
    manager.produce(Arc::clone(&silent)).unwrap();
    assert_eq!(silent.wait_for(Duration::from_secs(5)), STATUS_ENGINE_FAILURE);
    assert!(silent.message().contains("no transfer results returned"));

    // Not fatal: the worker goes on serving the queue.
    let good = request("peer.example.org", Behavior::Complete(0));
    manager.produce(Arc::clone(&good)).unwrap();
    assert_eq!(good.wait_for(Duration::from_secs(5)), 0);
}

#[test]
fn engine_result_code_becomes_request_status() {
    init_logs();
    let manager = manager_with(PoolConfig::default());

    let failed = request("peer.example.org", Behavior::Complete(28));
    manager.produce(Arc::clone(&failed)).unwrap();
    assert_eq!(failed.wait_for(Duration::from_secs(5)), 28);
    assert_eq!(failed.message(), "Transfer complete");
}

#[test]
fn shutdown_cancels_everything_and_drains_workers() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_workers: 1,
        idle_timeout: Duration::from_secs(30),
        ..PoolConfig::default()
    });

    let gate = Arc::new(Gate::default());
    let in_flight = request("a.example.org", Behavior::BlockUntil(gate));
    let queued = request("a.example.org", Behavior::Complete(0));
    manager.produce(Arc::clone(&in_flight)).unwrap();
    assert!(eventually(Duration::from_secs(1), || in_flight.is_active()));
    manager.produce(Arc::clone(&queued)).unwrap();

    assert!(
        manager.shutdown(Duration::from_secs(5)),
        "pool should drain within the timeout"
    );
    assert_eq!(manager.global_thread_count(), 0);
    assert_eq!(in_flight.status(), STATUS_CANCELLED);
    assert_eq!(queued.status(), STATUS_CANCELLED);

    let late = request("a.example.org", Behavior::Complete(0));
    assert!(matches!(
        manager.produce(late),
        Err(PoolError::ShuttingDown)
    ));
}

#[test]
fn starved_label_gets_worker_when_global_slot_frees() {
    init_logs();
    let manager = manager_with(PoolConfig {
        max_global_threads: 1,
        idle_timeout: Duration::from_millis(100),
        ..PoolConfig::default()
    });

    let gate = Arc::new(Gate::default());
    let busy = request("a.example.org", Behavior::BlockUntil(Arc::clone(&gate)));
    manager.produce(Arc::clone(&busy)).unwrap();
    assert!(eventually(Duration::from_secs(1), || busy.is_active()));

    // The second label is admitted but cannot get a worker yet.
    let starved = request("b.example.org", Behavior::Complete(0));
    manager.produce(Arc::clone(&starved)).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(starved.status(), STATUS_PENDING);
    assert_eq!(manager.pending_depth("b.example.org"), Some(1));

    // When the busy worker finishes and idles out, its slot moves on.
    gate.release();
    assert_eq!(busy.wait_for(Duration::from_secs(5)), 0);
    assert_eq!(starved.wait_for(Duration::from_secs(5)), 0);
}
