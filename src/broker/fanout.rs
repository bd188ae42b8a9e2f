//! Concurrent fan-out of one logical request to many peers.
//!
//! A [`FanOut`] is created per broker operation. Each submitted unit runs on
//! its own tokio task once it holds a permit from the shared [`WorkerPool`],
//! so the pool bounds concurrency across every in-flight operation while
//! results stay isolated per call. A unit that errors or panics becomes a
//! [`UnitResult`] with a captured error and never disturbs its siblings.

use std::{
    any::Any,
    fmt::Display,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tracing::{trace, warn};

use super::{error::BrokerError, hrn::Hrn};

/// Default bound on fan-out units running at once across the process.
pub const DEFAULT_WORKER_PERMITS: usize = 64;

/// Process-wide bound on concurrently running fan-out units.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_units: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_units.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_PERMITS)
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum UnitStatus {
    Success,
    Exception,
}

/// Outcome of one unit, tagged with the peer it ran against.
#[derive(Debug)]
pub struct UnitResult<T> {
    pub source: Hrn,
    pub elapsed: Duration,
    pub outcome: Result<T, String>,
}

impl<T> UnitResult<T> {
    pub fn status(&self) -> UnitStatus {
        match self.outcome {
            Ok(_) => UnitStatus::Success,
            Err(_) => UnitStatus::Exception,
        }
    }

    pub fn diagnostic(&self) -> AggregateDiagnostic {
        AggregateDiagnostic {
            aggregate: self.source.clone(),
            elapsed_micros: self.elapsed.as_micros() as u64,
            status: self.status(),
            error: self.outcome.as_ref().err().cloned(),
        }
    }
}

/// Per-aggregate record attached to every merged answer so callers can tell
/// partial failure from total failure.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct AggregateDiagnostic {
    pub aggregate: Hrn,
    pub elapsed_micros: u64,
    pub status: UnitStatus,
    pub error: Option<String>,
}

pub struct FanOut<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<UnitResult<T>>,
    /// Sources submitted but not yet reported, one entry per unit.
    pending: Vec<Hrn>,
    started: Instant,
}

impl<T> FanOut<T>
where
    T: Send + 'static,
{
    pub fn new(pool: &WorkerPool) -> Self {
        Self {
            permits: pool.permits.clone(),
            tasks: JoinSet::new(),
            pending: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Schedules `unit` against `source` and returns immediately.
    pub fn submit<F>(&mut self, source: Hrn, unit: F)
    where
        F: Future<Output = Result<T, BrokerError>> + Send + 'static,
    {
        let permits = self.permits.clone();
        trace!(peer = %source, pending = self.tasks.len(), "fan-out submit");
        self.pending.push(source.clone());
        self.tasks.spawn(async move {
            // the pool is never closed, so acquisition only fails on shutdown
            let _permit = permits.acquire_owned().await.ok();
            let started = Instant::now();
            let outcome = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(err.to_string()),
                Err(panic) => Err(format!("unit panicked: {}", panic_message(&*panic))),
            };
            UnitResult {
                source,
                elapsed: started.elapsed(),
                outcome,
            }
        });
    }

    /// Waits for every submitted unit. The returned order is completion
    /// order and carries no meaning. Every submitted unit yields exactly one
    /// result: a task that was cancelled or lost before reporting becomes an
    /// error result for its source.
    pub async fn join_all(mut self) -> Vec<UnitResult<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        let mut lost = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(at) = self.pending.iter().position(|hrn| hrn == &result.source) {
                        self.pending.swap_remove(at);
                    }
                    results.push(result);
                }
                Err(err) => {
                    warn!(error = %err, "fan-out task lost before reporting");
                    lost.push(err.to_string());
                }
            }
        }
        // the join error does not say which unit it was, so the reason of
        // each loss is paired with the sources that never reported
        let mut reasons = lost.into_iter();
        for source in self.pending.drain(..) {
            let reason = reasons
                .next()
                .unwrap_or_else(|| "no result".to_string());
            results.push(UnitResult {
                source,
                elapsed: self.started.elapsed(),
                outcome: Err(format!("unit lost before reporting: {}", reason)),
            });
        }
        results
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Runs `fut`, logging and discarding any error. Only used where a peer or
/// hook failure must not affect the caller (remove propagation, driver
/// cleanup).
pub async fn best_effort<T, E, F>(what: &str, peer: &Hrn, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(peer = %peer, error = %err, "{} failed, continuing", what);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn explode() -> Result<u32, BrokerError> {
        panic!("driver exploded")
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated_per_unit() {
        let pool = WorkerPool::new(4);
        let mut fanout: FanOut<u32> = FanOut::new(&pool);
        fanout.submit(Hrn::new("am1"), async { Ok(1) });
        fanout.submit(Hrn::new("am2"), async {
            Err(BrokerError::Transport("connection reset".into()))
        });
        fanout.submit(Hrn::new("am3"), async { explode() });
        fanout.submit(Hrn::new("am4"), async { Ok(4) });

        let mut results = fanout.join_all().await;
        results.sort_by(|a, b| a.source.cmp(&b.source));
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].outcome, Ok(1));
        assert_eq!(
            results[1].outcome,
            Err("transport failed: connection reset".to_string())
        );
        assert_eq!(results[2].status(), UnitStatus::Exception);
        assert!(results[2]
            .outcome
            .as_ref()
            .unwrap_err()
            .contains("driver exploded"));
        assert_eq!(results[3].outcome, Ok(4));
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_units() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut fanout: FanOut<()> = FanOut::new(&pool);
        for i in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            fanout.submit(Hrn::new(format!("am{}", i)), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let results = fanout.join_all().await;
        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn diagnostic_carries_captured_error() {
        let pool = WorkerPool::default();
        let mut fanout: FanOut<()> = FanOut::new(&pool);
        fanout.submit(Hrn::new("am"), async {
            Err(BrokerError::Remote("busy".into()))
        });
        let results = fanout.join_all().await;
        let diag = results[0].diagnostic();
        assert_eq!(diag.aggregate, Hrn::new("am"));
        assert_eq!(diag.status, UnitStatus::Exception);
        assert_eq!(diag.error.as_deref(), Some("remote failure: busy"));
    }

    #[tokio::test]
    async fn cancelled_unit_still_gets_a_diagnostic() {
        let pool = WorkerPool::default();
        let mut fanout: FanOut<u32> = FanOut::new(&pool);
        fanout.submit(Hrn::new("am1"), async { Ok(1) });
        fanout.submit(Hrn::new("am2"), futures::future::pending());
        tokio::task::yield_now().await;
        fanout.tasks.abort_all();

        let mut results = fanout.join_all().await;
        results.sort_by(|a, b| a.source.cmp(&b.source));
        assert_eq!(results.len(), 2);
        let lost = results[1].diagnostic();
        assert_eq!(lost.aggregate, Hrn::new("am2"));
        assert_eq!(lost.status, UnitStatus::Exception);
        assert!(lost
            .error
            .as_deref()
            .unwrap()
            .starts_with("unit lost before reporting"));
    }

    #[tokio::test]
    async fn best_effort_swallows_errors() {
        let peer = Hrn::new("plc");
        let ok = best_effort("noop", &peer, async { Ok::<_, BrokerError>(5) }).await;
        assert_eq!(ok, Some(5));
        let failed = best_effort("noop", &peer, async {
            Err::<u8, _>(BrokerError::Transport("down".into()))
        })
        .await;
        assert_eq!(failed, None);
    }
}
