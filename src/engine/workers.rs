//! Bounded background worker pools
//!
//! Jobs are fire-and-forget: a failure is logged with its context and never
//! reaches the request that submitted it.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::Target;

type JobFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// One unit of background work with the context it is logged under
pub struct Job {
  op: &'static str,
  target: Target,
  task: JobFuture,
}

impl Job {
  pub fn new<F>(op: &'static str, target: Target, task: F) -> Self
  where
    F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
  {
    Self {
      op,
      target,
      task: Box::pin(task),
    }
  }
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub workers: usize,
  pub queue_capacity: usize,
  pub job_timeout: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      workers: 5,
      queue_capacity: 500,
      job_timeout: Duration::from_secs(5),
    }
  }
}

/// Pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
  pub submitted: u64,
  pub completed: u64,
  pub failed: u64,
  pub dropped: u64,
}

struct Counters {
  submitted: AtomicU64,
  completed: AtomicU64,
  failed: AtomicU64,
  dropped: AtomicU64,
  pending: AtomicUsize,
  idle: Notify,
}

impl Counters {
  fn finish(&self) {
    if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.idle.notify_waiters();
    }
  }
}

/// Fixed set of workers draining a bounded queue
pub struct WorkerPool {
  name: &'static str,
  tx: Mutex<Option<mpsc::Sender<Job>>>,
  handles: Mutex<Vec<JoinHandle<()>>>,
  counters: Arc<Counters>,
}

impl WorkerPool {
  pub fn new(name: &'static str, config: PoolConfig) -> Self {
    let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let counters = Arc::new(Counters {
      submitted: AtomicU64::new(0),
      completed: AtomicU64::new(0),
      failed: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
      pending: AtomicUsize::new(0),
      idle: Notify::new(),
    });

    let handles = (0..config.workers.max(1))
      .map(|worker| {
        let rx = rx.clone();
        let counters = counters.clone();
        let timeout = config.job_timeout;
        tokio::spawn(async move {
          loop {
            let job = { rx.lock().await.recv().await };
            let Some(job) = job else {
              break;
            };
            run_job(name, worker, job, timeout, &counters).await;
          }
          debug!(pool = name, worker, "Worker stopped");
        })
      })
      .collect();

    info!(
      pool = name,
      workers = config.workers,
      capacity = config.queue_capacity,
      "Worker pool started"
    );

    Self {
      name,
      tx: Mutex::new(Some(tx)),
      handles: Mutex::new(handles),
      counters,
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Queue a job without waiting. Returns false when it was dropped.
  pub fn submit(&self, job: Job) -> bool {
    let tx = match self.tx.lock().as_ref() {
      Some(tx) => tx.clone(),
      None => {
        warn!(
          pool = self.name,
          op = job.op,
          target_id = job.target.id,
          target_type = %job.target.kind,
          "Pool is shut down, dropping job"
        );
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        return false;
      }
    };

    self.counters.pending.fetch_add(1, Ordering::AcqRel);
    match tx.try_send(job) {
      Ok(()) => {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        true
      }
      Err(e) => {
        let job = match e {
          mpsc::error::TrySendError::Full(job) => {
            error!(
              pool = self.name,
              op = job.op,
              target_id = job.target.id,
              target_type = %job.target.kind,
              "Worker queue full, dropping job"
            );
            job
          }
          mpsc::error::TrySendError::Closed(job) => {
            warn!(pool = self.name, op = job.op, "Worker queue closed, dropping job");
            job
          }
        };
        drop(job);
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.counters.finish();
        false
      }
    }
  }

  /// Wait until every accepted job has finished.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.counters.idle.notified();
      if self.counters.pending.load(Ordering::Acquire) == 0 {
        return;
      }
      notified.await;
    }
  }

  pub fn stats(&self) -> PoolStats {
    PoolStats {
      submitted: self.counters.submitted.load(Ordering::Relaxed),
      completed: self.counters.completed.load(Ordering::Relaxed),
      failed: self.counters.failed.load(Ordering::Relaxed),
      dropped: self.counters.dropped.load(Ordering::Relaxed),
    }
  }

  /// Stop accepting jobs and wait for the queue to drain.
  pub async fn shutdown(&self) {
    self.tx.lock().take();
    let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
    for handle in handles {
      let _ = handle.await;
    }
    let stats = self.stats();
    info!(
      pool = self.name,
      completed = stats.completed,
      failed = stats.failed,
      dropped = stats.dropped,
      "Worker pool stopped"
    );
  }
}

async fn run_job(pool: &'static str, worker: usize, job: Job, timeout: Duration, counters: &Counters) {
  let Job { op, target, task } = job;
  match tokio::time::timeout(timeout, task).await {
    Ok(Ok(())) => {
      counters.completed.fetch_add(1, Ordering::Relaxed);
    }
    Ok(Err(e)) => {
      counters.failed.fetch_add(1, Ordering::Relaxed);
      error!(
        pool,
        worker,
        op,
        target_id = target.id,
        target_type = %target.kind,
        error = %e,
        "Background job failed"
      );
    }
    Err(_) => {
      counters.failed.fetch_add(1, Ordering::Relaxed);
      error!(
        pool,
        worker,
        op,
        target_id = target.id,
        target_type = %target.kind,
        timeout_ms = timeout.as_millis() as u64,
        "Background job timed out"
      );
    }
  }
  counters.finish();
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicI64;

  #[tokio::test]
  async fn test_jobs_run_and_drain() {
    let pool = WorkerPool::new("test", PoolConfig::default());
    let sum = Arc::new(AtomicI64::new(0));
    for i in 1..=10 {
      let sum = sum.clone();
      assert!(pool.submit(Job::new("add", Target::article(i), async move {
        sum.fetch_add(i, Ordering::SeqCst);
        Ok(())
      })));
    }
    pool.wait_idle().await;
    assert_eq!(sum.load(Ordering::SeqCst), 55);
    assert_eq!(pool.stats().completed, 10);
    pool.shutdown().await;
  }

  #[tokio::test]
  async fn test_failures_are_counted_not_propagated() {
    let pool = WorkerPool::new("test", PoolConfig::default());
    pool.submit(Job::new("boom", Target::reply(1), async {
      anyhow::bail!("store unavailable")
    }));
    pool.wait_idle().await;
    assert_eq!(pool.stats().failed, 1);
  }

  #[tokio::test]
  async fn test_timeout_counts_as_failure() {
    let pool = WorkerPool::new(
      "test",
      PoolConfig {
        job_timeout: Duration::from_millis(10),
        ..Default::default()
      },
    );
    pool.submit(Job::new("slow", Target::article(1), async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(())
    }));
    pool.wait_idle().await;
    assert_eq!(pool.stats().failed, 1);
  }

  #[tokio::test]
  async fn test_full_queue_drops() {
    let pool = WorkerPool::new(
      "test",
      PoolConfig {
        workers: 1,
        queue_capacity: 1,
        job_timeout: Duration::from_secs(5),
      },
    );
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mut accepted = 0;
    for _ in 0..5 {
      let gate = gate.clone();
      if pool.submit(Job::new("wait", Target::article(1), async move {
        let _permit = gate.acquire().await?;
        Ok(())
      })) {
        accepted += 1;
      }
    }
    assert!(accepted < 5);
    assert_eq!(pool.stats().dropped, 5 - accepted);
    gate.add_permits(5);
    pool.shutdown().await;
  }

  #[tokio::test]
  async fn test_submit_after_shutdown_is_rejected() {
    let pool = WorkerPool::new("test", PoolConfig::default());
    pool.shutdown().await;
    assert!(!pool.submit(Job::new("late", Target::article(1), async { Ok(()) })));
  }
}
