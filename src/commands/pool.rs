//! Bounded Command Worker Pool
//!
//! Commands run on a fixed set of OS threads instead of on the Tokio
//! threads that do socket I/O, so one slow command (a `KEYS *` over a large
//! table, say) cannot stall frame decoding for other connections.
//!
//! ```text
//!  connection task ──permit──> [ crossbeam queue ] ──> worker-0
//!        ▲                                        ├──> worker-1
//!        └────────── oneshot reply ───────────────┴──> worker-N
//! ```
//!
//! Admission is bounded by a semaphore: a connection waits (asynchronously)
//! for a permit before queueing, so the queue never holds more than
//! `queue_capacity` jobs. A connection awaits each reply before submitting
//! its next command, which keeps every connection's commands in order.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned when a job cannot be run.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error("worker dropped the job without replying")]
    Canceled,
}

/// Default number of workers: one per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// A fixed-size pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    permits: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `size` worker threads accepting up to `queue_capacity`
    /// outstanding jobs.
    pub fn new(size: usize, queue_capacity: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let queue_capacity = queue_capacity.max(size);
        let (sender, receiver) = channel::bounded::<Job>(queue_capacity);

        let workers = (0..size)
            .map(|i| spawn_worker(i, receiver.clone()))
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(workers = size, queue = queue_capacity, "Worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            permits: Arc::new(Semaphore::new(queue_capacity)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `f` on a worker thread and returns its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _permit = permit;
            let _ = reply_tx.send(f());
        });

        // A held permit guarantees a free queue slot
        match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(job).map_err(|_| PoolError::Closed)?,
            None => return Err(PoolError::Closed),
        }

        reply_rx.await.map_err(|_| PoolError::Canceled)
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    pub fn shutdown(&self) {
        self.permits.close();
        if self.sender.lock().take().is_none() {
            return;
        }

        let current = std::thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        // A worker dropping the last reference to the pool cannot join itself
        for worker in workers.into_iter().filter(|w| w.thread().id() != current) {
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(index: usize, receiver: Receiver<Job>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("kvstore-worker-{}", index))
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                // The job's reply sender drops during unwind, so its caller sees `Canceled`
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        worker = index,
                        panic = panic_message(&*payload),
                        "Command panicked on worker"
                    );
                }
            }
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_result() {
        let pool = WorkerPool::new(2, 8).unwrap();
        assert_eq!(pool.size(), 2);

        let value = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_runs_off_the_calling_thread() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let name = pool
            .run(|| std::thread::current().name().map(str::to_string))
            .await
            .unwrap();

        assert_eq!(name.as_deref(), Some("kvstore-worker-0"));
    }

    #[tokio::test]
    async fn test_more_jobs_than_queue_slots() {
        let pool = Arc::new(WorkerPool::new(2, 2).unwrap());
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let done = Arc::clone(&done);
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn test_sequential_submissions_keep_order() {
        let pool = WorkerPool::new(4, 16).unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..20 {
            let log = Arc::clone(&log);
            pool.run(move || log.lock().push(i)).await.unwrap();
        }

        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_after_shutdown() {
        let pool = WorkerPool::new(1, 1).unwrap();
        pool.shutdown();
        pool.shutdown();

        assert_eq!(pool.run(|| ()).await, Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_job() {
        let pool = WorkerPool::new(1, 1).unwrap();

        let result = pool.run(|| -> u32 { panic!("boom") }).await;
        assert_eq!(result, Err(PoolError::Canceled));

        assert_eq!(pool.run(|| 7).await, Ok(7));
    }
}
