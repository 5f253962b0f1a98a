//! Bounded worker pool for the slow dispatch lane.
//!
//! Vote, append and snapshot requests may block on WAL I/O, so they run
//! here instead of on the network tasks; heartbeats bypass this pool
//! entirely. A full queue rejects the request rather than queuing behind
//! storage-bound work.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::{RaftError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }
        WorkerPool { tx }
    }

    /// Queues a job without blocking; fails with `Busy` when the pool is
    /// saturated.
    pub fn try_execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .try_send(Box::pin(job))
            .map_err(|_| RaftError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(2, 16);
        let (tx, rx) = oneshot::channel();
        pool.try_execute(async move {
            let _ = tx.send(42u32);
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_saturated_queue_rejects() {
        let pool = WorkerPool::new(1, 1);
        let (block_tx, block_rx) = oneshot::channel::<()>();

        // Occupy the single worker
        pool.try_execute(async move {
            let _ = block_rx.await;
        })
        .unwrap();

        // Fill the queue until rejection; depth 1 means at most a couple
        // of accepts before Busy
        let mut rejected = false;
        for _ in 0..4 {
            if pool.try_execute(async {}).is_err() {
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        let _ = block_tx.send(());
    }
}
