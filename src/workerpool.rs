use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::RpcError;

/// A unit of work run by the worker pool.
#[async_trait]
pub trait Job {
    async fn run(&self);
}

type BoxedJob = Box<dyn Job + Send + Sync>;

/// Fixed set of async workers pulling jobs from a bounded queue.
///
/// Must be created inside a tokio runtime.
pub struct WorkerPool {
    job_tx: flume::Sender<BoxedJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, max_jobs: usize) -> Self {
        let (job_tx, job_rx) = flume::bounded::<BoxedJob>(max_jobs.max(1));
        let workers = (0..max_workers.max(1))
            .map(|worker_id| {
                let job_rx = job_rx.clone();
                tokio::spawn(async move {
                    while let Ok(job) = job_rx.recv_async().await {
                        job.run().await;
                    }
                    debug!(worker_id, "worker pool queue closed");
                })
            })
            .collect();
        Self { job_tx, workers }
    }

    /// Queue a job without waiting. Fails when the queue is full.
    pub fn submit_job(&self, job: BoxedJob) -> Result<(), RpcError<String>> {
        self.job_tx.try_send(job).map_err(|err| match err {
            flume::TrySendError::Full(_) => {
                RpcError::InternalError("Worker pool queue is full".to_string())
            }
            flume::TrySendError::Disconnected(_) => {
                RpcError::InternalError("Worker pool is stopped".to_string())
            }
        })
    }

    /// Queue a job, waiting for room in the queue.
    pub async fn submit_job_async(&self, job: BoxedJob) -> Result<(), RpcError<String>> {
        self.job_tx
            .send_async(job)
            .await
            .map_err(|_| RpcError::InternalError("Worker pool is stopped".to_string()))
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.job_tx.len()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::sync::{mpsc, Notify};

    use super::*;

    struct CountJob {
        counter: Arc<AtomicUsize>,
        done_tx: mpsc::Sender<()>,
    }

    #[async_trait]
    impl Job for CountJob {
        async fn run(&self) {
            self.counter.fetch_add(1, Ordering::SeqCst);
            let _ = self.done_tx.send(()).await;
        }
    }

    struct BlockJob {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Job for BlockJob {
        async fn run(&self) {
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(4, 100);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(100);
        for _ in 0..20 {
            pool.submit_job_async(Box::new(CountJob {
                counter: counter.clone(),
                done_tx: done_tx.clone(),
            }))
            .await
            .unwrap();
        }
        for _ in 0..20 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.workers(), 4);
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let pool = WorkerPool::new(1, 1);
        let release = Arc::new(Notify::new());
        pool.submit_job(Box::new(BlockJob {
            release: release.clone(),
        }))
        .unwrap();
        // Let the worker pick up the first job.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.submit_job(Box::new(BlockJob {
            release: release.clone(),
        }))
        .unwrap();
        assert_eq!(pool.queued(), 1);
        let err = pool
            .submit_job(Box::new(BlockJob {
                release: release.clone(),
            }))
            .unwrap_err();
        assert_eq!(err, RpcError::InternalError("Worker pool queue is full".to_string()));
        release.notify_waiters();
    }
}
