//! Fixed-size worker pool for bounded parallel I/O inside a step.
//!
//! Workers pull jobs from a shared FIFO queue and await each job fully
//! before taking the next, so at most `size` jobs are ever in flight.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool worker panicked: {0}")]
    WorkerPanicked(String),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    /// Create a pool. A size of zero is treated as one.
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `worker` over every job and wait for all of them.
    ///
    /// Results come back in job order.
    pub async fn run<T, R, F, Fut>(&self, jobs: Vec<T>, worker: F) -> Result<Vec<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = jobs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let queue: Arc<Mutex<VecDeque<(usize, T)>>> =
            Arc::new(Mutex::new(jobs.into_iter().enumerate().collect()));

        let mut set: JoinSet<Vec<(usize, R)>> = JoinSet::new();
        for _ in 0..self.size.min(total) {
            let queue = Arc::clone(&queue);
            let worker = worker.clone();
            set.spawn(async move {
                let mut finished = Vec::new();
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, job)) = next else {
                        break;
                    };
                    finished.push((index, worker(job).await));
                }
                finished
            });
        }

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let finished = joined.map_err(|e| PoolError::WorkerPanicked(e.to_string()))?;
            for (index, result) in finished {
                slots[index] = Some(result);
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}
