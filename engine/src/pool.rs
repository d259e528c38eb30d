//! Bounded worker pool for item pipelines and follow-up scheduling

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use log::error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Runs at most `size` jobs at once.
///
/// `submit` waits for a free worker, so a slow pipeline applies
/// backpressure to the task producing the work.
pub struct WorkPool {
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    active: Arc<AtomicUsize>,
}

struct ActiveJob(Arc<AtomicUsize>);

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of submitted jobs that have not finished
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for a free worker and run `job` on it
    pub async fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Work pool is closed, dropping job");
                return;
            }
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveJob(self.active.clone());

        let mut tasks = self.tasks.lock().await;
        while let Some(Some(finished)) = tasks.join_next().now_or_never() {
            if let Err(e) = finished {
                error!("Pool job failed: {}", e);
            }
        }
        tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            job.await;
        });
    }

    /// Wait until every submitted job has finished
    pub async fn join(&self) {
        loop {
            let mut tasks = self.tasks.lock().await;
            match tasks.join_next().await {
                Some(Err(e)) => error!("Pool job failed: {}", e),
                Some(Ok(())) => {}
                None => break,
            }
        }
    }
}
