use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::strategy::Crawler;
use crate::storage::models::Task;

struct Job {
    task: Task,
    token: CancellationToken,
}

/// Fixed set of workers draining a bounded task queue
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    root: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WorkerPool {
    /// Spawn `workers` workers running `crawler`. The queue holds twice as many jobs.
    pub fn start(workers: usize, crawler: Arc<dyn Crawler>) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let root = CancellationToken::new();

        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let root = root.clone();
                let crawler = Arc::clone(&crawler);
                tokio::spawn(async move {
                    debug!(worker_id = id, "Worker started");
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                biased;
                                _ = root.cancelled() => None,
                                job = rx.recv() => job,
                            }
                        };
                        let Some(job) = job else {
                            break;
                        };

                        let task_id = job.task.id;
                        if job.token.is_cancelled() {
                            debug!(worker_id = id, task_id, "Skipping task cancelled while queued");
                            continue;
                        }
                        debug!(worker_id = id, task_id, "Worker processing task");
                        match crawler.crawl(&job.token, job.task).await {
                            Ok(()) => {}
                            Err(e) if e.is_cancelled() => debug!(worker_id = id, task_id, "Crawl cancelled"),
                            Err(e) => error!(worker_id = id, task_id, "Worker failed to crawl: {}", e),
                        }
                    }
                    debug!(worker_id = id, "Worker stopping");
                })
            })
            .collect();

        info!(workers, "Worker pool started");

        Self {
            sender: Mutex::new(Some(tx)),
            root,
            workers: Mutex::new(handles),
        }
    }

    /// Token for a job of this pool, cancelled when the pool stops
    pub fn job_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Queue `task` to run under `token`, waiting for room if the queue is full.
    ///
    /// `token` should come from [`WorkerPool::job_token`]. Returns false once
    /// shutdown has begun. A job whose token is cancelled before a worker picks
    /// it up is dropped without running.
    pub async fn submit(&self, task: Task, token: CancellationToken) -> bool {
        if self.root.is_cancelled() {
            return false;
        }
        let Some(sender) = lock(&self.sender).clone() else {
            return false;
        };

        let job = Job { task, token };
        tokio::select! {
            biased;
            _ = self.root.cancelled() => false,
            sent = sender.send(job) => sent.is_ok(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel running jobs, close the queue and wait for every worker to return
    pub async fn stop(&self) {
        self.root.cancel();
        lock(&self.sender).take();

        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{TaskStatus, TaskType};
    use crate::error::CrawlError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn task(id: i64) -> Task {
        let now = Utc::now();
        Task {
            id,
            name: format!("task {}", id),
            url: "https://example.com".into(),
            task_type: TaskType::Api,
            status: TaskStatus::Running,
            config: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Blocks until cancelled, then takes a while to wind down
    struct SlowCrawler {
        started: Arc<Notify>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Crawler for SlowCrawler {
        async fn crawl(&self, token: &CancellationToken, _task: Task) -> Result<(), CrawlError> {
            self.started.notify_one();
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Err(CrawlError::Cancelled)
        }
    }

    struct RecordingCrawler {
        inner: SlowCrawler,
        calls: mpsc::UnboundedSender<i64>,
    }

    #[async_trait]
    impl Crawler for RecordingCrawler {
        async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
            let _ = self.calls.send(task.id);
            self.inner.crawl(token, task).await
        }
    }

    struct CountingCrawler {
        calls: mpsc::UnboundedSender<i64>,
    }

    #[async_trait]
    impl Crawler for CountingCrawler {
        async fn crawl(&self, _token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
            let _ = self.calls.send(task.id);
            if task.id == 1 {
                return Err(CrawlError::MalformedResponse("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_crawls() {
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(
            2,
            Arc::new(SlowCrawler {
                started: started.clone(),
                finished: finished.clone(),
            }),
        );

        assert!(pool.submit(task(1), pool.job_token()).await);
        started.notified().await;

        pool.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(pool.is_stopped());
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(1, Arc::new(CountingCrawler { calls: tx }));

        pool.stop().await;

        assert!(!pool.submit(task(7), pool.job_token()).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_crawl_does_not_kill_the_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(1, Arc::new(CountingCrawler { calls: tx }));

        assert!(pool.submit(task(1), pool.job_token()).await);
        assert!(pool.submit(task(2), pool.job_token()).await);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        pool.stop().await;
    }

    #[tokio::test]
    async fn job_token_is_cancelled_individually() {
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(
            1,
            Arc::new(SlowCrawler {
                started: started.clone(),
                finished: finished.clone(),
            }),
        );

        let token = pool.job_token();
        assert!(pool.submit(task(3), token.clone()).await);
        started.notified().await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), async {
            while finished.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!pool.is_stopped());
        pool.stop().await;
    }

    #[tokio::test]
    async fn job_cancelled_while_queued_never_runs() {
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let (tx, mut calls) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(
            1,
            Arc::new(RecordingCrawler {
                inner: SlowCrawler {
                    started: started.clone(),
                    finished: finished.clone(),
                },
                calls: tx,
            }),
        );

        let running = pool.job_token();
        assert!(pool.submit(task(1), running.clone()).await);
        started.notified().await;

        let queued = pool.job_token();
        assert!(pool.submit(task(2), queued.clone()).await);
        queued.cancel();
        running.cancel();

        tokio::time::timeout(Duration::from_secs(2), async {
            while finished.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop().await;

        assert_eq!(calls.recv().await, Some(1));
        assert!(calls.try_recv().is_err());
    }
}
