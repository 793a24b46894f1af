//! Task lifecycle orchestration.
//!
//! The controller owns the state machine side of a crawl: it validates
//! transitions, persists status, and hands execution either to a dedicated job
//! (paginated tasks) or to the worker pool (single-request tasks). Each run has
//! its own cancellation token, kept in a map keyed by task id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::http::RequestExecutor;
use super::paginated::PaginatedApiCrawler;
use super::strategy::Crawler;
use super::task::{TaskEvent, TaskStatus, TransitionError};
use super::web::{ApiCrawler, BrowserCrawler, WebCrawler};
use super::worker_pool::WorkerPool;
use crate::browser::fingerprint::FingerprintManager;
use crate::browser::remote::RemoteBrowserService;
use crate::cli::config::EngineConfig;
use crate::error::{CrawlError, StorageError};
use crate::events::TaskEvents;
use crate::proxy::manager::ProxyManager;
use crate::storage::models::Task;
use crate::storage::Repository;
use crate::utils::rate_limiter::DomainRateLimiter;
use crate::utils::retry::RetryPolicy;

const RECOVERY_PAGE_SIZE: i64 = 200;

type ActiveRuns = Arc<Mutex<HashMap<i64, CancellationToken>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn transition_error(id: i64, source: TransitionError) -> CrawlError {
    match source {
        TransitionError::AlreadyRunning => CrawlError::AlreadyRunning(id),
        source => CrawlError::Transition { id, source },
    }
}

/// Status bookkeeping shared by the controller and running jobs
#[derive(Clone)]
struct Lifecycle {
    repo: Arc<dyn Repository>,
    events: TaskEvents,
    active: ActiveRuns,
}

impl Lifecycle {
    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<(), CrawlError> {
        self.repo.update_task_status(task_id, status).await?;
        self.events.status(task_id, status);
        Ok(())
    }

    /// Record how a run ended.
    ///
    /// A run whose token was cancelled leaves status to whoever cancelled it.
    async fn finish(&self, task_id: i64, token: &CancellationToken, result: Result<(), CrawlError>) {
        if token.is_cancelled() {
            debug!(task_id, "Run ended after cancellation");
            return;
        }
        lock(&self.active).remove(&task_id);

        let event = match &result {
            Ok(()) => TaskEvent::Succeed,
            Err(e) => {
                self.events.error(task_id, &format!("Task failed: {}", e));
                TaskEvent::Fail
            }
        };

        let current = match self.repo.get_task(task_id).await {
            Ok(task) => task.status,
            Err(e) => {
                error!(task_id, "Failed to load task after run: {}", e);
                return;
            }
        };

        match current.transition(event) {
            Ok(next) => {
                if let Err(e) = self.set_status(task_id, next).await {
                    error!(task_id, "Failed to record final status: {}", e);
                    return;
                }
                if next == TaskStatus::Completed {
                    self.events
                        .info(task_id, &format!("Task {} completed successfully", task_id));
                }
            }
            Err(e) => debug!(task_id, "Keeping status {}: {}", current, e),
        }
    }
}

/// Finalizes task status for crawls run by the worker pool
struct TrackedCrawler {
    inner: Arc<dyn Crawler>,
    lifecycle: Lifecycle,
}

#[async_trait]
impl Crawler for TrackedCrawler {
    async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
        let task_id = task.id;
        let result = self.inner.crawl(token, task).await;
        self.lifecycle.finish(task_id, token, result).await;
        Ok(())
    }

    fn stop(&self, task_id: i64) {
        self.inner.stop(task_id);
    }

    fn pause(&self, task_id: i64) {
        self.inner.pause(task_id);
    }

    fn resume(&self, task_id: i64) {
        self.inner.resume(task_id);
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

/// Crawl orchestration engine
pub struct CrawlerController {
    repo: Arc<dyn Repository>,
    events: TaskEvents,
    lifecycle: Lifecycle,
    paginated: Arc<dyn Crawler>,
    single: Arc<dyn Crawler>,
    pool: WorkerPool,
    proxies: Option<Arc<ProxyManager>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl CrawlerController {
    /// Wire the full engine from configuration
    pub fn new(config: &EngineConfig, repo: Arc<dyn Repository>, events: TaskEvents) -> Result<Self, CrawlError> {
        let proxies = Arc::new(ProxyManager::new(
            config.proxy.clone(),
            config.crawler.request_timeout(),
            Arc::clone(&repo),
        ));
        let limiter = Arc::new(DomainRateLimiter::from_settings(&config.rate_limit)?);
        let fingerprints = Arc::new(FingerprintManager::new(config.browser.fingerprints.clone()));
        let http = Arc::new(RequestExecutor::new(
            Arc::clone(&proxies),
            limiter,
            fingerprints,
            RetryPolicy::from(&config.retry),
        ));

        let paginated = PaginatedApiCrawler::new(
            Arc::clone(&repo),
            Arc::clone(&http),
            config.api.clone(),
            config.crawler.page_error_delay(),
            events.clone(),
        );

        let browser = if config.browser.service.enabled {
            let service = RemoteBrowserService::new(&config.browser.service)?;
            Some(BrowserCrawler::new(Arc::clone(&repo), Arc::clone(&http), service, events.clone()))
        } else {
            None
        };
        let web = WebCrawler::new(ApiCrawler::new(Arc::clone(&repo), http, events.clone()), browser);

        let mut controller = Self::from_parts(
            repo,
            events,
            Arc::new(paginated),
            Arc::new(web),
            config.crawler.max_workers,
        );
        controller.proxies = Some(proxies);
        Ok(controller)
    }

    /// Assemble the engine around explicit strategies
    pub fn from_parts(
        repo: Arc<dyn Repository>,
        events: TaskEvents,
        paginated: Arc<dyn Crawler>,
        single: Arc<dyn Crawler>,
        workers: usize,
    ) -> Self {
        let lifecycle = Lifecycle {
            repo: Arc::clone(&repo),
            events: events.clone(),
            active: Arc::new(Mutex::new(HashMap::new())),
        };
        let tracked = TrackedCrawler {
            inner: Arc::clone(&single),
            lifecycle: lifecycle.clone(),
        };

        Self {
            repo,
            events,
            lifecycle,
            paginated,
            single,
            pool: WorkerPool::start(workers, Arc::new(tracked)),
            proxies: None,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn proxy_manager(&self) -> Option<&Arc<ProxyManager>> {
        self.proxies.as_ref()
    }

    pub async fn task(&self, task_id: i64) -> Result<Task, CrawlError> {
        self.repo.get_task(task_id).await.map_err(|e| match e {
            StorageError::NotFound { .. } => CrawlError::TaskNotFound(task_id),
            other => other.into(),
        })
    }

    pub fn is_active(&self, task_id: i64) -> bool {
        lock(&self.lifecycle.active).contains_key(&task_id)
    }

    pub fn active_tasks(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.lifecycle.active).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Start a task. Rejected while it is running.
    pub async fn start(&self, task_id: i64) -> Result<(), CrawlError> {
        self.launch(task_id, TaskEvent::Start).await
    }

    /// Start a paused or stopped task again, from its resume cursor if any
    pub async fn resume(&self, task_id: i64) -> Result<(), CrawlError> {
        self.paginated.resume(task_id);
        self.single.resume(task_id);
        self.launch(task_id, TaskEvent::Resume).await
    }

    async fn launch(&self, task_id: i64, event: TaskEvent) -> Result<(), CrawlError> {
        let mut task = self.task(task_id).await?;
        let previous = task.status;
        let next = previous
            .transition(event)
            .map_err(|e| transition_error(task_id, e))?;

        let paginated = match task.settings() {
            Ok(settings) => settings.is_paginated(),
            Err(e) => {
                self.events
                    .warn(task_id, &format!("Unreadable task configuration, using defaults: {}", e));
                false
            }
        };

        // Pooled runs use a pool child token so a pool shutdown reaches them too.
        let token = if paginated {
            CancellationToken::new()
        } else {
            self.pool.job_token()
        };
        {
            let mut active = lock(&self.lifecycle.active);
            if active.contains_key(&task_id) {
                return Err(CrawlError::AlreadyRunning(task_id));
            }
            active.insert(task_id, token.clone());
        }

        if let Err(e) = self.lifecycle.set_status(task_id, next).await {
            lock(&self.lifecycle.active).remove(&task_id);
            return Err(e);
        }
        self.events.info(task_id, &format!("Task {} started", task_id));
        task.status = next;

        if paginated {
            let crawler = Arc::clone(&self.paginated);
            let lifecycle = self.lifecycle.clone();
            let handle = tokio::spawn(async move {
                let result = crawler.crawl(&token, task).await;
                lifecycle.finish(task_id, &token, result).await;
            });

            let mut jobs = lock(&self.jobs);
            jobs.retain(|job| !job.is_finished());
            jobs.push(handle);
            return Ok(());
        }

        // A stop or pause while waiting for queue room cancels `token`, and the
        // worker then drops the job unrun.
        if self.pool.submit(task, token.clone()).await {
            return Ok(());
        }

        // The pool is shutting down. Undo the start unless a canceller already
        // recorded its own status.
        lock(&self.lifecycle.active).remove(&task_id);
        if self.task(task_id).await?.status == next {
            self.lifecycle.set_status(task_id, previous).await?;
        }
        Err(CrawlError::ShuttingDown)
    }

    fn cancel_run(&self, task_id: i64) -> bool {
        match lock(&self.lifecycle.active).remove(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the run and the incremental monitor, then mark the task stopped
    pub async fn stop(&self, task_id: i64) -> Result<(), CrawlError> {
        let task = self.task(task_id).await?;
        let next = task
            .status
            .transition(TaskEvent::Stop)
            .map_err(|e| transition_error(task_id, e))?;

        let was_running = self.cancel_run(task_id);
        self.paginated.stop(task_id);
        self.single.stop(task_id);

        self.lifecycle.set_status(task_id, next).await?;
        self.events.info(task_id, &format!("Task {} stopped", task_id));
        debug!(task_id, was_running, "Stop handled");
        Ok(())
    }

    /// Halt the run but keep its resume cursor
    pub async fn pause(&self, task_id: i64) -> Result<(), CrawlError> {
        let task = self.task(task_id).await?;
        let next = task
            .status
            .transition(TaskEvent::Pause)
            .map_err(|e| transition_error(task_id, e))?;

        self.cancel_run(task_id);
        self.paginated.pause(task_id);
        self.single.pause(task_id);

        self.lifecycle.set_status(task_id, next).await?;
        self.events.info(task_id, &format!("Task {} paused", task_id));
        Ok(())
    }

    /// Mark tasks left `running` by a previous process as `paused`
    pub async fn recover_interrupted(&self) -> Result<usize, CrawlError> {
        let mut recovered = 0;
        let mut offset = 0;

        loop {
            let page = self.repo.list_tasks(RECOVERY_PAGE_SIZE, offset).await?;
            for task in &page {
                if task.status != TaskStatus::Running || self.is_active(task.id) {
                    continue;
                }
                self.lifecycle.set_status(task.id, TaskStatus::Paused).await?;
                self.events.warn(
                    task.id,
                    "Task was interrupted and has been paused; resume to continue",
                );
                recovered += 1;
            }

            if (page.len() as i64) < RECOVERY_PAGE_SIZE {
                break;
            }
            offset += RECOVERY_PAGE_SIZE;
        }

        if recovered > 0 {
            info!(recovered, "Recovered interrupted tasks");
        }
        Ok(recovered)
    }

    /// Pause active tasks, then wait for every job and monitor to return
    pub async fn shutdown(&self) {
        for task_id in self.active_tasks() {
            if let Err(e) = self.pause(task_id).await {
                warn!(task_id, "Failed to pause task during shutdown: {}", e);
            }
        }

        // A run that completed just before the pause may still start a monitor.
        let jobs = std::mem::take(&mut *lock(&self.jobs));
        for job in jobs {
            if let Err(e) = job.await {
                error!("Crawl job ended abnormally: {}", e);
            }
        }
        self.paginated.shutdown().await;
        self.single.shutdown().await;
        self.pool.stop().await;
        info!("Crawler controller stopped");
    }
}
