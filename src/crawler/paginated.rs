//! Resumable crawl over the paginated search API.
//!
//! Pages are fetched strictly in increasing `from` order. The cursor is
//! checkpointed before every request so an interrupted run resumes near the
//! last completed page. After a full run an incremental monitor polls the
//! upstream total and fetches only the records beyond the last known total.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::{RequestExecutor, RequestSpec};
use super::payload::encode_payload;
use super::strategy::Crawler;
use super::task::TaskSettings;
use crate::cli::config::ApiSettings;
use crate::error::CrawlError;
use crate::events::TaskEvents;
use crate::storage::models::{ProductRecord, Task};
use crate::storage::Repository;
use crate::utils::metrics::{CrawlStats, StatsSummary};
use crate::utils::rate_limiter::DomainRateLimiter;
use crate::utils::retry::RetryError;

/// `hits.total` comes either as `{ "value": n }` or as a bare number
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum HitTotal {
    Object { value: u64 },
    Count(u64),
}

impl HitTotal {
    pub fn value(&self) -> u64 {
        match self {
            HitTotal::Object { value } => *value,
            HitTotal::Count(value) => *value,
        }
    }
}

impl Default for HitTotal {
    fn default() -> Self {
        HitTotal::Count(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchHits {
    #[serde(default)]
    pub total: HitTotal,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    pub hits: SearchHits,
}

/// Result of one pass over the pages
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub total_available: u64,
    pub summary: StatsSummary,
}

/// Ordered, non-blocking writer for the resume cursor of one run
struct CheckpointWriter {
    tx: mpsc::UnboundedSender<Option<u64>>,
    handle: JoinHandle<()>,
}

impl CheckpointWriter {
    fn spawn(repo: Arc<dyn Repository>, task_id: i64, mut settings: TaskSettings) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<u64>>();

        let handle = tokio::spawn(async move {
            while let Some(cursor) = rx.recv().await {
                settings.last_from = cursor;
                let written = match settings.to_json() {
                    Ok(json) => repo.update_task_config(task_id, &json).await.map_err(CrawlError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!(task_id, "Failed to persist resume cursor: {}", e);
                }
            }
        });

        Self { tx, handle }
    }

    fn record(&self, from: u64) {
        let _ = self.tx.send(Some(from));
    }

    /// Flush pending writes. A completed run also clears the cursor.
    async fn finish(self, completed: bool) {
        let Self { tx, handle } = self;
        if completed {
            let _ = tx.send(None);
        }
        drop(tx);
        if let Err(e) = handle.await {
            warn!("Checkpoint writer ended abnormally: {}", e);
        }
    }
}

/// Crawler for tasks with `crawler_type = "paginated_api"`
#[derive(Clone)]
pub struct PaginatedApiCrawler {
    repo: Arc<dyn Repository>,
    http: Arc<RequestExecutor>,
    settings: ApiSettings,
    headers: HeaderMap,
    page_error_delay: Duration,
    events: TaskEvents,
    monitors: Arc<Mutex<Monitors>>,
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Running monitors plus cancelled ones that may still be winding down
#[derive(Default)]
struct Monitors {
    running: HashMap<i64, Monitor>,
    stopping: Vec<JoinHandle<()>>,
}

fn api_headers(settings: &ApiSettings) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &settings.headers {
        match (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping invalid API header {}", name),
        }
    }

    if let Some(token) = &settings.auth_token {
        match HeaderValue::from_str(token) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Skipping invalid API auth token"),
        }
    }

    if let Some(cookies) = settings.cookies.as_deref().filter(|c| !c.is_empty()) {
        match HeaderValue::from_str(cookies) {
            Ok(value) => {
                headers.insert(COOKIE, value);
            }
            Err(_) => warn!("Skipping invalid API cookies"),
        }
    }

    headers
}

async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> Result<(), CrawlError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CrawlError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl PaginatedApiCrawler {
    pub fn new(
        repo: Arc<dyn Repository>,
        http: Arc<RequestExecutor>,
        settings: ApiSettings,
        page_error_delay: Duration,
        events: TaskEvents,
    ) -> Self {
        let headers = api_headers(&settings);
        Self {
            repo,
            http,
            settings,
            headers,
            page_error_delay,
            events,
            monitors: Arc::new(Mutex::new(Monitors::default())),
        }
    }

    fn monitors(&self) -> std::sync::MutexGuard<'_, Monitors> {
        match self.monitors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn domain(&self) -> String {
        DomainRateLimiter::domain_of(&self.settings.base_url)
    }

    /// Overrides are optional; a broken store falls back to the bare template
    async fn load_overrides(&self, task_id: i64) -> Value {
        match self.repo.get_payload_overrides().await {
            Ok(overrides) => overrides,
            Err(e) => {
                self.events
                    .warn(task_id, &format!("Failed to load payload overrides, using defaults: {}", e));
                Value::Null
            }
        }
    }

    /// Issue one page request and decode it
    async fn request_page(&self, token: &CancellationToken, body: Vec<u8>) -> Result<SearchResponse, CrawlError> {
        let spec = RequestSpec {
            method: Method::POST,
            url: self.settings.base_url.clone(),
            headers: self.headers.clone(),
            body: Some(body),
        };

        let response = self.http.execute(token, &spec).await?;
        if response.status != 200 {
            return Err(CrawlError::UnexpectedStatus {
                status: response.status,
                body: truncate(&response.text(), 512),
            });
        }

        serde_json::from_slice(&response.body).map_err(|e| CrawlError::MalformedResponse(e.to_string()))
    }

    /// Persist one record, retrying transient store failures
    async fn save_record(&self, token: &CancellationToken, hit: &SearchHit, stats: &mut CrawlStats) -> Result<(), CrawlError> {
        let record = ProductRecord::from_hit(&hit.id, &hit.source);
        let saved = self
            .http
            .retry_policy()
            .run(token, || self.repo.upsert_product(&record))
            .await;

        match saved {
            Ok(_) => stats.record_success(),
            Err(RetryError::Cancelled) => return Err(CrawlError::Cancelled),
            Err(RetryError::Exhausted { last, .. }) => {
                debug!(external_id = %hit.id, "Failed to save product: {}", last);
                stats.record_error(format!("product {}: {}", hit.id, last));
            }
        }
        Ok(())
    }

    /// Page loop starting at `from`.
    ///
    /// Page failures are counted and retried after `page_error_delay`. Only
    /// cancellation and payload construction end the loop with an error.
    async fn run_pages(
        &self,
        token: &CancellationToken,
        task_id: i64,
        mut from: u64,
        overrides: &Value,
        checkpoint: Option<&CheckpointWriter>,
    ) -> Result<RunOutcome, CrawlError> {
        let page_size = self.settings.page_size;
        let batch_size = self.settings.batch_size.max(1);
        let domain = self.domain();

        let mut stats = CrawlStats::new(from);
        let mut total_available: Option<u64> = None;
        let mut page_number: u64 = 0;

        loop {
            if token.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }

            if let Some(checkpoint) = checkpoint {
                checkpoint.record(from);
            }

            let body = encode_payload(from, page_size, overrides)?;
            let response = match self.request_page(token, body).await {
                Ok(response) => response,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    stats.record_error(format!("page at {}: {}", from, e));
                    self.events
                        .error(task_id, &format!("Failed to fetch page at offset {}: {}", from, e));
                    sleep_or_cancel(token, self.page_error_delay).await?;
                    continue;
                }
            };

            let available = match total_available {
                Some(total) => total,
                None => {
                    let total = response.hits.total.value();
                    self.events
                        .info(task_id, &format!("Total products available: {}", total));
                    total_available = Some(total);
                    total
                }
            };

            let hits = response.hits.hits;
            if hits.is_empty() {
                debug!(task_id, from, "Empty page, no more records");
                break;
            }
            page_number += 1;

            for (index, batch) in hits.chunks(batch_size).enumerate() {
                for hit in batch {
                    self.save_record(token, hit, &mut stats).await?;
                }
                debug!(task_id, from, batch = index + 1, size = batch.len(), "Saved batch");
            }

            let count = hits.len() as u64;
            stats.advance(count);
            let remaining = available.saturating_sub(stats.total_processed);
            let eta = stats
                .eta(remaining)
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "unknown".to_string());
            self.events.info(
                task_id,
                &format!(
                    "Page {}: {} products processed (Total: {}/{} Remaining: {}) - Estimated time remaining: {}",
                    page_number, count, stats.total_processed, available, remaining, eta
                ),
            );

            if stats.total_processed >= available || count < page_size {
                break;
            }

            from += page_size;

            if token.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            self.http.limiter().wait(token, &domain).await?;

            let jitter = {
                let low = self.settings.jitter_min_ms;
                let high = self.settings.jitter_max_ms.max(low);
                rand::thread_rng().gen_range(low..=high)
            };
            sleep_or_cancel(token, Duration::from_millis(jitter)).await?;
        }

        Ok(RunOutcome {
            total_available: total_available.unwrap_or(stats.total_processed),
            summary: stats.summary(),
        })
    }

    /// Full run of `task` from its resume cursor.
    ///
    /// Completion clears the cursor and starts the incremental monitor.
    pub async fn run_task(&self, token: &CancellationToken, task: &Task) -> Result<RunOutcome, CrawlError> {
        let settings = task.settings()?;
        let start = settings.resume_state().last_from;

        if start > 0 {
            self.events
                .info(task.id, &format!("Resuming paginated crawl from offset {}", start));
        } else {
            self.events.info(task.id, "Starting paginated crawl");
        }

        let overrides = self.load_overrides(task.id).await;
        let checkpoint = CheckpointWriter::spawn(Arc::clone(&self.repo), task.id, settings);

        let outcome = match self.run_pages(token, task.id, start, &overrides, Some(&checkpoint)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                checkpoint.finish(false).await;
                return Err(e);
            }
        };
        checkpoint.finish(true).await;

        let summary = &outcome.summary;
        self.events.info(
            task.id,
            &format!(
                "Crawl completed: {} products processed (Success: {}, Errors: {}) in {}s",
                summary.total_processed, summary.success_count, summary.error_count, summary.elapsed_secs
            ),
        );

        self.start_monitor(task.clone(), outcome.total_available);
        Ok(outcome)
    }

    /// Spawn the incremental monitor for `task`. No-op if one is running.
    ///
    /// The first check happens one interval after the call.
    pub fn start_monitor(&self, task: Task, known_total: u64) {
        let task_id = task.id;
        let period = self.settings.check_interval().max(Duration::from_secs(1));
        {
            let mut monitors = self.monitors();
            if monitors.running.contains_key(&task_id) {
                debug!(task_id, "Monitor already running");
                return;
            }
            let token = CancellationToken::new();
            let handle = tokio::spawn(self.clone().monitor(task, known_total, period, token.clone()));
            monitors.running.insert(task_id, Monitor { token, handle });
        }

        self.events.info(
            task_id,
            &format!("Monitoring for new products every {}s", period.as_secs()),
        );
    }

    async fn monitor(self, task: Task, known_total: u64, period: Duration, token: CancellationToken) {
        let mut baseline = known_total;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.check_for_new_records(&token, &task, baseline).await {
                        Ok(total) => baseline = total,
                        Err(e) if e.is_cancelled() => break,
                        Err(e) => self
                            .events
                            .warn(task.id, &format!("Incremental check failed: {}", e)),
                    }
                }
            }
        }
        debug!(task_id = task.id, "Monitor stopped");
    }

    /// Cancel the monitor of `task_id`, if any
    pub fn stop_monitor(&self, task_id: i64) -> bool {
        let mut monitors = self.monitors();
        let Some(monitor) = monitors.running.remove(&task_id) else {
            return false;
        };
        monitor.token.cancel();
        monitors.stopping.retain(|handle| !handle.is_finished());
        monitors.stopping.push(monitor.handle);
        true
    }

    /// Cancel every monitor and wait until none is left running a check
    pub async fn stop_all_monitors(&self) {
        let handles = {
            let mut monitors = self.monitors();
            let mut handles = std::mem::take(&mut monitors.stopping);
            for (_, monitor) in monitors.running.drain() {
                monitor.token.cancel();
                handles.push(monitor.handle);
            }
            handles
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Monitor ended abnormally: {}", e);
            }
        }
    }

    pub fn has_monitor(&self, task_id: i64) -> bool {
        self.monitors().running.contains_key(&task_id)
    }

    /// Compare the upstream total with `known_total` and fetch what is new.
    ///
    /// Returns the total to use as the next baseline.
    pub async fn check_for_new_records(
        &self,
        token: &CancellationToken,
        task: &Task,
        known_total: u64,
    ) -> Result<u64, CrawlError> {
        let overrides = self.load_overrides(task.id).await;
        let body = encode_payload(0, 1, &overrides)?;
        let current = self.request_page(token, body).await?.hits.total.value();

        if current <= known_total {
            self.events.info(
                task.id,
                &format!("No new products found. Current total: {}", current),
            );
            return Ok(known_total);
        }

        self.events.info(
            task.id,
            &format!(
                "Found {} new products (last total {}, current total {}). Starting incremental crawl from position {}",
                current - known_total,
                known_total,
                current,
                known_total
            ),
        );

        let outcome = self.run_pages(token, task.id, known_total, &overrides, None).await?;
        self.events.info(
            task.id,
            &format!(
                "Incremental crawl completed: {} products saved",
                outcome.summary.success_count
            ),
        );

        Ok(outcome.total_available.max(current))
    }
}

#[async_trait]
impl Crawler for PaginatedApiCrawler {
    async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
        self.run_task(token, &task).await.map(|_| ())
    }

    fn stop(&self, task_id: i64) {
        self.stop_monitor(task_id);
    }

    fn pause(&self, task_id: i64) {
        self.stop_monitor(task_id);
    }

    async fn shutdown(&self) {
        self.stop_all_monitors().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fingerprint::FingerprintManager;
    use crate::cli::config::ProxySettings;
    use crate::crawler::task::TaskType;
    use crate::proxy::manager::ProxyManager;
    use crate::storage::memory::InMemoryRepository;
    use crate::storage::models::NewTask;
    use crate::utils::retry::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(start: u64, count: u64, total: u64) -> Value {
        let hits: Vec<Value> = (start..start + count)
            .map(|i| json!({ "_id": format!("p{}", i), "_source": { "productId": i, "name": format!("Design {}", i) } }))
            .collect();
        json!({ "hits": { "total": { "value": total }, "hits": hits } })
    }

    fn crawler(server: &MockServer, repo: Arc<InMemoryRepository>) -> PaginatedApiCrawler {
        let settings = ApiSettings {
            base_url: format!("{}/prdsrch", server.uri()),
            page_size: 100,
            batch_size: 40,
            check_interval_secs: 3600,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            ..ApiSettings::default()
        };
        let proxies = ProxySettings {
            enabled: false,
            ..ProxySettings::default()
        };
        let http = RequestExecutor::new(
            Arc::new(ProxyManager::new(proxies, Duration::from_secs(5), repo.clone())),
            Arc::new(DomainRateLimiter::new(100).unwrap()),
            Arc::new(FingerprintManager::new(Vec::new())),
            RetryPolicy::new(2, 2.0, Duration::from_millis(1), Duration::from_millis(5)),
        );
        PaginatedApiCrawler::new(repo, Arc::new(http), settings, Duration::from_millis(10), TaskEvents::default())
    }

    async fn task_with_config(repo: &InMemoryRepository, config: Value) -> Task {
        repo.create_task(NewTask {
            name: "designs".into(),
            url: "https://www.embroiderydesigns.com".into(),
            task_type: TaskType::Api,
            config: config.to_string(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn resumed_run_fetches_only_remaining_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prdsrch"))
            .and(body_partial_json(json!({ "from": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 100, 250)))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 100, "size": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(100, 100, 250)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 200, "size": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(200, 50, 250)))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api", "last_from": 100 })).await;
        let crawler = crawler(&server, repo.clone());

        let outcome = crawler.run_task(&CancellationToken::new(), &task).await.unwrap();

        assert_eq!(outcome.total_available, 250);
        assert_eq!(outcome.summary.total_processed, 250);
        assert_eq!(outcome.summary.success_count, 150);
        assert_eq!(repo.products().len(), 150);
        assert!(repo.products().contains_key("p249"));

        let cursors: Vec<Option<u64>> = repo
            .config_writes(task.id)
            .iter()
            .map(|raw| TaskSettings::parse(raw).unwrap().last_from)
            .collect();
        assert_eq!(cursors, vec![Some(100), Some(200), None]);

        let stored = TaskSettings::parse(&repo.get_task(task.id).await.unwrap().config).unwrap();
        assert_eq!(stored.crawler_type.as_deref(), Some("paginated_api"));

        assert!(crawler.has_monitor(task.id));
        assert!(crawler.stop_monitor(task.id));
        assert!(!crawler.has_monitor(task.id));
    }

    #[tokio::test]
    async fn monitor_fetches_only_records_beyond_known_total() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 0, "size": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 1, 300)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 250, "size": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(250, 50, 300)))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api" })).await;
        let crawler = crawler(&server, repo.clone());

        let baseline = crawler
            .check_for_new_records(&CancellationToken::new(), &task, 250)
            .await
            .unwrap();

        assert_eq!(baseline, 300);
        assert_eq!(repo.products().len(), 50);
        assert!(repo.products().contains_key("p250"));
        assert!(repo.config_writes(task.id).is_empty());
    }

    #[tokio::test]
    async fn unchanged_total_keeps_baseline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "size": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 1, 250)))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({})).await;
        let crawler = crawler(&server, repo.clone());

        let baseline = crawler
            .check_for_new_records(&CancellationToken::new(), &task, 250)
            .await
            .unwrap();

        assert_eq!(baseline, 250);
        assert!(repo.products().is_empty());
    }

    #[tokio::test]
    async fn malformed_page_is_counted_and_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 30, 30)))
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api" })).await;
        let crawler = crawler(&server, repo.clone());

        let outcome = crawler.run_task(&CancellationToken::new(), &task).await.unwrap();
        crawler.stop_monitor(task.id);

        assert_eq!(outcome.summary.error_count, 1);
        assert_eq!(outcome.summary.success_count, 30);
        assert_eq!(repo.products().len(), 30);
    }

    #[tokio::test]
    async fn overrides_are_merged_into_page_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 0, "size": 100, "track_total_hits": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 0, 0)))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        repo.update_payload_overrides(&json!({ "from": 999, "track_total_hits": false }))
            .await
            .unwrap();
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api" })).await;
        let crawler = crawler(&server, repo.clone());

        let outcome = crawler.run_task(&CancellationToken::new(), &task).await.unwrap();
        crawler.stop_monitor(task.id);

        assert_eq!(outcome.summary.total_processed, 0);
    }

    #[tokio::test]
    async fn cancelled_run_keeps_cursor() {
        let server = MockServer::start().await;
        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api", "last_from": 300 })).await;
        let crawler = crawler(&server, repo.clone());

        let token = CancellationToken::new();
        token.cancel();
        let result = crawler.run_task(&token, &task).await;

        assert!(matches!(result, Err(CrawlError::Cancelled)));
        let stored = TaskSettings::parse(&repo.get_task(task.id).await.unwrap().config).unwrap();
        assert_eq!(stored.last_from, Some(300));
        assert!(!crawler.has_monitor(task.id));
    }

    async fn search_bodies(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|request| serde_json::from_slice(&request.body).ok())
            .collect()
    }

    fn count_from(bodies: &[Value], from: u64, size: u64) -> usize {
        bodies
            .iter()
            .filter(|body| body["from"] == json!(from) && body["size"] == json!(size))
            .count()
    }

    #[tokio::test]
    async fn monitor_waits_an_interval_then_adopts_the_new_total() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 0, "size": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 0, 300)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 250, "size": 100 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(250, 50, 300)))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api" })).await;
        let mut crawler = crawler(&server, repo.clone());
        crawler.settings.check_interval_secs = 1;

        crawler.start_monitor(task.clone(), 250);
        crawler.start_monitor(task.clone(), 250);
        assert!(crawler.has_monitor(task.id));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(search_bodies(&server).await.is_empty());

        // The third check starting means the second one, which must not refetch, is done.
        tokio::time::timeout(Duration::from_secs(6), async {
            while count_from(&search_bodies(&server).await, 0, 1) < 3 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("monitor did not keep checking");
        crawler.stop_all_monitors().await;

        let bodies = search_bodies(&server).await;
        assert_eq!(count_from(&bodies, 250, 100), 1);
        assert_eq!(repo.products().len(), 50);
        assert!(!crawler.has_monitor(task.id));
    }

    #[tokio::test]
    async fn stopping_monitors_waits_for_the_incremental_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 0, "size": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(0, 0, 300)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "from": 250 })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(250, 50, 300))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task_with_config(&repo, json!({ "crawler_type": "paginated_api" })).await;
        let mut crawler = crawler(&server, repo.clone());
        crawler.settings.check_interval_secs = 1;
        let idle_refs = Arc::strong_count(&repo);

        crawler.start_monitor(task.clone(), 250);
        tokio::time::timeout(Duration::from_secs(5), async {
            while count_from(&search_bodies(&server).await, 250, 100) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("incremental run never started");
        assert!(Arc::strong_count(&repo) > idle_refs);

        assert!(crawler.stop_monitor(task.id));
        tokio::time::timeout(Duration::from_secs(2), crawler.stop_all_monitors())
            .await
            .expect("monitor did not stop");

        // The monitor task, and its handle on the repository, is gone.
        assert_eq!(Arc::strong_count(&repo), idle_refs);
        assert!(repo.products().is_empty());
    }

    #[test]
    fn total_accepts_object_or_number() {
        let wrapped: SearchResponse = serde_json::from_value(json!({ "hits": { "total": { "value": 7, "relation": "eq" }, "hits": [] } })).unwrap();
        let bare: SearchResponse = serde_json::from_value(json!({ "hits": { "total": 7, "hits": [] } })).unwrap();

        assert_eq!(wrapped.hits.total.value(), 7);
        assert_eq!(bare.hits.total.value(), 7);
    }

    #[test]
    fn api_headers_include_auth_and_cookies() {
        let settings = ApiSettings {
            auth_token: Some("Basic abc".into()),
            cookies: Some("CountryCode=US".into()),
            ..ApiSettings::default()
        };
        let headers = api_headers(&settings);

        assert_eq!(headers[AUTHORIZATION], "Basic abc");
        assert_eq!(headers[COOKIE], "CountryCode=US");
        assert!(headers.contains_key("content-type"));
    }
}
