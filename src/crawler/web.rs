//! Single-request strategies for `api` and `web` tasks.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::http::{RequestExecutor, RequestSpec};
use super::strategy::Crawler;
use super::task::{TaskSettings, TaskType};
use crate::browser::remote::RemoteBrowserService;
use crate::error::CrawlError;
use crate::events::TaskEvents;
use crate::proxy::manager::proxy_url;
use crate::storage::models::{NewCrawlResult, Proxy, Task};
use crate::storage::Repository;
use crate::utils::rate_limiter::DomainRateLimiter;
use crate::utils::retry::RetryError;

/// `<title>` of an HTML document, if it has one
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|title| title.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty())
}

fn proxy_label(proxy: &Proxy) -> String {
    format!("{}://{}", proxy.proxy_type.as_str(), proxy.address())
}

/// Task settings, falling back to defaults when the blob is broken
fn settings_or_default(task: &Task, events: &TaskEvents) -> TaskSettings {
    match task.settings() {
        Ok(settings) => settings,
        Err(e) => {
            events.warn(task.id, &format!("Failed to parse task config, using defaults: {}", e));
            TaskSettings::default()
        }
    }
}

fn header_map(headers: &std::collections::HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            map.insert(name, value);
        } else {
            warn!("Skipping invalid task header {}", name);
        }
    }
    map
}

/// Plain HTTP GET of the task URL
pub struct ApiCrawler {
    repo: Arc<dyn Repository>,
    http: Arc<RequestExecutor>,
    events: TaskEvents,
}

impl ApiCrawler {
    pub fn new(repo: Arc<dyn Repository>, http: Arc<RequestExecutor>, events: TaskEvents) -> Self {
        Self { repo, http, events }
    }
}

#[async_trait]
impl Crawler for ApiCrawler {
    async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
        let settings = settings_or_default(&task, &self.events);
        let spec = RequestSpec {
            method: Method::GET,
            url: task.url.clone(),
            headers: header_map(&settings.headers),
            body: None,
        };

        let response = self.http.execute(token, &spec).await?;
        let body = response.text();

        let mut headers = Map::new();
        for (name, value) in &response.headers {
            if headers.contains_key(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }

        let title = extract_title(&body);
        self.repo
            .create_crawl_result(NewCrawlResult {
                task_id: task.id,
                url: task.url.clone(),
                method: spec.method.to_string(),
                status_code: i32::from(response.status),
                headers: Value::Object(headers),
                body,
                response_time_ms: response.elapsed.as_millis() as i64,
                proxy_used: response.proxy.as_ref().map(proxy_label),
            })
            .await?;

        self.events.info(
            task.id,
            &format!(
                "Fetched {} (status {}) in {}ms{}",
                task.url,
                response.status,
                response.elapsed.as_millis(),
                title.map(|t| format!(": {}", t)).unwrap_or_default()
            ),
        );
        Ok(())
    }
}

/// Renders the task URL through the remote browser service
pub struct BrowserCrawler {
    repo: Arc<dyn Repository>,
    http: Arc<RequestExecutor>,
    service: RemoteBrowserService,
    events: TaskEvents,
}

impl BrowserCrawler {
    pub fn new(
        repo: Arc<dyn Repository>,
        http: Arc<RequestExecutor>,
        service: RemoteBrowserService,
        events: TaskEvents,
    ) -> Self {
        Self {
            repo,
            http,
            service,
            events,
        }
    }
}

#[async_trait]
impl Crawler for BrowserCrawler {
    async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
        let fingerprint = self.http.fingerprints().random_fingerprint();
        let proxy = self.http.acquire_proxy().await;
        let proxy_address = match &proxy {
            Some(proxy) => Some(proxy_url(proxy)?.to_string()),
            None => None,
        };

        self.http
            .limiter()
            .wait(token, &DomainRateLimiter::domain_of(&task.url))
            .await?;

        let started = Instant::now();
        let render = self.http.retry_policy().run(token, || {
            self.service
                .crawl_url(&task.url, &fingerprint, proxy_address.clone())
        });
        let rendered = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CrawlError::Cancelled),
            rendered = render => rendered,
        };
        let page = match rendered {
            Ok(page) => page,
            Err(RetryError::Cancelled) => return Err(CrawlError::Cancelled),
            Err(RetryError::Exhausted { last, .. }) => return Err(last),
        };
        let elapsed = started.elapsed();

        self.repo
            .create_crawl_result(NewCrawlResult {
                task_id: task.id,
                url: page.url.clone(),
                method: "GET".to_string(),
                status_code: i32::from(page.status_code.unwrap_or(200)),
                headers: Value::Object(Map::new()),
                body: page.content.clone(),
                response_time_ms: elapsed.as_millis() as i64,
                proxy_used: proxy.as_ref().map(proxy_label),
            })
            .await?;

        self.events.info(
            task.id,
            &format!(
                "Rendered {} with profile {} in {}ms: {} ({} links)",
                task.url,
                fingerprint.name,
                elapsed.as_millis(),
                page.title,
                page.links.len()
            ),
        );
        Ok(())
    }
}

/// Picks the single-request strategy from the task type
pub struct WebCrawler {
    api: ApiCrawler,
    browser: Option<BrowserCrawler>,
}

impl WebCrawler {
    /// Without a browser crawler, `web` tasks fall back to plain HTTP
    pub fn new(api: ApiCrawler, browser: Option<BrowserCrawler>) -> Self {
        Self { api, browser }
    }

    fn strategy_for(&self, task_type: TaskType) -> &dyn Crawler {
        match (task_type, &self.browser) {
            (TaskType::Web, Some(browser)) => browser as &dyn Crawler,
            _ => &self.api,
        }
    }
}

#[async_trait]
impl Crawler for WebCrawler {
    async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError> {
        self.strategy_for(task.task_type).crawl(token, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fingerprint::FingerprintManager;
    use crate::cli::config::{BrowserServiceSettings, ProxySettings};
    use crate::proxy::manager::ProxyManager;
    use crate::storage::memory::InMemoryRepository;
    use crate::storage::models::NewTask;
    use crate::utils::retry::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor(repo: Arc<InMemoryRepository>) -> Arc<RequestExecutor> {
        let proxies = ProxySettings {
            enabled: false,
            ..ProxySettings::default()
        };
        Arc::new(RequestExecutor::new(
            Arc::new(ProxyManager::new(proxies, Duration::from_secs(5), repo)),
            Arc::new(DomainRateLimiter::new(100).unwrap()),
            Arc::new(FingerprintManager::new(Vec::new())),
            RetryPolicy::new(2, 2.0, Duration::from_millis(1), Duration::from_millis(5)),
        ))
    }

    async fn task(repo: &InMemoryRepository, url: String, task_type: TaskType, config: Value) -> Task {
        repo.create_task(NewTask {
            name: "page".into(),
            url,
            task_type,
            config: config.to_string(),
        })
        .await
        .unwrap()
    }

    #[test]
    fn title_is_extracted_and_trimmed() {
        assert_eq!(
            extract_title("<html><head><title>  Designs \n</title></head></html>").as_deref(),
            Some("Designs")
        );
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn api_crawler_stores_response_with_task_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/catalog"))
            .and(header("x-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-served-by", "edge-1")
                    .set_body_string("<title>Catalog</title>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task(
            &repo,
            format!("{}/catalog", server.uri()),
            TaskType::Api,
            json!({ "headers": { "x-api-key": "secret" } }),
        )
        .await;
        let crawler = ApiCrawler::new(repo.clone(), executor(repo.clone()), TaskEvents::default());

        crawler.crawl(&CancellationToken::new(), task.clone()).await.unwrap();

        let results = repo.crawl_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, task.id);
        assert_eq!(results[0].status_code, 200);
        assert_eq!(results[0].method, "GET");
        assert_eq!(results[0].headers["x-served-by"], "edge-1");
        assert_eq!(results[0].body, "<title>Catalog</title>");
        assert!(results[0].proxy_used.is_none());
    }

    #[tokio::test]
    async fn web_task_without_browser_falls_back_to_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let task = task(&repo, server.uri(), TaskType::Web, json!({})).await;
        let web = WebCrawler::new(
            ApiCrawler::new(repo.clone(), executor(repo.clone()), TaskEvents::default()),
            None,
        );

        web.crawl(&CancellationToken::new(), task).await.unwrap();

        assert_eq!(repo.crawl_results()[0].status_code, 404);
    }

    #[tokio::test]
    async fn web_task_is_rendered_by_browser_service() {
        let service = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "url": "https://example.com/",
                "status_code": 200,
                "title": "Example",
                "content": "<html>rendered</html>",
                "links": ["https://example.com/a"],
                "error": null
            })))
            .expect(1)
            .mount(&service)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let http = executor(repo.clone());
        let remote = RemoteBrowserService::new(&BrowserServiceSettings {
            enabled: true,
            url: service.uri(),
            timeout_secs: 5,
        })
        .unwrap();
        let web = WebCrawler::new(
            ApiCrawler::new(repo.clone(), http.clone(), TaskEvents::default()),
            Some(BrowserCrawler::new(repo.clone(), http, remote, TaskEvents::default())),
        );
        let task = task(&repo, "https://example.com/".into(), TaskType::Web, json!({})).await;

        web.crawl(&CancellationToken::new(), task).await.unwrap();

        let results = repo.crawl_results();
        assert_eq!(results[0].body, "<html>rendered</html>");
        assert_eq!(results[0].status_code, 200);
    }

    #[tokio::test]
    async fn unreachable_target_fails_after_retries() {
        let repo = Arc::new(InMemoryRepository::new());
        let task = task(&repo, "http://127.0.0.1:1/".into(), TaskType::Api, json!({})).await;
        let crawler = ApiCrawler::new(repo.clone(), executor(repo.clone()), TaskEvents::default());

        let result = crawler.crawl(&CancellationToken::new(), task).await;

        assert!(matches!(result, Err(CrawlError::Http(_))));
        assert!(repo.crawl_results().is_empty());
    }
}
