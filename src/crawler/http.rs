use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING};
use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::fingerprint::FingerprintManager;
use crate::error::CrawlError;
use crate::proxy::manager::ProxyManager;
use crate::storage::models::Proxy;
use crate::utils::rate_limiter::DomainRateLimiter;
use crate::utils::retry::{RetryError, RetryPolicy};

/// One outbound request
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,

    /// Applied over the fingerprint headers
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// A fully read, already decompressed response
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub elapsed: Duration,

    /// Proxy the successful attempt went through
    pub proxy: Option<Proxy>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct Route {
    proxy: Option<Proxy>,
    client: Client,
}

/// Drives a request through proxy selection, rate limiting and retries.
///
/// A transport failure reports the proxy and swaps in a fresh proxy and client
/// before the next attempt, or keeps the failed route when the pool is empty.
/// Each attempt uses the route it started with.
pub struct RequestExecutor {
    proxies: Arc<ProxyManager>,
    limiter: Arc<DomainRateLimiter>,
    fingerprints: Arc<FingerprintManager>,
    retry: RetryPolicy,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RequestExecutor {
    pub fn new(
        proxies: Arc<ProxyManager>,
        limiter: Arc<DomainRateLimiter>,
        fingerprints: Arc<FingerprintManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            proxies,
            limiter,
            fingerprints,
            retry,
        }
    }

    pub fn limiter(&self) -> &DomainRateLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn fingerprints(&self) -> &FingerprintManager {
        &self.fingerprints
    }

    pub fn proxies(&self) -> &ProxyManager {
        &self.proxies
    }

    /// Proxy for a new request. Pool errors downgrade to a direct connection.
    pub async fn acquire_proxy(&self) -> Option<Proxy> {
        match self.proxies.get_proxy().await {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!("Failed to get proxy, continuing without proxy: {}", e);
                None
            }
        }
    }

    async fn route(&self) -> Result<Route, CrawlError> {
        let proxy = self.acquire_proxy().await;
        let client = self.proxies.get_http_client(proxy.as_ref())?;
        Ok(Route { proxy, client })
    }

    /// Fingerprint headers overlaid with the caller's headers
    fn headers_for(&self, spec: &RequestSpec) -> HeaderMap {
        let mut headers = self.fingerprints.random_fingerprint().header_map();
        for (name, value) in &spec.headers {
            headers.insert(name.clone(), value.clone());
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        }
        headers
    }

    /// Execute `spec`, returning the response whatever its status
    pub async fn execute(&self, token: &CancellationToken, spec: &RequestSpec) -> Result<FetchedResponse, CrawlError> {
        let route = Mutex::new(self.route().await?);
        let headers = self.headers_for(spec);

        let domain = DomainRateLimiter::domain_of(&spec.url);
        self.limiter.wait(token, &domain).await?;

        let result = self
            .retry
            .run(token, || self.attempt(token, spec, &headers, &route))
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(RetryError::Cancelled) => Err(CrawlError::Cancelled),
            Err(RetryError::Exhausted { last, .. }) => Err(last),
        }
    }

    async fn attempt(
        &self,
        token: &CancellationToken,
        spec: &RequestSpec,
        headers: &HeaderMap,
        route: &Mutex<Route>,
    ) -> Result<FetchedResponse, CrawlError> {
        let (proxy, client) = {
            let guard = lock(route);
            (guard.proxy.clone(), guard.client.clone())
        };

        let started = Instant::now();
        let send = async {
            let mut request = client
                .request(spec.method.clone(), &spec.url)
                .headers(headers.clone());
            if let Some(body) = &spec.body {
                request = request.body(body.clone());
            }

            let response = request.send().await?;
            let status = response.status().as_u16();
            let response_headers = response.headers().clone();
            let body = response.bytes().await?;

            Ok::<_, CrawlError>((status, response_headers, body.to_vec()))
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CrawlError::Cancelled),
            outcome = send => outcome,
        };

        match outcome {
            Ok((status, response_headers, body)) => {
                debug!(status, url = %spec.url, elapsed_ms = started.elapsed().as_millis() as u64, "Request finished");
                Ok(FetchedResponse {
                    status,
                    headers: response_headers,
                    body,
                    elapsed: started.elapsed(),
                    proxy,
                })
            }
            Err(e) => {
                if e.is_transport() {
                    if let Some(failed) = &proxy {
                        self.swap_proxy(failed, route).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn swap_proxy(&self, failed: &Proxy, route: &Mutex<Route>) {
        if let Err(e) = self.proxies.report_failure(failed).await {
            warn!(proxy_id = failed.id, "Failed to report proxy failure: {}", e);
        }

        // Never fall back to a direct connection mid-request.
        let proxy = match self.proxies.get_proxy().await {
            Ok(Some(proxy)) => proxy,
            Ok(None) => return,
            Err(e) => {
                warn!(proxy_id = failed.id, "No replacement proxy, keeping the failed one: {}", e);
                return;
            }
        };

        match self.proxies.get_http_client(Some(&proxy)) {
            Ok(client) => {
                debug!(from = failed.id, to = proxy.id, "Swapped proxy after transport failure");
                *lock(route) = Route {
                    proxy: Some(proxy),
                    client,
                };
            }
            Err(e) => warn!("Failed to build replacement client: {}", e),
        }
    }
}
