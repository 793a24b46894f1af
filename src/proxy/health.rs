use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::error::CrawlError;
use crate::proxy::manager::{build_client, ClientOptions};
use crate::storage::models::Proxy;
use crate::storage::Repository;

/// Number of proxies probed concurrently in a batch
const CHECK_CONCURRENCY: usize = 16;

/// Outcome of one batch check
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: usize,
    pub deactivated: usize,
}

/// Liveness probe for pooled proxies
pub struct HealthChecker {
    repo: Arc<dyn Repository>,

    /// Echo endpoint requested through each proxy
    check_url: String,
    timeout: Duration,
    max_failures: i32,
    options: ClientOptions,
}

impl HealthChecker {
    pub fn new(
        repo: Arc<dyn Repository>,
        check_url: String,
        timeout: Duration,
        max_failures: i32,
        options: ClientOptions,
    ) -> Self {
        Self {
            repo,
            check_url,
            timeout,
            max_failures,
            options,
        }
    }

    /// Healthy iff the echo endpoint answers 200 through the proxy within the timeout
    pub async fn check_proxy(&self, proxy: &Proxy) -> bool {
        let options = ClientOptions {
            timeout: self.timeout,
            ..self.options.clone()
        };

        let client = match build_client(Some(proxy), &options) {
            Ok(client) => client,
            Err(e) => {
                warn!(proxy_id = proxy.id, "Failed to build client for proxy check: {}", e);
                return false;
            }
        };

        match client.get(&self.check_url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!(proxy_id = proxy.id, "Proxy check failed: {}", e);
                false
            }
        }
    }

    /// Persist one outcome, deactivating the proxy once it reaches `max_failures`
    pub async fn record(&self, proxy: &Proxy, healthy: bool) -> Result<Proxy, CrawlError> {
        let mut updated = self.repo.update_proxy_health(proxy.id, healthy).await?;

        if !healthy && updated.is_active && updated.failure_count >= self.max_failures {
            self.repo.set_proxy_active(proxy.id, false).await?;
            updated.is_active = false;
            warn!(
                proxy_id = proxy.id,
                failures = updated.failure_count,
                "Proxy deactivated after repeated failures"
            );
        }

        Ok(updated)
    }

    /// Probe every proxy and store the results
    pub async fn check_all(&self, proxies: &[Proxy]) -> HealthReport {
        let outcomes: futures::future::BoxFuture<'_, Vec<(&Proxy, bool)>> = Box::pin(
            stream::iter(proxies)
                .map(|proxy| async move { (proxy, self.check_proxy(proxy).await) })
                .buffer_unordered(CHECK_CONCURRENCY)
                .collect(),
        );
        let outcomes = outcomes.await;

        let mut report = HealthReport::default();
        for (proxy, healthy) in outcomes {
            if healthy {
                report.healthy += 1;
            } else {
                report.unhealthy += 1;
            }

            match self.record(proxy, healthy).await {
                Ok(updated) if !updated.is_active && proxy.is_active => report.deactivated += 1,
                Ok(_) => {}
                Err(e) => warn!(proxy_id = proxy.id, "Failed to update proxy health: {}", e),
            }
        }

        info!(
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            deactivated = report.deactivated,
            "Proxy health check finished"
        );

        report
    }
}
