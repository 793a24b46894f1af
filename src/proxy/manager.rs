use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, error};
use url::Url;

use crate::cli::config::{ProxySelection, ProxySettings};
use crate::error::CrawlError;
use crate::proxy::health::{HealthChecker, HealthReport};
use crate::proxy::pool::ProxyPool;
use crate::storage::models::{Proxy, ProxyScheme};
use crate::storage::Repository;

/// Connection settings shared by every client the manager builds
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

/// Proxy URL with credentials embedded in the userinfo part.
///
/// SOCKS5 proxies use `socks5h` so hostnames are resolved by the proxy.
pub fn proxy_url(proxy: &Proxy) -> Result<Url, CrawlError> {
    let scheme = match proxy.proxy_type {
        ProxyScheme::Http => "http",
        ProxyScheme::Https => "https",
        ProxyScheme::Socks5 => "socks5h",
    };

    let mut url = Url::parse(&format!("{}://{}:{}", scheme, proxy.host, proxy.port))
        .map_err(|e| CrawlError::Proxy(format!("invalid proxy address {}: {}", proxy.address(), e)))?;

    if let Some(username) = proxy.username.as_deref().filter(|u| !u.is_empty()) {
        url.set_username(username)
            .map_err(|_| CrawlError::Proxy(format!("cannot set username for {}", proxy.address())))?;
        url.set_password(proxy.password.as_deref())
            .map_err(|_| CrawlError::Proxy(format!("cannot set password for {}", proxy.address())))?;
    }

    Ok(url)
}

/// Build a pooled client, routed through `proxy` when given
pub fn build_client(proxy: Option<&Proxy>, options: &ClientOptions) -> Result<Client, CrawlError> {
    let mut builder = Client::builder()
        .timeout(options.timeout)
        .pool_max_idle_per_host(options.max_idle_per_host)
        .pool_idle_timeout(options.idle_timeout)
        .gzip(true)
        .brotli(true)
        .deflate(true);

    if let Some(proxy) = proxy {
        let url = proxy_url(proxy)?;
        let route = reqwest::Proxy::all(url.as_str())
            .map_err(|e| CrawlError::Proxy(format!("invalid proxy {}: {}", proxy.address(), e)))?;
        builder = builder.proxy(route);
    } else {
        builder = builder.no_proxy();
    }

    Ok(builder.build()?)
}

/// Proxy rotation and management
pub struct ProxyManager {
    /// Proxy configuration
    settings: ProxySettings,

    /// Active proxies
    pool: ProxyPool,

    checker: HealthChecker,
    repo: Arc<dyn Repository>,
    options: ClientOptions,
}

impl ProxyManager {
    /// Create a new proxy manager
    pub fn new(settings: ProxySettings, request_timeout: Duration, repo: Arc<dyn Repository>) -> Self {
        let options = ClientOptions {
            timeout: request_timeout,
            max_idle_per_host: settings.max_idle_per_host,
            idle_timeout: settings.idle_timeout(),
        };

        let checker = HealthChecker::new(
            repo.clone(),
            settings.check_url.clone(),
            settings.check_timeout(),
            settings.max_failures,
            options.clone(),
        );

        Self {
            settings,
            pool: ProxyPool::new(),
            checker,
            repo,
            options,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    /// Load the pool and spawn the health check loop.
    ///
    /// The loop checks immediately, then every `health_check_interval` until
    /// `token` is cancelled. Returns `None` when proxying is disabled.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<Option<JoinHandle<()>>, CrawlError> {
        if !self.settings.enabled {
            info!("Proxy rotation disabled");
            return Ok(None);
        }

        let count = self.reload().await?;
        info!(count, "Proxy manager started");

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.health_check_interval());
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Proxy health loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.run_health_check().await {
                            error!("Proxy health check failed: {}", e);
                        }
                    }
                }
            }
        });

        Ok(Some(handle))
    }

    /// Check a snapshot of the pool, then reload it from the store
    pub async fn run_health_check(&self) -> Result<HealthReport, CrawlError> {
        let snapshot = self.pool.snapshot();
        let report = self.checker.check_all(&snapshot).await;
        self.reload().await?;
        Ok(report)
    }

    /// Get a proxy for use. `None` when proxying is disabled.
    pub async fn get_proxy(&self) -> Result<Option<Proxy>, CrawlError> {
        if !self.settings.enabled {
            return Ok(None);
        }

        let proxy = match self.settings.selection {
            ProxySelection::Random => self.pool.random()?,
            ProxySelection::LeastFailures => self.pool.get(0).ok_or(CrawlError::NoProxies)?,
        };

        debug!(proxy_id = proxy.id, "Selected proxy {}", proxy.address());
        Ok(Some(proxy))
    }

    /// Client with the configured request timeout, routed through `proxy`
    pub fn get_http_client(&self, proxy: Option<&Proxy>) -> Result<Client, CrawlError> {
        build_client(proxy, &self.options)
    }

    /// Record a failure for `proxy` and refresh the pool
    pub async fn report_failure(&self, proxy: &Proxy) -> Result<(), CrawlError> {
        let updated = self.checker.record(proxy, false).await?;
        warn!(
            proxy_id = proxy.id,
            failures = updated.failure_count,
            active = updated.is_active,
            "Reported proxy failure"
        );
        self.reload().await?;
        Ok(())
    }

    /// Re-read active proxies from the store
    pub async fn reload(&self) -> Result<usize, CrawlError> {
        self.pool.load(self.repo.as_ref()).await
    }
}
