use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::config::RateLimitSettings;
use crate::error::CrawlError;

type Limiter = Arc<DefaultDirectRateLimiter>;

/// Token-bucket throttling with a global budget and optional per-host budgets.
///
/// Every request consumes from the global bucket. Hosts with a registered rate
/// additionally consume from their own bucket. Burst equals the rate.
pub struct DomainRateLimiter {
    global: Limiter,
    domains: RwLock<HashMap<String, Limiter>>,
}

fn limiter(rps: u32) -> Result<Limiter, CrawlError> {
    let rate = NonZeroU32::new(rps)
        .ok_or_else(|| CrawlError::Config("rate limit must be greater than zero".to_string()))?;
    Ok(Arc::new(RateLimiter::direct(Quota::per_second(rate))))
}

impl DomainRateLimiter {
    /// Create a limiter with a global requests-per-second ceiling
    pub fn new(global_rps: u32) -> Result<Self, CrawlError> {
        Ok(Self {
            global: limiter(global_rps)?,
            domains: RwLock::new(HashMap::new()),
        })
    }

    /// Build from settings, registering every configured host rate
    pub fn from_settings(settings: &RateLimitSettings) -> Result<Self, CrawlError> {
        let limiter = Self::new(settings.global_rps)?;
        for (domain, rps) in &settings.domains {
            limiter.set_domain_rate(domain, *rps)?;
        }
        Ok(limiter)
    }

    /// Register or replace the rate for a single host
    pub fn set_domain_rate(&self, domain: &str, rps: u32) -> Result<(), CrawlError> {
        let bucket = limiter(rps)?;
        if let Ok(mut domains) = self.domains.write() {
            domains.insert(domain.to_ascii_lowercase(), bucket);
        }
        debug!(domain, rps, "Registered domain rate limit");
        Ok(())
    }

    fn domain_limiter(&self, domain: &str) -> Option<Limiter> {
        self.domains
            .read()
            .ok()
            .and_then(|domains| domains.get(&domain.to_ascii_lowercase()).cloned())
    }

    /// Wait until both the global and the host budget admit one request
    pub async fn wait(&self, token: &CancellationToken, domain: &str) -> Result<(), CrawlError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CrawlError::Cancelled),
            _ = self.global.until_ready() => {}
        }

        if let Some(bucket) = self.domain_limiter(domain) {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(CrawlError::Cancelled),
                _ = bucket.until_ready() => {}
            }
        }

        Ok(())
    }

    /// Host part of a URL, used as the limiter key
    pub fn domain_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn throughput_is_bounded_by_global_rate() {
        let limiter = DomainRateLimiter::new(10).unwrap();
        let token = CancellationToken::new();
        let start = Instant::now();

        // 10 requests are covered by the burst, the remaining 5 need ~0.5s.
        for _ in 0..15 {
            limiter.wait(&token, "example.com").await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn domain_override_does_not_slow_other_domains() {
        let limiter = DomainRateLimiter::new(1000).unwrap();
        limiter.set_domain_rate("slow.example", 2).unwrap();
        let token = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..20 {
            limiter.wait(&token, "fast.example").await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200));

        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait(&token, "slow.example").await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn cancelled_wait_returns_promptly() {
        let limiter = DomainRateLimiter::new(1).unwrap();
        let token = CancellationToken::new();
        limiter.wait(&token, "example.com").await.unwrap();

        token.cancel();
        let start = Instant::now();
        let result = limiter.wait(&token, "example.com").await;

        assert!(matches!(result, Err(CrawlError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(DomainRateLimiter::new(0).is_err());
        assert_eq!(DomainRateLimiter::domain_of("https://www.example.com/a?b=1"), "www.example.com");
    }
}
