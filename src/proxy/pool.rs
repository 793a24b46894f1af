use std::sync::RwLock;

use rand::{thread_rng, Rng};
use tracing::debug;

use crate::error::CrawlError;
use crate::storage::models::Proxy;
use crate::storage::Repository;

/// In-memory set of active proxies
#[derive(Default)]
pub struct ProxyPool {
    proxies: RwLock<Vec<Proxy>>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the active proxies from the store
    pub async fn load(&self, repo: &dyn Repository) -> Result<usize, CrawlError> {
        let proxies = repo.get_active_proxies().await?;
        let count = proxies.len();

        if let Ok(mut guard) = self.proxies.write() {
            *guard = proxies;
        }

        debug!(count, "Loaded proxy pool");
        Ok(count)
    }

    /// Uniformly random proxy
    pub fn random(&self) -> Result<Proxy, CrawlError> {
        let guard = self.proxies.read().map_err(|_| CrawlError::NoProxies)?;
        if guard.is_empty() {
            return Err(CrawlError::NoProxies);
        }

        let mut rng = thread_rng();
        Ok(guard[rng.gen_range(0..guard.len())].clone())
    }

    /// Proxy at `index`, in store order (fewest failures first)
    pub fn get(&self, index: usize) -> Option<Proxy> {
        self.proxies.read().ok()?.get(index).cloned()
    }

    pub fn add(&self, proxy: Proxy) {
        if let Ok(mut guard) = self.proxies.write() {
            guard.push(proxy);
        }
    }

    /// Remove a proxy by id, returning whether it was present
    pub fn remove(&self, id: i64) -> bool {
        match self.proxies.write() {
            Ok(mut guard) => {
                let before = guard.len();
                guard.retain(|p| p.id != id);
                guard.len() != before
            }
            Err(_) => false,
        }
    }

    /// Copy of all proxies
    pub fn snapshot(&self) -> Vec<Proxy> {
        self.proxies.read().map(|guard| guard.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
