use reqwest::Client;
use serde::{Serialize, Deserialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::browser::fingerprint::CompleteFingerprint;
use crate::cli::config::BrowserServiceSettings;
use crate::error::CrawlError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceRequest {
    pub url: String,
    pub fingerprint: CompleteFingerprint,

    /// Proxy URL the service should route through, if any
    pub proxy: Option<String>,
    pub take_screenshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceResponse {
    pub success: bool,
    pub url: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub links: Vec<String>,
    pub error: Option<String>,
}

/// Client for an external page rendering service
pub struct RemoteBrowserService {
    client: Client,
    base_url: String,
}

impl RemoteBrowserService {
    pub fn new(settings: &BrowserServiceSettings) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
        })
    }

    /// Render `url` remotely with the given fingerprint
    pub async fn crawl_url(
        &self,
        url: &str,
        fingerprint: &CompleteFingerprint,
        proxy: Option<String>,
    ) -> Result<BrowserServiceResponse, CrawlError> {
        let endpoint = format!("{}/crawl", self.base_url);

        let request = BrowserServiceRequest {
            url: url.to_string(),
            fingerprint: fingerprint.clone(),
            proxy,
            take_screenshot: false,
        };

        debug!("Sending request to browser service: {}", url);

        let response = self.client.post(&endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<BrowserServiceResponse>()
            .await?;

        if !response.success {
            let message = response.error.clone().unwrap_or_else(|| "unknown error".to_string());
            error!("Browser service error: {}", message);
            return Err(CrawlError::Browser(message));
        }

        debug!("Successfully rendered URL: {}", url);

        Ok(response)
    }
}
