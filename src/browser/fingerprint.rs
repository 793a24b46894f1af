use std::collections::HashMap;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};
use serde::{Serialize, Deserialize};

use crate::cli::config::BrowserFingerprint;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,es;q=0.8",
    "es-ES,es;q=0.9,en;q=0.8",
];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Madrid",
    "Asia/Tokyo",
    "Australia/Sydney",
];

const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
    (1600, 900),
];

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Browser fingerprint generator and manager
pub struct FingerprintManager {
    /// Available fingerprints to use
    fingerprints: Vec<BrowserFingerprint>,
}

/// Viewport dimensions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Complete browser fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub headers: HashMap<String, String>,
    pub timezone: String,
    pub color_depth: u32,
}

fn platform_of(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Win32"
    } else if user_agent.contains("Macintosh") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

/// Fingerprints used when the configuration lists none
pub fn builtin_fingerprints() -> Vec<BrowserFingerprint> {
    USER_AGENTS
        .iter()
        .enumerate()
        .map(|(i, ua)| BrowserFingerprint {
            name: format!("builtin_{}", i),
            user_agent: ua.to_string(),
            accept_language: String::new(),
            platform: platform_of(ua).to_string(),
            extra_headers: HashMap::new(),
        })
        .collect()
}

impl FingerprintManager {
    /// Create a new fingerprint manager, falling back to the built-in set
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Self {
        let fingerprints = if fingerprints.is_empty() {
            builtin_fingerprints()
        } else {
            fingerprints
        };
        Self { fingerprints }
    }

    /// Select a random fingerprint
    pub fn random_fingerprint(&self) -> CompleteFingerprint {
        let mut rng = thread_rng();
        match self.fingerprints.choose(&mut rng) {
            Some(fingerprint) => self.complete_fingerprint(fingerprint),
            // `new` never leaves the list empty
            None => self.complete_fingerprint(&builtin_fingerprints()[0]),
        }
    }

    /// Complete a basic fingerprint with randomized details
    fn complete_fingerprint(&self, fingerprint: &BrowserFingerprint) -> CompleteFingerprint {
        let mut rng = thread_rng();

        let (width, height) = VIEWPORTS[rng.gen_range(0..VIEWPORTS.len())];
        let accept_language = if fingerprint.accept_language.is_empty() {
            ACCEPT_LANGUAGES[rng.gen_range(0..ACCEPT_LANGUAGES.len())].to_string()
        } else {
            fingerprint.accept_language.clone()
        };

        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), fingerprint.user_agent.clone());
        headers.insert("Accept-Language".to_string(), accept_language.clone());
        headers.insert("Accept".to_string(), ACCEPT_HTML.to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        headers.insert("Sec-Fetch-Site".to_string(), "none".to_string());
        headers.insert("Sec-Fetch-Mode".to_string(), "navigate".to_string());
        headers.insert("Sec-Fetch-User".to_string(), "?1".to_string());
        headers.insert("Sec-Fetch-Dest".to_string(), "document".to_string());
        headers.insert("Cache-Control".to_string(), "max-age=0".to_string());
        headers.insert("DNT".to_string(), "1".to_string());

        for (key, value) in &fingerprint.extra_headers {
            headers.insert(key.clone(), value.clone());
        }

        let complete = CompleteFingerprint {
            name: fingerprint.name.clone(),
            user_agent: fingerprint.user_agent.clone(),
            accept_language,
            platform: fingerprint.platform.clone(),
            viewport: Viewport { width, height },
            headers,
            timezone: TIMEZONES[rng.gen_range(0..TIMEZONES.len())].to_string(),
            color_depth: 24,
        };

        debug!("Generated fingerprint: {}", complete.name);

        complete
    }
}

impl CompleteFingerprint {
    /// Headers as a request header map. Invalid entries are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (key, value) in &self.headers {
            match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!("Skipping invalid fingerprint header: {}", key),
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{ACCEPT_LANGUAGE, USER_AGENT};

    #[test]
    fn empty_configuration_uses_builtin_profiles() {
        let manager = FingerprintManager::new(Vec::new());
        let fingerprint = manager.random_fingerprint();

        assert!(USER_AGENTS.contains(&fingerprint.user_agent.as_str()));
        assert!(ACCEPT_LANGUAGES.contains(&fingerprint.accept_language.as_str()));
        assert!(VIEWPORTS.contains(&(fingerprint.viewport.width, fingerprint.viewport.height)));
    }

    #[test]
    fn configured_profile_and_extra_headers_are_applied() {
        let mut extra = HashMap::new();
        extra.insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());
        let manager = FingerprintManager::new(vec![BrowserFingerprint {
            name: "desk".into(),
            user_agent: "TestAgent/1.0".into(),
            accept_language: "de-DE".into(),
            platform: "Win32".into(),
            extra_headers: extra,
        }]);

        let headers = manager.random_fingerprint().header_map();
        assert_eq!(headers[USER_AGENT], "TestAgent/1.0");
        assert_eq!(headers[ACCEPT_LANGUAGE], "de-DE");
        assert_eq!(headers["x-requested-with"], "XMLHttpRequest");
        assert_eq!(headers["dnt"], "1");
    }
}
