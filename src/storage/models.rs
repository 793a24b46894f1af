use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::crawler::task::{TaskSettings, TaskStatus, TaskType};
use crate::error::CrawlError;

/// Key of the payload overrides row in `crawler_settings`
pub const PAYLOAD_OVERRIDES_KEY: &str = "payload_overrides";

/// A crawl task as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub task_type: TaskType,
    pub status: TaskStatus,

    /// Raw JSON configuration, decoded with `TaskSettings`
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn settings(&self) -> Result<TaskSettings, CrawlError> {
        TaskSettings::parse(&self.config)
    }
}

/// Input for creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub url: String,
    pub task_type: TaskType,
    pub config: String,
}

/// Proxy scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyScheme {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "socks5" => Ok(ProxyScheme::Socks5),
            other => Err(CrawlError::Proxy(format!("unsupported proxy type: {}", other))),
        }
    }
}

/// An egress proxy with its health state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyScheme,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub is_active: bool,

    /// Consecutive failed checks or reported failures
    pub failure_count: i32,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// `host:port`, without credentials
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Input for registering a proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxy {
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyScheme,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One record from the search API, ready to be upserted by external id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub external_id: String,
    pub product_id: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub catalog: Option<String>,
    pub artist: Option<String>,
    pub rating: Option<f64>,
    pub list_price: Option<f64>,
    pub sale_price: Option<f64>,
    pub in_stock: bool,

    /// Full `_source` document
    pub raw_data: Value,
}

fn text(source: &Value, key: &str) -> Option<String> {
    match source.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(source: &Value, key: &str) -> Option<f64> {
    match source.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl ProductRecord {
    /// Map a search hit into a record, keeping the raw source
    pub fn from_hit(external_id: &str, source: &Value) -> Self {
        Self {
            external_id: external_id.to_string(),
            product_id: text(source, "productId"),
            name: text(source, "name"),
            brand: text(source, "brand"),
            catalog: text(source, "catalog"),
            artist: text(source, "artist"),
            rating: number(source, "rating"),
            list_price: number(source, "listPrice"),
            sale_price: number(source, "salePrice"),
            in_stock: source.get("inStock").and_then(Value::as_bool).unwrap_or(false),
            raw_data: source.clone(),
        }
    }
}

/// Stored product row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(flatten)]
    pub record: ProductRecord,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a single-request crawl
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCrawlResult {
    pub task_id: i64,
    pub url: String,
    pub method: String,
    pub status_code: i32,
    pub headers: Value,
    pub body: String,
    pub response_time_ms: i64,
    pub proxy_used: Option<String>,
}

/// Stored crawl result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub id: i64,
    #[serde(flatten)]
    pub result: NewCrawlResult,
    pub created_at: DateTime<Utc>,
}
