pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use crate::crawler::task::TaskStatus;
use crate::error::StorageError;
use models::{NewCrawlResult, NewProxy, NewTask, ProductRecord, Proxy, Task};

/// Durable storage the engine depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Create a task in `pending` state
    async fn create_task(&self, task: NewTask) -> Result<Task, StorageError>;

    async fn get_task(&self, id: i64) -> Result<Task, StorageError>;

    /// Newest first
    async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<Task>, StorageError>;

    /// Persist name, url and config of an existing task
    async fn update_task(&self, task: &Task) -> Result<(), StorageError>;

    /// Set the status, stamping `started_at` on running and `completed_at` on completed/failed
    async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<(), StorageError>;

    async fn update_task_config(&self, id: i64, config: &str) -> Result<(), StorageError>;

    /// Insert or update a product keyed by its external id, returning the row id
    async fn upsert_product(&self, record: &ProductRecord) -> Result<i64, StorageError>;

    async fn count_products(&self) -> Result<i64, StorageError>;

    /// Payload overrides, an empty object when none were saved
    async fn get_payload_overrides(&self) -> Result<Value, StorageError>;

    async fn update_payload_overrides(&self, overrides: &Value) -> Result<(), StorageError>;

    async fn create_proxy(&self, proxy: NewProxy) -> Result<Proxy, StorageError>;

    async fn list_proxies(&self) -> Result<Vec<Proxy>, StorageError>;

    /// Active proxies, fewest failures first, then least recently checked
    async fn get_active_proxies(&self) -> Result<Vec<Proxy>, StorageError>;

    /// Record a health outcome and return the updated proxy.
    ///
    /// Healthy resets the failure counter and reactivates the proxy. Unhealthy
    /// increments the counter; deactivation is left to the caller's threshold.
    async fn update_proxy_health(&self, id: i64, healthy: bool) -> Result<Proxy, StorageError>;

    async fn set_proxy_active(&self, id: i64, active: bool) -> Result<(), StorageError>;

    async fn create_crawl_result(&self, result: NewCrawlResult) -> Result<i64, StorageError>;
}
