use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CrawlError;
use crate::storage::models::Task;

/// A way of executing a task.
///
/// `crawl` must return `CrawlError::Cancelled` promptly once `token` fires.
/// The lifecycle hooks let a strategy tear down work it owns beyond a single
/// `crawl` call, such as background monitors.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(&self, token: &CancellationToken, task: Task) -> Result<(), CrawlError>;

    fn stop(&self, _task_id: i64) {}

    fn pause(&self, _task_id: i64) {}

    fn resume(&self, _task_id: i64) {}

    /// Release everything the strategy runs in the background and wait for it
    async fn shutdown(&self) {}
}
