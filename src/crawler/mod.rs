pub mod controller;
pub mod http;
pub mod paginated;
pub mod payload;
pub mod strategy;
pub mod task;
pub mod web;
pub mod worker_pool;

// Re-export common types
pub use controller::CrawlerController;
pub use paginated::PaginatedApiCrawler;
pub use strategy::Crawler;
pub use task::{TaskSettings, TaskStatus, TaskType};
