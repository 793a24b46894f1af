//! Crawl orchestration engine: task lifecycle, resumable paginated crawls,
//! proxy rotation with health checks, and rate-limited, retried requests.

pub mod browser;
pub mod cli;
pub mod crawler;
pub mod error;
pub mod events;
pub mod proxy;
pub mod storage;
pub mod utils;

pub use error::{CrawlError, StorageError};
