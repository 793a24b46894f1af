use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum number of error messages kept per run
pub const MAX_RECENT_ERRORS: usize = 100;

/// Running counters for one crawl invocation
#[derive(Debug, Clone)]
pub struct CrawlStats {
    /// Records processed so far, including the resumed offset
    pub total_processed: u64,

    /// Records persisted successfully in this run
    pub success_count: u64,

    /// Record and page failures in this run
    pub error_count: u64,

    /// First errors seen, bounded by `MAX_RECENT_ERRORS`
    pub errors: VecDeque<String>,

    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    started: Instant,
}

/// Serializable view for logging and event sinks
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub elapsed_secs: u64,
}

impl CrawlStats {
    /// Start counting from a resumed offset
    pub fn new(resumed_from: u64) -> Self {
        let now = Utc::now();
        Self {
            total_processed: resumed_from,
            success_count: 0,
            error_count: 0,
            errors: VecDeque::new(),
            start_time: now,
            last_update: now,
            started: Instant::now(),
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.last_update = Utc::now();
    }

    /// Count an error. Only the first `MAX_RECENT_ERRORS` messages are kept.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        if self.errors.len() < MAX_RECENT_ERRORS {
            self.errors.push_back(message.into());
        }
        self.last_update = Utc::now();
    }

    pub fn advance(&mut self, processed: u64) {
        self.total_processed += processed;
        self.last_update = Utc::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Estimate the time left from the average cost per item handled in this run
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let handled = self.success_count + self.error_count;
        if handled == 0 || remaining == 0 {
            return None;
        }
        let per_item = self.elapsed().as_secs_f64() / handled as f64;
        Some(Duration::from_secs_f64(per_item * remaining as f64))
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            total_processed: self.total_processed,
            success_count: self.success_count,
            error_count: self.error_count,
            elapsed_secs: self.elapsed().as_secs(),
        }
    }
}
