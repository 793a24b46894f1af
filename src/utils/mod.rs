pub mod logging;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;
