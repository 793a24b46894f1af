//! Task narration for presentation layers.
//!
//! Every message is mirrored to `tracing`; an attached [`EventSink`] receives
//! the same stream plus status changes. No sink is required.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::crawler::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Log {
        task_id: i64,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Status {
        task_id: i64,
        status: TaskStatus,
        timestamp: DateTime<Utc>,
    },
}

/// Receiver of task log lines and status changes. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, task_id: i64, level: LogLevel, message: &str);

    fn task_status(&self, task_id: i64, status: TaskStatus);
}

/// Fans events out over a broadcast channel
pub struct BroadcastSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, task_id: i64, level: LogLevel, message: &str) {
        // No subscribers is fine
        let _ = self.tx.send(EngineEvent::Log {
            task_id,
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn task_status(&self, task_id: i64, status: TaskStatus) {
        let _ = self.tx.send(EngineEvent::Status {
            task_id,
            status,
            timestamp: Utc::now(),
        });
    }
}

/// Cheap handle components use to narrate a task
#[derive(Clone, Default)]
pub struct TaskEvents {
    sink: Option<Arc<dyn EventSink>>,
}

impl TaskEvents {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self { sink }
    }

    pub fn log(&self, task_id: i64, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(task_id, "{}", message),
            LogLevel::Info => info!(task_id, "{}", message),
            LogLevel::Warn => warn!(task_id, "{}", message),
            LogLevel::Error => error!(task_id, "{}", message),
        }
        if let Some(sink) = &self.sink {
            sink.publish(task_id, level, message);
        }
    }

    pub fn info(&self, task_id: i64, message: &str) {
        self.log(task_id, LogLevel::Info, message);
    }

    pub fn warn(&self, task_id: i64, message: &str) {
        self.log(task_id, LogLevel::Warn, message);
    }

    pub fn error(&self, task_id: i64, message: &str) {
        self.log(task_id, LogLevel::Error, message);
    }

    /// Announce a status change
    pub fn status(&self, task_id: i64, status: TaskStatus) {
        info!(task_id, status = %status, "Task status changed");
        if let Some(sink) = &self.sink {
            sink.task_status(task_id, status);
        }
    }
}
