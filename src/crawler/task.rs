use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

use crate::error::CrawlError;

/// Strategy key selecting the resumable paginated API crawler
pub const PAGINATED_API: &str = "paginated_api";

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

/// Events that move a task between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    Resume,
    Succeed,
    Fail,
    Stop,
    Pause,
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("task is already running")]
    AlreadyRunning,

    #[error("cannot apply {event:?} to a {from} task")]
    Invalid { from: TaskStatus, event: TaskEvent },
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }

    /// Completed and failed runs cannot change except by being started again
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Apply an event, returning the next status
    pub fn transition(self, event: TaskEvent) -> Result<TaskStatus, TransitionError> {
        use TaskEvent::*;
        use TaskStatus::*;

        match (self, event) {
            (Running, Start | Resume) => Err(TransitionError::AlreadyRunning),
            (_, Start | Resume) => Ok(Running),
            (Running, Succeed) => Ok(Completed),
            (Running, Fail) => Ok(Failed),
            (_, Stop) => Ok(Stopped),
            (Pending | Running | Paused, Pause) => Ok(Paused),
            (from, event) => Err(TransitionError::Invalid { from, event }),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "stopped" => Ok(TaskStatus::Stopped),
            other => Err(CrawlError::Config(format!("unknown task status: {}", other))),
        }
    }
}

/// Kind of target a task points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Api,
    Web,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Api => "api",
            TaskType::Web => "web",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(TaskType::Api),
            "web" => Ok(TaskType::Web),
            other => Err(CrawlError::Config(format!("unknown task type: {}", other))),
        }
    }
}

/// Typed view over a task's JSON configuration blob.
///
/// Unknown keys are carried through untouched so writing the blob back never
/// drops settings owned by someone else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Strategy key, `paginated_api` selects the paginated crawler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_type: Option<String>,

    /// Resume cursor of an interrupted paginated run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_from: Option<u64>,

    /// Extra request headers for single-request strategies
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a paginated run picks up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeState {
    pub last_from: u64,
}

impl TaskSettings {
    /// Decode the raw blob. Empty input means no settings.
    pub fn parse(raw: &str) -> Result<Self, CrawlError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| CrawlError::Config(format!("invalid task configuration: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, CrawlError> {
        serde_json::to_string(self).map_err(CrawlError::Payload)
    }

    pub fn is_paginated(&self) -> bool {
        self.crawler_type.as_deref() == Some(PAGINATED_API)
    }

    pub fn resume_state(&self) -> ResumeState {
        ResumeState {
            last_from: self.last_from.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_rejected_only_while_running() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Stopped,
        ] {
            assert_eq!(status.transition(TaskEvent::Start), Ok(TaskStatus::Running));
            assert_eq!(status.transition(TaskEvent::Resume), Ok(TaskStatus::Running));
        }
        assert_eq!(
            TaskStatus::Running.transition(TaskEvent::Start),
            Err(TransitionError::AlreadyRunning)
        );
    }

    #[test]
    fn run_outcomes_only_apply_to_running_tasks() {
        assert_eq!(TaskStatus::Running.transition(TaskEvent::Succeed), Ok(TaskStatus::Completed));
        assert_eq!(TaskStatus::Running.transition(TaskEvent::Fail), Ok(TaskStatus::Failed));
        assert!(TaskStatus::Stopped.transition(TaskEvent::Succeed).is_err());
        assert!(TaskStatus::Paused.transition(TaskEvent::Fail).is_err());
    }

    #[test]
    fn stop_and_pause() {
        assert_eq!(TaskStatus::Running.transition(TaskEvent::Stop), Ok(TaskStatus::Stopped));
        assert_eq!(TaskStatus::Completed.transition(TaskEvent::Stop), Ok(TaskStatus::Stopped));
        assert_eq!(TaskStatus::Running.transition(TaskEvent::Pause), Ok(TaskStatus::Paused));
        assert!(TaskStatus::Completed.transition(TaskEvent::Pause).is_err());
        assert!(TaskStatus::Completed.is_finished());
        assert!(!TaskStatus::Stopped.is_finished());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in ["pending", "running", "paused", "completed", "failed", "stopped"] {
            assert_eq!(status.parse::<TaskStatus>().unwrap().as_str(), status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
        assert_eq!("web".parse::<TaskType>().unwrap(), TaskType::Web);
    }

    #[test]
    fn settings_keep_unknown_keys() {
        let settings = TaskSettings::parse(r#"{"crawler_type":"paginated_api","last_from":240,"owner":"ops"}"#).unwrap();
        assert!(settings.is_paginated());
        assert_eq!(settings.resume_state(), ResumeState { last_from: 240 });

        let mut cleared = settings.clone();
        cleared.last_from = None;
        let json: Value = serde_json::from_str(&cleared.to_json().unwrap()).unwrap();
        assert_eq!(json["owner"], "ops");
        assert!(json.get("last_from").is_none());
    }

    #[test]
    fn empty_blob_means_fresh_start() {
        let settings = TaskSettings::parse("").unwrap();
        assert_eq!(settings.resume_state().last_from, 0);
        assert!(!settings.is_paginated());
        assert!(TaskSettings::parse("{not json").is_err());
    }
}
