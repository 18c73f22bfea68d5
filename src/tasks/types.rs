use crate::error::{CoordinationError, HiveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Spacing between priority bands in the queue score. Larger than any epoch
/// millisecond timestamp, so creation time only orders tasks within a band.
pub const PRIORITY_BAND: f64 = 1e13;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Claimed or in progress: a live claim lease is expected.
    pub fn is_held(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoordinationError::invalid("status", format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Implement,
    Debug,
    Review,
    Test,
    Security,
    Refactor,
    Docs,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Implement,
        TaskKind::Debug,
        TaskKind::Review,
        TaskKind::Test,
        TaskKind::Security,
        TaskKind::Refactor,
        TaskKind::Docs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Implement => "implement",
            TaskKind::Debug => "debug",
            TaskKind::Review => "review",
            TaskKind::Test => "test",
            TaskKind::Security => "security",
            TaskKind::Refactor => "refactor",
            TaskKind::Docs => "docs",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoordinationError::invalid("kind", format!("unknown task kind '{s}'")))
    }
}

/// Reject priorities outside 1..=10.
pub fn validate_priority(priority: u8) -> HiveResult<u8> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(priority)
    } else {
        Err(CoordinationError::invalid(
            "priority",
            format!("{priority} is outside {MIN_PRIORITY}..={MAX_PRIORITY}"),
        ))
    }
}

/// Score in `tasks:queue`. Lower scores are served first: higher priority wins,
/// then older tasks.
pub fn queue_score(priority: u8, created_at: DateTime<Utc>) -> f64 {
    f64::from(MAX_PRIORITY.saturating_sub(priority)) * PRIORITY_BAND
        + created_at.timestamp_millis() as f64
}

/// Unit of work in the shared backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: TaskKind,
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Task {
    /// Build a pending task with a fresh id. Duplicate dependency ids are dropped,
    /// keeping first-seen order.
    pub fn new(new: NewTask) -> Self {
        let mut dependencies: Vec<String> = Vec::with_capacity(new.dependencies.len());
        for dep in new.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Self {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: new.title,
            description: new.description,
            kind: new.kind,
            priority: new.priority,
            status: TaskStatus::Pending,
            dependencies,
            claimed_by: None,
            assigned_to: new.assigned_to,
            created_by: new.created_by,
            specialist: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn queue_score(&self) -> f64 {
        queue_score(self.priority, self.created_at)
    }
}

/// Caller-supplied fields of a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewTask {
    /// Explicit id; a UUID v4 is generated when absent.
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    pub priority: u8,
    pub dependencies: Vec<String>,
    pub assigned_to: Option<String>,
    pub created_by: Option<String>,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            id: None,
            title: String::new(),
            description: String::new(),
            kind: TaskKind::default(),
            priority: DEFAULT_PRIORITY,
            dependencies: Vec::new(),
            assigned_to: None,
            created_by: None,
        }
    }
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn assigned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_to = Some(agent_id.into());
        self
    }

    pub fn created_by(mut self, agent_id: impl Into<String>) -> Self {
        self.created_by = Some(agent_id.into());
        self
    }
}

/// Why a claim did not go through. None of these are failures of the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum ClaimRejection {
    AlreadyClaimed { holder: Option<String> },
    DependencyNotMet { dependency: String },
    NotPending { status: TaskStatus },
    /// The record kept changing under concurrent writers.
    Contended,
}

impl fmt::Display for ClaimRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimRejection::AlreadyClaimed { .. } => f.write_str("alreadyClaimed"),
            ClaimRejection::DependencyNotMet { dependency } => {
                write!(f, "dependencyNotMet:{dependency}")
            }
            ClaimRejection::NotPending { status } => write!(f, "notPending:{status}"),
            ClaimRejection::Contended => f.write_str("contended"),
        }
    }
}

impl ClaimRejection {
    /// The equivalent error, for callers that want `?` semantics.
    pub fn into_error(self, task_id: &str) -> CoordinationError {
        match self {
            ClaimRejection::AlreadyClaimed { holder } => CoordinationError::ClaimConflict {
                task_id: task_id.to_string(),
                holder,
            },
            ClaimRejection::DependencyNotMet { dependency } => {
                CoordinationError::DependencyNotSatisfied {
                    task_id: task_id.to_string(),
                    dependency,
                }
            }
            ClaimRejection::NotPending { status } => CoordinationError::InvalidTransition {
                task_id: task_id.to_string(),
                from: status,
                to: TaskStatus::Claimed,
            },
            ClaimRejection::Contended => CoordinationError::ClaimConflict {
                task_id: task_id.to_string(),
                holder: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    Rejected(ClaimRejection),
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            ClaimOutcome::Claimed(task) => Some(task),
            ClaimOutcome::Rejected(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn test_priority_bounds() {
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(11).is_err());
        assert_eq!(validate_priority(1).unwrap(), 1);
        assert_eq!(validate_priority(10).unwrap(), 10);
    }

    #[test]
    fn test_queue_score_orders_priority_then_age() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        // Higher priority beats an older task.
        assert!(queue_score(9, late) < queue_score(8, early));
        // Same priority: older first.
        assert!(queue_score(5, early) < queue_score(5, late));
        assert_eq!(queue_score(10, early), early.timestamp_millis() as f64);
    }

    #[test]
    fn test_task_json_uses_camel_case() {
        let mut task = Task::new(
            NewTask::new("Fix login")
                .with_kind(TaskKind::Debug)
                .with_dependencies(["a", "b", "a"]),
        );
        task.claimed_by = Some("agent-1".into());

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["claimedBy"], "agent-1");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["kind"], "debug");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("completedAt").is_none());
        assert_eq!(task.dependencies, vec!["a".to_string(), "b".to_string()]);
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(
            ClaimRejection::AlreadyClaimed { holder: None }.to_string(),
            "alreadyClaimed"
        );
        assert_eq!(
            ClaimRejection::DependencyNotMet {
                dependency: "t0".into()
            }
            .to_string(),
            "dependencyNotMet:t0"
        );
    }
}
