use crate::store::StoreError;
use crate::tasks::TaskStatus;
use thiserror::Error;

pub type HiveResult<T> = Result<T, CoordinationError>;

/// Every failure the kernel reports to a caller.
///
/// Conflicts (`ClaimConflict`, `LockHeldByOther`, `DependencyNotSatisfied`) are ordinary
/// outcomes of racing agents. Validation variants are raised before any store mutation.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("task {task_id} is already claimed{}", holder_suffix(.holder))]
    ClaimConflict {
        task_id: String,
        holder: Option<String>,
    },

    #[error("task {task_id} is blocked: dependency {dependency} is not completed")]
    DependencyNotSatisfied { task_id: String, dependency: String },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("task {0} cannot depend on itself")]
    SelfDependency(String),

    #[error("lock on {path} is held by {holder}")]
    LockHeldByOther { path: String, holder: String },

    #[error("{owner} does not hold the lock on {path}")]
    NotLockOwner {
        path: String,
        owner: String,
        holder: Option<String>,
    },

    #[error("path traversal rejected: {0}")]
    PathTraversalRejected(String),

    #[error("invalid characters in path: {0}")]
    InvalidPathCharacters(String),

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{kind} not found: {id}")]
    RecordNotFound { kind: &'static str, id: String },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|h| format!(" by {h}"))
        .unwrap_or_default()
}

impl CoordinationError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoordinationError::RecordNotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CoordinationError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// True for outcomes produced by competing agents rather than bad input or a broken store.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoordinationError::ClaimConflict { .. }
                | CoordinationError::DependencyNotSatisfied { .. }
                | CoordinationError::LockHeldByOther { .. }
                | CoordinationError::NotLockOwner { .. }
        )
    }

    /// Stable machine-readable code used in JSON results.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinationError::ClaimConflict { .. } => "claim_conflict",
            CoordinationError::DependencyNotSatisfied { .. } => "dependency_not_satisfied",
            CoordinationError::CycleDetected { .. } => "cycle_detected",
            CoordinationError::SelfDependency(_) => "self_dependency",
            CoordinationError::LockHeldByOther { .. } => "lock_held_by_other",
            CoordinationError::NotLockOwner { .. } => "not_lock_owner",
            CoordinationError::PathTraversalRejected(_) => "path_traversal_rejected",
            CoordinationError::InvalidPathCharacters(_) => "invalid_path_characters",
            CoordinationError::StoreUnavailable(_) => "store_unavailable",
            CoordinationError::RecordNotFound { .. } => "record_not_found",
            CoordinationError::InvalidInput { .. } => "invalid_input",
            CoordinationError::InvalidTransition { .. } => "invalid_transition",
            CoordinationError::Serialization(_) => "serialization",
            CoordinationError::Store(_) => "store_error",
            CoordinationError::Config(_) => "config_error",
        }
    }
}

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { .. } | StoreError::Connection(_) | StoreError::Timeout(_) => {
                CoordinationError::StoreUnavailable(err.to_string())
            }
            other => CoordinationError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = CoordinationError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert_eq!(err.code(), "cycle_detected");
    }

    #[test]
    fn test_claim_conflict_is_conflict() {
        let err = CoordinationError::ClaimConflict {
            task_id: "t1".into(),
            holder: Some("agent-7".into()),
        };
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "task t1 is already claimed by agent-7");
        assert!(!CoordinationError::SelfDependency("t1".into()).is_conflict());
    }

    #[test]
    fn test_store_connectivity_maps_to_unavailable() {
        let err: CoordinationError = StoreError::Connection("refused".into()).into();
        assert!(matches!(err, CoordinationError::StoreUnavailable(_)));

        let err: CoordinationError = StoreError::Backend("WRONGTYPE".into()).into();
        assert!(matches!(err, CoordinationError::Store(_)));
    }
}
