//! Task state machine.
//!
//! ```text
//! pending ──claim──> claimed ──start──> in_progress
//!    ^                  │                    │
//!    └────release───────┴────────────────────┤
//!                       │                    │
//!                       └──complete/fail─────┴──> completed | failed
//! pending | claimed | in_progress ──cancel──> cancelled
//! ```
//!
//! Repeating the event that produced the current state is a no-op, so retried
//! completions never rewrite the record.

use super::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Claim,
    Start,
    Complete,
    Fail,
    Cancel,
    Release,
}

impl TaskEvent {
    /// State the event leads to when it applies.
    pub fn target(self) -> TaskStatus {
        match self {
            TaskEvent::Claim => TaskStatus::Claimed,
            TaskEvent::Start => TaskStatus::InProgress,
            TaskEvent::Complete => TaskStatus::Completed,
            TaskEvent::Fail => TaskStatus::Failed,
            TaskEvent::Cancel => TaskStatus::Cancelled,
            TaskEvent::Release => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Move(TaskStatus),
    Unchanged,
}

/// `None` when the event is not allowed from `from`.
pub fn apply(from: TaskStatus, event: TaskEvent) -> Option<Transition> {
    use TaskEvent::*;
    use TaskStatus::*;

    let target = event.target();
    if from == target {
        return Some(Transition::Unchanged);
    }

    let allowed = match (from, event) {
        (Pending, Claim) => true,
        (Claimed, Start) => true,
        (Claimed | InProgress, Complete | Fail | Release) => true,
        (Pending | Claimed | InProgress, Cancel) => true,
        _ => false,
    };

    allowed.then_some(Transition::Move(target))
}
