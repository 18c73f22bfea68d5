pub mod lifecycle;
pub mod store;
pub mod types;

pub use lifecycle::{TaskEvent, Transition};
pub use store::{TaskStore, DEFAULT_CLAIM_TTL};
pub use types::{
    queue_score, validate_priority, ClaimOutcome, ClaimRejection, NewTask, Task, TaskKind,
    TaskStatus, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
