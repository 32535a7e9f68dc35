use thiserror::Error;

use crate::core::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Dependency cycle detected at task: {task}")]
    Cycle { task: TaskId },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task id must not be empty")]
    EmptyTaskId,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Quality review failed: {0}")]
    QualityReview(String),

    #[error("Claude binary not found on PATH")]
    ClaudeBinaryNotFound,

    #[error("Scheduler stalled with {remaining} unfinished tasks and nothing in flight")]
    Stalled { remaining: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
