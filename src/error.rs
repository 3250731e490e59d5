use crate::model::TaskState;
use thiserror::Error;

/// Errors surfaced by the collection engine.
///
/// Deterministic client errors carry enough context to retry after
/// correction; provider and store breakdowns are transient and map to 5xx
/// on the HTTP surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("task already exists: {task_id}")]
    DuplicateTask { task_id: String },

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("food not found: {food_id}")]
    FoodNotFound { food_id: String },

    #[error("food not available: {food_id}")]
    FoodUnavailable { food_id: String },

    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalState {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("insufficient workers for task {task_id}: required {required}, offered {offered}")]
    InsufficientWorkers {
        task_id: String,
        required: u32,
        offered: u32,
    },

    #[error("worker count mismatch for task {task_id}: required {required}, got {got}")]
    WorkerCountMismatch {
        task_id: String,
        required: u32,
        got: u32,
    },

    #[error("food provider unavailable: {reason}")]
    FoodProviderUnavailable { reason: String },

    #[error("worker provider unavailable: {reason}")]
    WorkerProviderUnavailable { reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// Transient conditions: callers may retry without changing the request.
    /// Timer handlers use this to decide between back-off and `failed`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::FoodProviderUnavailable { .. }
                | Self::WorkerProviderUnavailable { .. }
        )
    }

    /// Status code the HTTP front-end maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::DuplicateTask { .. } => 409,
            Self::IllegalState { .. } => 409,
            Self::TaskNotFound { .. } | Self::FoodNotFound { .. } => 404,
            Self::FoodUnavailable { .. } => 409,
            Self::InsufficientWorkers { .. } => 409,
            Self::WorkerCountMismatch { .. } | Self::InvalidArgument(_) => 400,
            Self::FoodProviderUnavailable { .. } => 502,
            Self::WorkerProviderUnavailable { .. } => 503,
            Self::StoreUnavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        Self::Internal(format!("row encoding: {}", e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("event encoding: {}", e))
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
