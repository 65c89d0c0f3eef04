//! Error types for Taskforge
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Taskforge 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 엔진 수명주기
    // ========================================================================
    #[error("Task manager has not been started")]
    NotStarted,

    #[error("Task manager is shutting down")]
    ShuttingDown,

    #[error("Work queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether resubmitting the same work later may succeed.
    ///
    /// Only admission failures qualify; the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull { .. })
    }
}
