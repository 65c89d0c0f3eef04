//! # taskforge-foundation
//!
//! Foundation layer for Taskforge:
//! - Error: 공통 에러 타입
//! - Config: 엔진 설정 (EngineConfig, Queue, Retention)
//! - Storage: JsonStore (설정 파일)

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    EngineConfig, OverflowPolicy, QueueConfig, RetentionConfig, ENGINE_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;
