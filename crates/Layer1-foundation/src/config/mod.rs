//! Config - 엔진 설정 관리
//!
//! - `engine.rs` - EngineConfig (동시성, 큐, 타임아웃, 보존)

mod engine;

pub use engine::{
    EngineConfig, OverflowPolicy, QueueConfig, RetentionConfig, ENGINE_CONFIG_FILE,
    ENV_DEFAULT_TIMEOUT_SECS, ENV_MAX_CONCURRENCY, ENV_QUEUE_CAPACITY,
};
