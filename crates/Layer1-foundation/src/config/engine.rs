//! Engine Config - 작업 엔진 설정
//!
//! 동시 실행 수, 큐 정책, 기본 타임아웃, 보존 정책을 관리합니다.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const ENGINE_CONFIG_FILE: &str = "engine.json";

/// Environment overrides
pub const ENV_MAX_CONCURRENCY: &str = "TASKFORGE_MAX_CONCURRENCY";
pub const ENV_QUEUE_CAPACITY: &str = "TASKFORGE_QUEUE_CAPACITY";
pub const ENV_DEFAULT_TIMEOUT_SECS: &str = "TASKFORGE_DEFAULT_TIMEOUT_SECS";

// ============================================================================
// Engine Config
// ============================================================================

/// Task engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Number of workers and concurrency permits
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Work queue admission policy
    #[serde(default)]
    pub queue: QueueConfig,

    /// Timeout applied when a submission names none (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<f64>,

    /// Periodic cleanup of old terminal tasks
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Buffer size of the status event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How long shutdown waits for workers to exit (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            queue: QueueConfig::default(),
            default_timeout_secs: None,
            retention: RetentionConfig::default(),
            event_capacity: default_event_capacity(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드 후 환경 변수 적용
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<EngineConfig>(ENGINE_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<EngineConfig>(ENGINE_CONFIG_FILE)?
            {
                config.merge(project_config);
            }
        }

        // 3. 환경 변수
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a single file, `.toml` or `.json` by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: EngineConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported config format: {}",
                    other.unwrap_or("<none>")
                )))
            }
        };

        debug!("Loaded engine config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self) -> Result<PathBuf> {
        self.save_to(&JsonStore::current_project()?)
    }

    /// Write `engine.json` into `store`, returning the file path
    pub fn save_to(&self, store: &JsonStore) -> Result<PathBuf> {
        store.save(ENGINE_CONFIG_FILE, self)?;
        Ok(store.file_path(ENGINE_CONFIG_FILE))
    }

    /// Overlay `TASKFORGE_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = parse_var(ENV_MAX_CONCURRENCY, &value)?;
        }
        if let Some(value) = lookup(ENV_QUEUE_CAPACITY) {
            self.queue.capacity = Some(parse_var(ENV_QUEUE_CAPACITY, &value)?);
        }
        if let Some(value) = lookup(ENV_DEFAULT_TIMEOUT_SECS) {
            self.default_timeout_secs = Some(parse_var(ENV_DEFAULT_TIMEOUT_SECS, &value)?);
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("maxConcurrency must be at least 1".into()));
        }
        if self.queue.capacity == Some(0) {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }
        if let Some(secs) = self.default_timeout_secs {
            if !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
                return Err(Error::Config(format!(
                    "defaultTimeoutSecs must be positive, got {}",
                    secs
                )));
            }
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("eventCapacity must be at least 1".into()));
        }
        if Duration::try_from_secs_f64(self.shutdown_grace_secs).is_err() {
            return Err(Error::Config(format!(
                "shutdownGraceSecs must be a non-negative number of seconds, got {}",
                self.shutdown_grace_secs
            )));
        }
        self.retention.validate()
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: EngineConfig) {
        if other.max_concurrency != default_max_concurrency() {
            self.max_concurrency = other.max_concurrency;
        }
        if other.default_timeout_secs.is_some() {
            self.default_timeout_secs = other.default_timeout_secs;
        }
        if other.event_capacity != default_event_capacity() {
            self.event_capacity = other.event_capacity;
        }
        if other.shutdown_grace_secs != default_shutdown_grace() {
            self.shutdown_grace_secs = other.shutdown_grace_secs;
        }

        self.queue.merge(other.queue);
        self.retention.merge(other.retention);
    }

    // ========================================================================
    // Accessors / Builder
    // ========================================================================

    /// `None` when unset or not a usable positive duration
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Falls back to the default grace when the setting is out of range
    pub fn shutdown_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.shutdown_grace_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_shutdown_grace()))
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.queue = QueueConfig {
            capacity: Some(capacity),
            overflow,
        };
        self
    }

    pub fn default_timeout_secs(mut self, secs: f64) -> Self {
        self.default_timeout_secs = Some(secs);
        self
    }

    pub fn retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }
}

// ============================================================================
// Queue Config
// ============================================================================

/// What `submit` does when a bounded queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a slot to free up
    Wait,
    /// Fail the submission with `QueueFull`
    #[default]
    Reject,
}

/// 큐 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum queued items; `None` means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    fn merge(&mut self, other: QueueConfig) {
        if other.capacity.is_some() {
            self.capacity = other.capacity;
            self.overflow = other.overflow;
        }
    }
}

// ============================================================================
// Retention Config
// ============================================================================

/// 보존 정책 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    /// Run the periodic reaper when the engine starts
    #[serde(default)]
    pub enabled: bool,

    /// Terminal tasks created longer ago than this are removed (seconds)
    #[serde(default = "default_max_age")]
    pub max_age_secs: f64,

    /// Reaper period (seconds, fractions allowed)
    #[serde(default = "default_interval")]
    pub interval_secs: f64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_secs: default_max_age(),
            interval_secs: default_interval(),
        }
    }
}

impl RetentionConfig {
    pub fn enabled(max_age: Duration, interval: Duration) -> Self {
        Self {
            enabled: true,
            max_age_secs: max_age.as_secs_f64(),
            interval_secs: interval.as_secs_f64(),
        }
    }

    /// Out-of-range values saturate; `validate` rejects them up front
    pub fn max_age(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_age_secs).unwrap_or(Duration::MAX)
    }

    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_secs).unwrap_or(Duration::ZERO)
    }

    fn validate(&self) -> Result<()> {
        if Duration::try_from_secs_f64(self.max_age_secs).is_err() {
            return Err(Error::Config(format!(
                "retention maxAgeSecs must be a non-negative number of seconds, got {}",
                self.max_age_secs
            )));
        }
        if self.enabled && self.interval().is_zero() {
            return Err(Error::Config(format!(
                "retention intervalSecs must be positive, got {}",
                self.interval_secs
            )));
        }
        Ok(())
    }

    fn merge(&mut self, other: RetentionConfig) {
        self.enabled = other.enabled;
        if other.max_age_secs != default_max_age() {
            self.max_age_secs = other.max_age_secs;
        }
        if other.interval_secs != default_interval() {
            self.interval_secs = other.interval_secs;
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_max_concurrency() -> usize {
    4
}

fn default_event_capacity() -> usize {
    256
}

fn default_shutdown_grace() -> f64 {
    5.0
}

fn default_max_age() -> f64 {
    3600.0
}

fn default_interval() -> f64 {
    300.0
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {:?}", key, value)))
}
