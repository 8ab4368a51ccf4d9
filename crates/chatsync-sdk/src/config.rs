//! SDK 配置

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatSyncError, Result};

/// 本地存储后端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// 内存存储（会话结束即丢失）
    Memory,
    /// sled 持久化，按用户隔离
    Sled { data_dir: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// 重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// 查询配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// 重连后是否刷新本会话内执行过的查询
    pub refresh_on_reconnect: bool,
    /// 默认分页大小
    pub default_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            refresh_on_reconnect: true,
            default_limit: 30,
        }
    }
}

/// 同步 SDK 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub query: QueryConfig,
    /// 单次远端调用超时（毫秒）
    pub remote_timeout_ms: u64,
    /// 事件广播缓冲区大小
    pub event_buffer: usize,
    /// 连接建立后是否重放待同步实体
    pub retry_pending_on_connect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            query: QueryConfig::default(),
            remote_timeout_ms: 30_000,
            event_buffer: 1024,
            retry_pending_on_connect: true,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从 JSON 加载（缺省字段取默认值）
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(raw)
            .map_err(|e| ChatSyncError::Config(format!("解析配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ChatSyncError::Config("retry.max_attempts 必须 >= 1".to_string()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ChatSyncError::Config("retry.backoff_factor 必须 >= 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ChatSyncError::Config("retry.jitter_factor 必须在 0.0-1.0 之间".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(ChatSyncError::Config("event_buffer 必须 > 0".to_string()));
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

/// 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    /// 使用 sled 持久化到指定目录
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.storage = StorageConfig::Sled {
            data_dir: path.as_ref().to_path_buf(),
        };
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.config.storage = StorageConfig::Memory;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    pub fn base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.config.retry.base_delay_ms = base_delay_ms;
        self
    }

    pub fn remote_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.remote_timeout_ms = timeout_ms;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    pub fn refresh_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.query.refresh_on_reconnect = enabled;
        self
    }

    pub fn retry_pending_on_connect(mut self, enabled: bool) -> Self {
        self.config.retry_pending_on_connect = enabled;
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
