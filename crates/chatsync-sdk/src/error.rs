use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::storage::entities::{EntityKey, SyncStatus};

/// SDK 错误类型
///
/// 只有本地存储错误、会话失效、取消等"硬失败"会以 `Err` 返回；
/// 离线、服务端拒绝等预期内的失败会落到实体的同步状态和 `MutationResult` 里。
#[derive(Debug, Error)]
pub enum ChatSyncError {
    /// 本地存储 I/O 失败
    #[error("Local store error: {0}")]
    Store(String),

    /// sled 数据库错误
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 远端调用失败（仅用于需要直接向调用方返回远端错误的场景）
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// 同一实体已有进行中的变更
    #[error("Entity already in progress: {0}")]
    AlreadyInProgress(EntityKey),

    /// 非法的同步状态转换
    #[error("Invalid sync status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: EntityKey,
        from: SyncStatus,
        to: SyncStatus,
    },

    /// 没有活跃的用户会话
    #[error("No active session")]
    NoActiveSession,

    /// 会话已结束，操作被取消
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl ChatSyncError {
    /// 错误分类
    pub fn class(&self) -> ErrorClass {
        match self {
            ChatSyncError::Remote(e) => e.class(),
            ChatSyncError::Store(_) | ChatSyncError::Sled(_) | ChatSyncError::Serialization(_) => {
                ErrorClass::LocalStore
            }
            _ => ErrorClass::Local,
        }
    }

    /// 是否因会话结束而取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatSyncError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatSyncError>;

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// 网络类错误，连接仍可用时总是可重试
    Connectivity,
    /// 服务端拒绝（校验、权限、冲突），不会自动重试
    ServerRejected,
    /// 本地存储错误，当前操作直接失败
    LocalStore,
    /// 其它本地错误（会话、参数、状态机）
    Local,
}

/// 远端失败原因分类
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试，4xx 不重试
    ServerError(u16),
    /// 限流 - 延迟重试
    RateLimited,
    /// 参数校验失败 - 不重试
    Validation,
    /// 未认证 - 不重试
    Unauthorized,
    /// 权限不足 - 不重试
    Forbidden,
    /// 冲突 - 不重试
    Conflict,
    /// 资源不存在 - 不重试
    NotFound,
    /// 未知错误
    Unknown,
}

impl FailureReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            FailureReason::NetworkTimeout
            | FailureReason::NetworkUnavailable
            | FailureReason::RateLimited
            | FailureReason::Unknown => ErrorClass::Connectivity,
            FailureReason::ServerError(code) if (500..600).contains(code) => ErrorClass::Connectivity,
            _ => ErrorClass::ServerRejected,
        }
    }

    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }

    /// 获取重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            FailureReason::NetworkTimeout => 1.0,
            FailureReason::NetworkUnavailable => 2.0,
            FailureReason::ServerError(_) => 1.5,
            FailureReason::RateLimited => 3.0, // 限流需要更长延迟
            _ => 1.0,
        }
    }
}

/// 传输层返回的远端错误（已解码）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub reason: FailureReason,
    pub message: String,
}

impl RemoteError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureReason::NetworkTimeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureReason::NetworkUnavailable, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Validation, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Forbidden, message)
    }

    /// 按 HTTP 状态码构造
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let reason = match code {
            400 | 422 => FailureReason::Validation,
            401 => FailureReason::Unauthorized,
            403 => FailureReason::Forbidden,
            404 => FailureReason::NotFound,
            408 => FailureReason::NetworkTimeout,
            409 => FailureReason::Conflict,
            429 => FailureReason::RateLimited,
            other => FailureReason::ServerError(other),
        };
        Self::new(reason, message)
    }

    pub fn class(&self) -> ErrorClass {
        self.reason.class()
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.reason, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for ChatSyncError {
    fn from(error: RemoteError) -> Self {
        ChatSyncError::Remote(error)
    }
}
