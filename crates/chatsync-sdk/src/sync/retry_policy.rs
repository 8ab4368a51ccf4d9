use std::fmt::Debug;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::RemoteError;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 延迟后重试
    RetryAfter(Duration),
    /// 不可重试的错误
    PermanentFailure,
    /// 可重试但次数已用尽
    GiveUp,
}

/// 重试策略（可插拔）
///
/// `attempt_count` 为已经执行过的尝试次数（首次失败时为 1）。
pub trait RetryPolicy: Debug + Send + Sync {
    fn should_retry(&self, error: &RemoteError, attempt_count: u32) -> RetryDecision;
}

/// 指数退避策略（默认）
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    config: RetryConfig,
}

impl ExponentialBackoffPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 计算第 `attempt_count` 次失败后的等待时间
    pub fn delay_for(&self, error: &RemoteError, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1) as f64;
        // 基础延迟 = base_delay * (backoff_factor ^ (attempt - 1))
        let base_delay = self.config.base_delay_ms as f64 * self.config.backoff_factor.powf(exponent);
        let adjusted_delay = base_delay * error.reason.delay_multiplier();
        let capped_delay = adjusted_delay.min(self.config.max_delay_ms as f64);

        let jitter = if self.config.jitter_factor > 0.0 {
            capped_delay * self.config.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, error: &RemoteError, attempt_count: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::PermanentFailure;
        }
        if attempt_count >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(error, attempt_count))
    }
}

/// 从不重试（确定性测试用）
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, error: &RemoteError, _attempt_count: u32) -> RetryDecision {
        if error.is_retryable() {
            RetryDecision::GiveUp
        } else {
            RetryDecision::PermanentFailure
        }
    }
}
