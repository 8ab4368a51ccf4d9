//! 日志初始化
//!
//! SDK 内部只使用 `tracing` 宏；宿主可以自己安装 subscriber，
//! 也可以调用 [`init_tracing`] 安装一个带 `EnvFilter` 的 fmt 输出。

use tracing_subscriber::EnvFilter;

/// 安装全局 fmt subscriber
///
/// `filter` 为空时优先读取 `RUST_LOG`，再退回 `chatsync_sdk=info`。
/// 重复调用（或宿主已安装 subscriber）时返回 `false`，不会 panic。
pub fn init_tracing(filter: Option<&str>) -> bool {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatsync_sdk=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init_tracing(Some("chatsync_sdk=debug"));
        assert!(!init_tracing(Some("chatsync_sdk=debug")));
    }
}
