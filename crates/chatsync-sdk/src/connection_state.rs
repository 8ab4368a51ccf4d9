//! 全局连接状态
//!
//! 进程内唯一的连接状态信号（离线 / 连接中 / 已连接），所有写路径据此选择
//! "仅本地" 或 "远端确认" 的执行方式：
//! - 只有传输层事件流会写入（经由 SDK 事件循环）
//! - 写入是原子的，`set` 返回前对所有读者可见
//! - `observe` 新订阅者立即收到当前快照，随后收到状态变化（中间值可能被合并，最新值不会丢）

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
}

impl ConnectionState {
    /// 是否走远端确认路径
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Offline => write!(f, "OFFLINE"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// 带版本号的连接状态快照（版本单调递增，用于判断新旧）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub version: u64,
    /// UTC 毫秒时间戳
    pub changed_at: i64,
}

impl ConnectionSnapshot {
    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }
}

/// 连接状态管理器（线程安全，可克隆共享）
#[derive(Debug, Clone)]
pub struct ConnectionStateManager {
    sender: Arc<watch::Sender<ConnectionSnapshot>>,
}

impl ConnectionStateManager {
    /// 创建新的状态管理器（初始为离线）
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Offline,
            version: 0,
            changed_at: Utc::now().timestamp_millis(),
        });
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 当前状态快照
    pub fn current(&self) -> ConnectionSnapshot {
        *self.sender.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// 写入新状态；状态未变化时不递增版本。返回写入后的快照
    pub fn set(&self, state: ConnectionState) -> ConnectionSnapshot {
        let mut changed = false;
        self.sender.send_if_modified(|snapshot| {
            if snapshot.state == state {
                return false;
            }
            snapshot.state = state;
            snapshot.version += 1;
            snapshot.changed_at = Utc::now().timestamp_millis();
            changed = true;
            true
        });
        let snapshot = self.current();
        if changed {
            info!("connection state -> {} (v{})", snapshot.state, snapshot.version);
        }
        snapshot
    }

    /// 订阅状态：先给出当前快照，再给出后续变化；每个订阅者独立、可重复订阅
    pub fn observe(&self) -> BoxStream<'static, ConnectionSnapshot> {
        let rx = self.sender.subscribe();
        futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = *rx.borrow_and_update();
            Some((snapshot, (rx, false)))
        })
        .boxed()
    }

    /// 等待进入指定状态
    pub async fn wait_for(&self, state: ConnectionState) -> ConnectionSnapshot {
        let mut rx = self.sender.subscribe();
        loop {
            let snapshot = *rx.borrow_and_update();
            if snapshot.state == state {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                return snapshot;
            }
        }
    }
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}
