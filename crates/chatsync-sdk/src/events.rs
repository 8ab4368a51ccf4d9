//! 事件系统模块
//!
//! 同步核心通过 [`EventManager`] 广播：
//! - 实体同步状态变化（按发生顺序，测试据此断言状态序列）
//! - 重试调度、变更失败
//! - 查询结果更新 / 查询失败（旁路通知，不影响已返回的数据）
//! - 连接状态、会话变化
//!
//! 订阅语义：broadcast，只收到订阅之后发生的事件，不重放。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection_state::ConnectionSnapshot;
use crate::error::RemoteError;
use crate::storage::entities::{EntityKey, SyncStatus};

/// SDK 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 实体同步状态变化
    StatusChanged {
        key: EntityKey,
        from: SyncStatus,
        to: SyncStatus,
        attempt: u32,
        timestamp: i64,
    },
    /// 已安排重试
    RetryScheduled {
        key: EntityKey,
        attempt: u32,
        delay_ms: u64,
        timestamp: i64,
    },
    /// 变更最终失败
    MutationFailed {
        key: EntityKey,
        error: RemoteError,
        timestamp: i64,
    },
    /// 查询结果已按服务端/实时事件更新
    QueryUpdated {
        spec_key: String,
        keys: Vec<EntityKey>,
        timestamp: i64,
    },
    /// 远端查询失败（本地结果保持不变）
    QueryFailed {
        spec_key: String,
        error: RemoteError,
        timestamp: i64,
    },
    /// 连接状态变化
    ConnectionChanged {
        snapshot: ConnectionSnapshot,
        timestamp: i64,
    },
    SessionStarted {
        user_id: String,
        timestamp: i64,
    },
    SessionEnded {
        user_id: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::RetryScheduled { .. } => "retry_scheduled",
            SyncEvent::MutationFailed { .. } => "mutation_failed",
            SyncEvent::QueryUpdated { .. } => "query_updated",
            SyncEvent::QueryFailed { .. } => "query_failed",
            SyncEvent::ConnectionChanged { .. } => "connection_changed",
            SyncEvent::SessionStarted { .. } => "session_started",
            SyncEvent::SessionEnded { .. } => "session_ended",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::StatusChanged { timestamp, .. }
            | SyncEvent::RetryScheduled { timestamp, .. }
            | SyncEvent::MutationFailed { timestamp, .. }
            | SyncEvent::QueryUpdated { timestamp, .. }
            | SyncEvent::QueryFailed { timestamp, .. }
            | SyncEvent::ConnectionChanged { timestamp, .. }
            | SyncEvent::SessionStarted { timestamp, .. }
            | SyncEvent::SessionEnded { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的实体（若有）
    pub fn entity_key(&self) -> Option<&EntityKey> {
        match self {
            SyncEvent::StatusChanged { key, .. }
            | SyncEvent::RetryScheduled { key, .. }
            | SyncEvent::MutationFailed { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
#[derive(Debug, Clone)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: Arc<Mutex<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(Mutex::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());
        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }
        // 无订阅者时 send 失败属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 订阅后续事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn stats(&self) -> EventStats {
        self.stats.lock().clone()
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
