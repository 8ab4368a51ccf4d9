//! 会话上下文
//!
//! `connect_user` 时创建、`disconnect_user` 时失效；同步组件都通过它拿到存储、
//! 传输层、连接状态和事件管理器，而不是读全局变量。

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SyncConfig;
use crate::connection_state::ConnectionStateManager;
use crate::error::{ChatSyncError, RemoteError, Result};
use crate::events::EventManager;
use crate::network::{RemotePayload, RemoteRequest, Transport};
use crate::storage::entities::EntityKey;
use crate::storage::LocalStore;
use crate::sync::KeyedLock;

/// 当前登录用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub token: Option<String>,
    pub display_name: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
            display_name: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// 单个用户会话的共享依赖
#[derive(Clone)]
pub struct SyncContext {
    pub user: UserIdentity,
    pub cancel: CancellationToken,
    pub store: Arc<dyn LocalStore>,
    pub transport: Arc<dyn Transport>,
    pub connection: ConnectionStateManager,
    pub events: EventManager,
    pub config: Arc<SyncConfig>,
    /// 实体级锁：本地变更和实时事件对同一实体的写入都在这里串行
    pub entity_locks: KeyedLock<EntityKey>,
}

impl SyncContext {
    pub fn new(
        user: UserIdentity,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        connection: ConnectionStateManager,
        events: EventManager,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            user,
            cancel: CancellationToken::new(),
            store,
            transport,
            connection,
            events,
            config,
            entity_locks: KeyedLock::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled_error(&self) -> ChatSyncError {
        ChatSyncError::Cancelled(format!("session of {} ended", self.user.user_id))
    }

    /// 在实体锁内执行 `work`；等锁期间会话结束则返回取消错误
    pub async fn with_entity_lock<T, F>(&self, key: &EntityKey, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = tokio::select! {
            _ = self.cancel.cancelled() => None,
            guard = self.entity_locks.lock(key) => Some(guard),
        };
        let result = match guard {
            Some(guard) => {
                let result = work.await;
                drop(guard);
                result
            }
            None => Err(self.cancelled_error()),
        };
        self.entity_locks.release(key).await;
        result
    }

    /// 发起远端调用（带超时，可被会话取消）
    ///
    /// 外层 `Err` 只表示会话已取消；远端失败放在内层结果里。
    pub async fn call_remote(
        &self,
        request: RemoteRequest,
    ) -> Result<std::result::Result<RemotePayload, RemoteError>> {
        let name = request.name();
        let timeout = self.config.remote_timeout();
        debug!("remote {} started", name);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancelled_error()),
            result = tokio::time::timeout(timeout, self.transport.call(request)) => {
                let result = result.unwrap_or_else(|_| {
                    Err(RemoteError::timeout(format!("{} timed out after {:?}", name, timeout)))
                });
                if let Err(e) = &result {
                    debug!("remote {} failed: {}", name, e);
                }
                Ok(result)
            }
        }
    }
}
