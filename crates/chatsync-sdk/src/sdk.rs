//! 统一 SDK 接口 - ChatSyncClient 主入口
//!
//! 分层结构：
//! ```text
//! ChatSyncClient (会话与领域操作)
//!   ├── SyncContext (每个用户会话一份：存储、传输、取消令牌)
//!   ├── MutationOrchestrator (变更编排)
//!   ├── QueryController (查询合并)
//!   ├── SyncManager (重连补偿)
//!   ├── ConnectionStateManager (全局连接状态)
//!   └── EventManager (事件广播)
//! ```
//!
//! 会话生命周期：
//! - `connect_user`：打开该用户的本地存储、崩溃恢复、启动事件循环
//! - `disconnect_user`：取消会话内所有进行中的变更、重试等待、远端查询和事件循环
//!
//! 事件循环对每个传输层事件先写连接状态，再分发其余处理。

use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{StorageConfig, SyncConfig};
use crate::connection_state::{ConnectionSnapshot, ConnectionState, ConnectionStateManager};
use crate::context::{SyncContext, UserIdentity};
use crate::error::{ChatSyncError, Result};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::network::{Transport, TransportEvent};
use crate::storage::entities::{EntityKey, EntityRecord, MutationKind};
use crate::storage::query::QuerySpec;
use crate::storage::{LocalStore, MemoryStore, SledStore};
use crate::sync::{
    ExponentialBackoffPolicy, MutationOrchestrator, MutationResult, QueryController, QueryResponse,
    RetryPolicy, SyncManager, SyncStatusTracker,
};

/// 一个用户会话内的组件
struct Session {
    ctx: SyncContext,
    orchestrator: Arc<MutationOrchestrator>,
    query: QueryController,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// SDK 主入口
pub struct ChatSyncClient {
    config: Arc<SyncConfig>,
    transport: Arc<dyn Transport>,
    connection: ConnectionStateManager,
    events: EventManager,
    retry_policy: Arc<dyn RetryPolicy>,
    session: RwLock<Option<Arc<Session>>>,
}

impl ChatSyncClient {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let retry_policy = Arc::new(ExponentialBackoffPolicy::new(config.retry.clone()));
        let events = EventManager::new(config.event_buffer);
        Ok(Self {
            config: Arc::new(config),
            transport,
            connection: ConnectionStateManager::new(),
            events,
            retry_policy,
            session: RwLock::new(None),
        })
    }

    /// 替换重试策略（对之后建立的会话生效）
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ========== 会话 ==========

    /// 按配置打开该用户的本地存储并建立会话；已有会话时先结束它
    pub async fn connect_user(&self, user: UserIdentity) -> Result<()> {
        if user.user_id.is_empty() {
            return Err(ChatSyncError::InvalidArgument("user_id is empty".to_string()));
        }
        let store: Arc<dyn LocalStore> = match &self.config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Sled { data_dir } => Arc::new(SledStore::open(data_dir, &user.user_id).await?),
        };
        self.connect_user_with_store(user, store).await
    }

    /// 使用外部提供的存储建立会话
    pub async fn connect_user_with_store(&self, user: UserIdentity, store: Arc<dyn LocalStore>) -> Result<()> {
        self.disconnect_user().await?;

        let ctx = SyncContext::new(
            user.clone(),
            store,
            self.transport.clone(),
            self.connection.clone(),
            self.events.clone(),
            self.config.clone(),
        );
        let tracker = Arc::new(SyncStatusTracker::new(
            ctx.store.clone(),
            ctx.events.clone(),
            self.retry_policy.clone(),
        ));
        let orchestrator = Arc::new(MutationOrchestrator::new(ctx.clone(), tracker.clone()));
        let query = QueryController::new(ctx.clone());
        let sync = Arc::new(SyncManager::new(
            ctx.clone(),
            tracker,
            orchestrator.clone(),
            query.clone(),
        ));

        let recovered = sync.recover().await?;
        if recovered > 0 {
            info!("{} stale entities re-queued for {}", recovered, user.user_id);
        }

        // 订阅在启动循环之前完成，避免漏掉紧随其后的事件
        let stream = self.transport.events();
        let event_loop = tokio::spawn(run_event_loop(ctx.clone(), query.clone(), sync, stream));

        *self.session.write().await = Some(Arc::new(Session {
            ctx,
            orchestrator,
            query,
            event_loop: parking_lot::Mutex::new(Some(event_loop)),
        }));

        info!("session started for {}", user.user_id);
        self.events.emit(SyncEvent::SessionStarted {
            user_id: user.user_id,
            timestamp: now_millis(),
        });
        Ok(())
    }

    /// 结束当前会话（登出或切换用户），没有会话时什么都不做
    pub async fn disconnect_user(&self) -> Result<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        session.ctx.cancel.cancel();
        let event_loop = session.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            if let Err(e) = event_loop.await {
                warn!("event loop ended abnormally: {}", e);
            }
        }
        session.query.settle().await;
        info!("session ended for {}", session.ctx.user.user_id);
        self.events.emit(SyncEvent::SessionEnded {
            user_id: session.ctx.user.user_id.clone(),
            timestamp: now_millis(),
        });
        Ok(())
    }

    pub async fn current_user(&self) -> Option<UserIdentity> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.ctx.user.clone())
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or(ChatSyncError::NoActiveSession)
    }

    // ========== 连接与事件 ==========

    pub fn connection_state(&self) -> ConnectionSnapshot {
        self.connection.current()
    }

    /// 订阅连接状态（先给出当前值）
    pub fn observe_connection(&self) -> BoxStream<'static, ConnectionSnapshot> {
        self.connection.observe()
    }

    pub async fn wait_for_connection(&self, state: ConnectionState) -> ConnectionSnapshot {
        self.connection.wait_for(state).await
    }

    /// 订阅 SDK 事件（只收到订阅之后的事件）
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ========== 频道 ==========

    /// 创建频道；离线时本地立即可见，状态为 SYNC_NEEDED
    pub async fn create_channel(
        &self,
        channel_type: &str,
        channel_id: &str,
        members: Vec<String>,
        extra: Map<String, Value>,
    ) -> Result<MutationResult> {
        if channel_type.is_empty() || channel_id.is_empty() {
            return Err(ChatSyncError::InvalidArgument(
                "channel type and id are required".to_string(),
            ));
        }
        let session = self.session().await?;
        let mut record = EntityRecord::channel(channel_type, channel_id).with_members(members);
        record.created_by = Some(session.ctx.user.user_id.clone());
        record.attributes = extra;
        self.mutate(&session, record, MutationKind::Create).await
    }

    /// 更新频道属性（合并到现有属性上）
    pub async fn update_channel(&self, cid: &str, attributes: Map<String, Value>) -> Result<MutationResult> {
        let session = self.session().await?;
        let mut record = self.require(&session, &EntityKey::channel(cid)).await?;
        record.attributes.extend(attributes);
        self.mutate(&session, record, MutationKind::Update).await
    }

    /// 删除频道；远端确认后才从本地移除
    pub async fn delete_channel(&self, cid: &str) -> Result<MutationResult> {
        let session = self.session().await?;
        let record = self.require(&session, &EntityKey::channel(cid)).await?;
        self.mutate(&session, record, MutationKind::Delete).await
    }

    pub async fn channel(&self, cid: &str) -> Result<Option<EntityRecord>> {
        let session = self.session().await?;
        session.ctx.store.get_by_id(&EntityKey::channel(cid)).await
    }

    /// 添加成员：每个成员一次 Create，随后更新频道的成员列表
    pub async fn add_members(&self, cid: &str, user_ids: &[String]) -> Result<Vec<MutationResult>> {
        let session = self.session().await?;
        let channel_key = EntityKey::channel(cid);
        self.require(&session, &channel_key).await?;

        let mut results = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let member = EntityRecord::member(cid, user_id);
            results.push(self.mutate(&session, member, MutationKind::Create).await?);
        }
        let added = user_ids.to_vec();
        if let Some(channel) = session
            .orchestrator
            .update_local(&channel_key, |channel| {
                for user_id in added {
                    if !channel.members.contains(&user_id) {
                        channel.members.push(user_id);
                    }
                }
            })
            .await?
        {
            session.query.apply_local(&channel).await?;
        }
        Ok(results)
    }

    /// 移除成员：每个成员一次 Delete，随后更新频道的成员列表
    pub async fn remove_members(&self, cid: &str, user_ids: &[String]) -> Result<Vec<MutationResult>> {
        let session = self.session().await?;
        let channel_key = EntityKey::channel(cid);
        self.require(&session, &channel_key).await?;

        let mut results = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let key = EntityKey::member(cid, user_id);
            let member = session
                .ctx
                .store
                .get_by_id(&key)
                .await?
                .unwrap_or_else(|| EntityRecord::member(cid, user_id));
            results.push(self.mutate(&session, member, MutationKind::Delete).await?);
        }
        if let Some(channel) = session
            .orchestrator
            .update_local(&channel_key, |channel| {
                channel.members.retain(|m| !user_ids.contains(m))
            })
            .await?
        {
            session.query.apply_local(&channel).await?;
        }
        Ok(results)
    }

    // ========== 消息 ==========

    /// 发送文本消息；本地 id 为客户端生成的 UUID，服务端 id 确认后写入 `remote_id`
    pub async fn send_message(&self, cid: &str, text: &str) -> Result<MutationResult> {
        if text.trim().is_empty() {
            return Err(ChatSyncError::InvalidArgument("message text is empty".to_string()));
        }
        let session = self.session().await?;
        let channel_key = EntityKey::channel(cid);
        self.require(&session, &channel_key).await?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let mut message = EntityRecord::message(cid, &client_id, text);
        message.created_by = Some(session.ctx.user.user_id.clone());
        message.created_at = Some(now_millis());
        let sent_at = message.created_at;

        let result = self.mutate(&session, message, MutationKind::Create).await?;
        if let Some(channel) = session
            .orchestrator
            .update_local(&channel_key, |channel| {
                channel.last_message_at = channel.last_message_at.max(sent_at);
            })
            .await?
        {
            session.query.apply_local(&channel).await?;
        }
        Ok(result)
    }

    // ========== 查询 ==========

    /// 查询频道：立即返回本地结果，在线时后台刷新
    pub async fn query_channels(&self, spec: QuerySpec) -> Result<QueryResponse> {
        let session = self.session().await?;
        session.query.query(spec).await
    }

    /// 订阅查询结果（先给出当前值，随后每次更新）
    pub async fn observe_query(&self, spec: QuerySpec) -> Result<BoxStream<'static, Vec<EntityRecord>>> {
        let session = self.session().await?;
        session.query.observe(spec).await
    }

    // ========== 人工介入 ==========

    /// 重新执行永久失败实体的待同步变更
    pub async fn retry_failed(&self, key: &EntityKey) -> Result<MutationResult> {
        let session = self.session().await?;
        let result = session.orchestrator.retry_failed(key).await?;
        self.publish_result(&session, &result).await?;
        Ok(result)
    }

    async fn mutate(&self, session: &Session, record: EntityRecord, kind: MutationKind) -> Result<MutationResult> {
        let result = session.orchestrator.execute(record, kind).await?;
        self.publish_result(session, &result).await?;
        Ok(result)
    }

    /// 把变更结果合并进活跃查询
    async fn publish_result(&self, session: &Session, result: &MutationResult) -> Result<()> {
        if result.is_synced() && result.record.is_deleted() {
            session.query.republish(result.record.key.kind).await
        } else {
            session.query.apply_local(&result.record).await
        }
    }

    async fn require(&self, session: &Session, key: &EntityKey) -> Result<EntityRecord> {
        match session.ctx.store.get_by_id(key).await? {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(ChatSyncError::NotFound(key.to_string())),
        }
    }
}

/// 会话事件循环
async fn run_event_loop(
    ctx: SyncContext,
    query: QueryController,
    sync: Arc<SyncManager>,
    mut stream: BoxStream<'static, TransportEvent>,
) {
    debug!("event loop started for {}", ctx.user.user_id);
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            None => {
                warn!("transport event stream ended");
                ctx.connection.set(ConnectionState::Offline);
                break;
            }
            Some(TransportEvent::Connection(event)) => {
                let previous = ctx.connection.current();
                let snapshot = ctx.connection.set(event.into());
                if snapshot.version == previous.version {
                    continue;
                }
                ctx.events.emit(SyncEvent::ConnectionChanged {
                    snapshot,
                    timestamp: now_millis(),
                });
                if snapshot.is_online() {
                    let sync = sync.clone();
                    let cancel = ctx.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = sync.on_connected() => {
                                if let Err(e) = result {
                                    if !e.is_cancelled() {
                                        error!("reconnect sync failed: {}", e);
                                    }
                                }
                            }
                        }
                    });
                }
            }
            Some(TransportEvent::Domain(event)) => query.handle_event(event),
        }
    }
    debug!("event loop stopped for {}", ctx.user.user_id);
}
