//! 查询合并控制器
//!
//! 一次查询同时面向本地存储和远端：
//! 1. 读取等价查询的缓存列表，立即返回本地结果
//! 2. 在线时在独立任务里发起远端查询（不阻塞第 1 步）
//! 3. 远端成功：以服务端顺序替换缓存列表，写入返回的实体（有待同步变更的实体保留本地副本），
//!    删除服务端明确移除的实体，重新发布
//! 4. 远端失败：保留缓存结果，旁路发布 `QueryFailed`
//!
//! 本会话执行过的查询保持"活跃"，实时事件和本地变更会直接合并进它们的结果列表。
//! 实时事件在后台按实体排队应用，并和本地变更一样持有实体锁。

use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::keyed_lock::{KeyedLock, KeyedQueue};
use crate::context::SyncContext;
use crate::error::{ChatSyncError, FailureReason, RemoteError, Result};
use crate::events::{now_millis, SyncEvent};
use crate::network::{DomainEvent, RemotePayload, RemoteRequest};
use crate::storage::entities::{EntityKey, EntityKind, EntityRecord, SyncStatus};
use crate::storage::query::QuerySpec;

/// 远端刷新结果
#[derive(Debug)]
pub enum RefreshOutcome {
    /// 已按服务端结果更新，附带新的有序 key 列表
    Updated(Vec<EntityKey>),
    /// 远端或本地合并失败，本地结果保持不变
    Failed(ChatSyncError),
    /// 离线或会话已结束，未发起刷新
    Skipped,
}

/// 后台刷新的句柄
pub struct RefreshHandle {
    inner: Option<JoinHandle<RefreshOutcome>>,
}

impl RefreshHandle {
    pub fn skipped() -> Self {
        Self { inner: None }
    }

    pub fn is_skipped(&self) -> bool {
        self.inner.is_none()
    }

    /// 等待刷新结束
    pub async fn outcome(self) -> RefreshOutcome {
        match self.inner {
            None => RefreshOutcome::Skipped,
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!("query refresh task aborted: {}", e);
                RefreshOutcome::Skipped
            }),
        }
    }
}

/// 查询响应：本地结果 + 远端刷新句柄
pub struct QueryResponse {
    pub spec_key: String,
    pub entities: Vec<EntityRecord>,
    pub refresh: RefreshHandle,
}

struct ActiveQuery {
    spec: QuerySpec,
    spec_key: String,
    sender: watch::Sender<Vec<EntityRecord>>,
    hydrated: AtomicBool,
}

fn published_keys(active: &ActiveQuery) -> Vec<EntityKey> {
    active.sender.borrow().iter().map(|r| r.key.clone()).collect()
}

fn is_published(active: &ActiveQuery, records: &[EntityRecord]) -> bool {
    active.sender.borrow().as_slice() == records
}

#[derive(Clone)]
pub struct QueryController {
    ctx: SyncContext,
    active: Arc<RwLock<HashMap<String, Arc<ActiveQuery>>>>,
    merge_locks: KeyedLock<String>,
    event_work: KeyedQueue<EntityKey>,
}

impl QueryController {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            active: Arc::new(RwLock::new(HashMap::new())),
            merge_locks: KeyedLock::new(),
            event_work: KeyedQueue::new(),
        }
    }

    /// 执行查询：立即返回本地结果，在线时后台刷新
    pub async fn query(&self, spec: QuerySpec) -> Result<QueryResponse> {
        if self.ctx.is_cancelled() {
            return Err(self.ctx.cancelled_error());
        }
        let spec = self.normalize(spec);
        let active = self.register(&spec);

        let entities = self.hydrate(&spec).await?;
        active.hydrated.store(true, Ordering::SeqCst);
        active.sender.send_replace(entities.clone());
        debug!("query {} hydrated {} local entities", active.spec_key, entities.len());

        let refresh = if self.ctx.connection.is_online() {
            let controller = self.clone();
            RefreshHandle {
                inner: Some(tokio::spawn(async move { controller.refresh(spec).await })),
            }
        } else {
            debug!("offline, query {} served from cache only", active.spec_key);
            RefreshHandle::skipped()
        };

        Ok(QueryResponse {
            spec_key: active.spec_key.clone(),
            entities,
            refresh,
        })
    }

    /// 订阅查询结果：先给出当前结果，之后每次重新发布再给出一次
    pub async fn observe(&self, spec: QuerySpec) -> Result<BoxStream<'static, Vec<EntityRecord>>> {
        let spec = self.normalize(spec);
        let active = self.register(&spec);
        if !active.hydrated.swap(true, Ordering::SeqCst) {
            let entities = self.hydrate(&spec).await?;
            active.sender.send_replace(entities);
        }
        let rx = active.sender.subscribe();
        Ok(futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let entities = rx.borrow_and_update().clone();
            Some((entities, (rx, false)))
        })
        .boxed())
    }

    /// 本会话内执行过的查询
    pub fn active_specs(&self) -> Vec<QuerySpec> {
        self.active
            .read()
            .values()
            .map(|active| active.spec.clone())
            .collect()
    }

    /// 刷新所有活跃查询（重连后调用）
    pub async fn refresh_active(&self) -> Vec<(String, RefreshOutcome)> {
        let handles: Vec<(String, JoinHandle<RefreshOutcome>)> = self
            .active_specs()
            .into_iter()
            .map(|spec| {
                let controller = self.clone();
                (spec.key(), tokio::spawn(async move { controller.refresh(spec).await }))
            })
            .collect();
        info!("refreshing {} active queries", handles.len());

        let mut outcomes = Vec::with_capacity(handles.len());
        for (spec_key, handle) in handles {
            let outcome = handle.await.unwrap_or(RefreshOutcome::Skipped);
            outcomes.push((spec_key, outcome));
        }
        outcomes
    }

    /// 发起一次远端查询并合并结果
    pub async fn refresh(&self, spec: QuerySpec) -> RefreshOutcome {
        let spec_key = spec.key();
        let (entities, removed) = match self.ctx.call_remote(RemoteRequest::Query(spec.clone())).await {
            Err(_) => return RefreshOutcome::Skipped,
            Ok(Ok(RemotePayload::Page { entities, removed })) => (entities, removed),
            Ok(Ok(_)) => {
                return self.fail(
                    &spec_key,
                    RemoteError::new(FailureReason::Unknown, "unexpected payload for query"),
                )
            }
            Ok(Err(e)) => return self.fail(&spec_key, e),
        };

        match self.merge_page(&spec, &spec_key, entities, removed).await {
            Ok(keys) => RefreshOutcome::Updated(keys),
            Err(e) => {
                error!("merging query {} failed: {}", spec_key, e);
                RefreshOutcome::Failed(e)
            }
        }
    }

    /// 合并一条实时事件
    ///
    /// 同一实体的事件按到达顺序在后台执行；实体有变更在途时，等变更结束后再应用。
    pub fn handle_event(&self, event: DomainEvent) {
        debug!("domain event: {:?}", event);
        match event {
            DomainEvent::ChannelCreated(channel) | DomainEvent::ChannelUpdated(channel) => {
                let controller = self.clone();
                self.enqueue(channel.key.clone(), async move {
                    controller.absorb_and_apply(channel).await
                });
            }
            DomainEvent::ChannelDeleted(key) => {
                let controller = self.clone();
                self.enqueue(key.clone(), async move { controller.remove_channel(key).await });
            }
            DomainEvent::MessageNew(message) => {
                let parent = message.parent.clone();
                let sent_at = message.created_at.unwrap_or_else(now_millis);
                let controller = self.clone();
                self.enqueue(message.key.clone(), async move {
                    controller.absorb_and_apply(message).await
                });
                if let Some(cid) = parent {
                    self.touch_channel(&cid, move |channel| {
                        channel.last_message_at = Some(channel.last_message_at.map_or(sent_at, |ts| ts.max(sent_at)));
                    });
                }
            }
            DomainEvent::MemberAdded { cid, user_id } => {
                let member = EntityRecord::member(&cid, &user_id);
                let controller = self.clone();
                self.enqueue(member.key.clone(), async move {
                    controller.absorb_and_apply(member).await
                });
                self.touch_channel(&cid, move |channel| {
                    if !channel.members.contains(&user_id) {
                        channel.members.push(user_id);
                    }
                });
            }
            DomainEvent::MemberRemoved { cid, user_id } => {
                let key = EntityKey::member(&cid, &user_id);
                let controller = self.clone();
                self.enqueue(key.clone(), async move { controller.remove_member(key).await });
                self.touch_channel(&cid, move |channel| channel.members.retain(|m| m != &user_id));
            }
        }
    }

    /// 等待已收到的实时事件全部应用完
    pub async fn settle(&self) {
        self.event_work.drain().await;
    }

    /// 把一条已写入本地的记录合并进所有活跃查询（按过滤条件增删，按排序规则重排）
    pub async fn apply_local(&self, record: &EntityRecord) -> Result<()> {
        for active in self.active_of_kind(record.key.kind) {
            self.merge_locks
                .run(&active.spec_key, self.merge_record(&active, record))
                .await?;
        }
        Ok(())
    }

    /// 按存储现状重新发布某类实体的活跃查询（用于确认删除之后）
    pub async fn republish(&self, kind: EntityKind) -> Result<()> {
        for active in self.active_of_kind(kind) {
            self.merge_locks
                .run(&active.spec_key, async {
                    let records = self.hydrate(&active.spec).await?;
                    if !is_published(&active, &records) {
                        let keys = records.iter().map(|r| r.key.clone()).collect();
                        self.publish(&active, records, keys);
                    }
                    Ok::<(), ChatSyncError>(())
                })
                .await?;
        }
        Ok(())
    }

    async fn merge_record(&self, active: &ActiveQuery, record: &EntityRecord) -> Result<()> {
        let mut keys = match self.ctx.store.get_by_spec(&active.spec).await? {
            Some(cached) => cached.keys,
            None => published_keys(active),
        };
        let listed = keys.contains(&record.key);
        let belongs = active.spec.matches(record);
        match (listed, belongs) {
            (false, false) => return Ok(()),
            (false, true) => keys.push(record.key.clone()),
            (true, false) => keys.retain(|k| k != &record.key),
            (true, true) => {}
        }

        let mut records = self.ctx.store.get_by_ids(&keys).await?;
        records.retain(|r| !r.is_deleted());
        if !active.spec.sort.is_empty() {
            active.spec.sort_records(&mut records);
        }
        records.truncate(active.spec.pagination.limit as usize);
        let keys: Vec<EntityKey> = records.iter().map(|r| r.key.clone()).collect();
        self.ctx.store.save_query(&active.spec, &keys).await?;
        self.publish(active, records, keys);
        Ok(())
    }

    async fn merge_page(
        &self,
        spec: &QuerySpec,
        spec_key: &str,
        entities: Vec<EntityRecord>,
        removed: Vec<EntityKey>,
    ) -> Result<Vec<EntityKey>> {
        self.merge_locks
            .run(&spec_key.to_string(), self.merge_page_locked(spec, spec_key, entities, removed))
            .await
    }

    async fn merge_page_locked(
        &self,
        spec: &QuerySpec,
        spec_key: &str,
        entities: Vec<EntityRecord>,
        removed: Vec<EntityKey>,
    ) -> Result<Vec<EntityKey>> {
        for key in &removed {
            self.ctx.store.delete(key).await?;
        }

        let mut keys = Vec::with_capacity(entities.len());
        let mut writes = Vec::with_capacity(entities.len());
        for mut server in entities {
            keys.push(server.key.clone());
            match self.ctx.store.get_by_id(&server.key).await? {
                Some(local) if local.sync_status.is_pending() => {
                    debug!("{} has pending local changes, keep local copy", local.key);
                }
                _ => {
                    server.sync_status = SyncStatus::Synced;
                    server.pending_mutation = None;
                    writes.push(server);
                }
            }
        }
        self.ctx.store.upsert_batch(&writes).await?;
        self.ctx.store.save_query(spec, &keys).await?;

        let records = self.hydrate(spec).await?;
        let published: Vec<EntityKey> = records.iter().map(|r| r.key.clone()).collect();
        info!(
            "query {} merged: {} from server, {} removed",
            spec_key,
            keys.len(),
            removed.len()
        );
        let active = self.active.read().get(spec_key).cloned();
        if let Some(active) = active {
            self.publish(&active, records, published.clone());
        }
        Ok(published)
    }

    /// 写入服务端推送的实体；本地有待同步变更时保留本地副本并返回 `None`
    async fn absorb(&self, mut server: EntityRecord) -> Result<Option<EntityRecord>> {
        if let Some(local) = self.ctx.store.get_by_id(&server.key).await? {
            if local.sync_status.is_pending() {
                debug!("{} has pending local changes, ignore pushed copy", local.key);
                return Ok(None);
            }
        }
        server.sync_status = SyncStatus::Synced;
        server.pending_mutation = None;
        self.ctx.store.upsert(&server).await?;
        Ok(Some(server))
    }

    async fn absorb_and_apply(&self, server: EntityRecord) -> Result<()> {
        let key = server.key.clone();
        if let Some(record) = self.ctx.with_entity_lock(&key, self.absorb(server)).await? {
            self.apply_local(&record).await?;
        }
        Ok(())
    }

    async fn remove_member(&self, key: EntityKey) -> Result<()> {
        self.ctx
            .with_entity_lock(&key, self.ctx.store.delete(&key))
            .await?;
        debug!("{} removed by server", key);
        self.republish(EntityKind::Member).await
    }

    /// 服务端删除频道：连同它的成员和消息一起移除
    async fn remove_channel(&self, key: EntityKey) -> Result<()> {
        self.ctx
            .with_entity_lock(&key, self.ctx.store.delete(&key))
            .await?;
        let mut dependents = 0;
        for kind in [EntityKind::Member, EntityKind::Message] {
            let children: Vec<EntityKey> = self
                .ctx
                .store
                .records_of_kind(kind)
                .await?
                .into_iter()
                .filter(|r| r.parent.as_deref() == Some(key.id.as_str()))
                .map(|r| r.key)
                .collect();
            for child in &children {
                self.ctx
                    .with_entity_lock(child, self.ctx.store.delete(child))
                    .await?;
            }
            dependents += children.len();
        }
        info!("{} deleted by server with {} dependent records", key, dependents);
        for kind in EntityKind::REPLAY_ORDER {
            self.republish(kind).await?;
        }
        Ok(())
    }

    /// 按事件更新频道的派生字段（最近消息时间、成员列表），不改变同步状态
    fn touch_channel<F>(&self, cid: &str, apply: F)
    where
        F: FnOnce(&mut EntityRecord) + Send + 'static,
    {
        let key = EntityKey::channel(cid);
        let controller = self.clone();
        self.enqueue(key.clone(), async move {
            let touched = controller
                .ctx
                .with_entity_lock(&key, async {
                    let Some(mut channel) = controller.ctx.store.get_by_id(&key).await? else {
                        return Ok(None);
                    };
                    apply(&mut channel);
                    controller.ctx.store.upsert(&channel).await?;
                    Ok::<_, ChatSyncError>(Some(channel))
                })
                .await?;
            if let Some(channel) = touched {
                controller.apply_local(&channel).await?;
            }
            Ok(())
        });
    }

    fn enqueue<F>(&self, key: EntityKey, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.event_work.submit(key.clone(), async move {
            if let Err(e) = work.await {
                if !e.is_cancelled() {
                    error!("failed to apply domain event for {}: {}", key, e);
                }
            }
        });
    }

    /// 本地结果：有缓存列表时按缓存顺序，否则按过滤/排序/分页在本地计算
    async fn hydrate(&self, spec: &QuerySpec) -> Result<Vec<EntityRecord>> {
        if let Some(cached) = self.ctx.store.get_by_spec(spec).await? {
            let mut records = self.ctx.store.get_by_ids(&cached.keys).await?;
            records.retain(|r| !r.is_deleted());
            return Ok(records);
        }
        let mut records: Vec<EntityRecord> = self
            .ctx
            .store
            .records_of_kind(spec.kind)
            .await?
            .into_iter()
            .filter(|r| spec.matches(r))
            .collect();
        spec.sort_records(&mut records);
        Ok(records
            .into_iter()
            .skip(spec.pagination.offset as usize)
            .take(spec.pagination.limit as usize)
            .collect())
    }

    fn fail(&self, spec_key: &str, error: RemoteError) -> RefreshOutcome {
        warn!("remote query {} failed, keeping cached result: {}", spec_key, error);
        self.ctx.events.emit(SyncEvent::QueryFailed {
            spec_key: spec_key.to_string(),
            error: error.clone(),
            timestamp: now_millis(),
        });
        RefreshOutcome::Failed(ChatSyncError::Remote(error))
    }

    fn publish(&self, active: &ActiveQuery, records: Vec<EntityRecord>, keys: Vec<EntityKey>) {
        active.sender.send_replace(records);
        self.ctx.events.emit(SyncEvent::QueryUpdated {
            spec_key: active.spec_key.clone(),
            keys,
            timestamp: now_millis(),
        });
    }

    fn normalize(&self, mut spec: QuerySpec) -> QuerySpec {
        if spec.pagination.limit == 0 {
            spec.pagination.limit = self.ctx.config.query.default_limit;
        }
        spec
    }

    fn register(&self, spec: &QuerySpec) -> Arc<ActiveQuery> {
        let spec_key = spec.key();
        if let Some(active) = self.active.read().get(&spec_key) {
            return active.clone();
        }
        self.active
            .write()
            .entry(spec_key.clone())
            .or_insert_with(|| {
                Arc::new(ActiveQuery {
                    spec: spec.clone(),
                    spec_key,
                    sender: watch::channel(Vec::new()).0,
                    hydrated: AtomicBool::new(false),
                })
            })
            .clone()
    }

    fn active_of_kind(&self, kind: EntityKind) -> Vec<Arc<ActiveQuery>> {
        self.active
            .read()
            .values()
            .filter(|active| active.spec.kind == kind)
            .cloned()
            .collect()
    }
}
