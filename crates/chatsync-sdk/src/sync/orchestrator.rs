//! 变更编排器
//!
//! 一次变更的完整流程：
//! 1. 获取实体锁（同一实体串行，不同实体并行）
//! 2. 离线：写入 SYNC_NEEDED 后立即返回（延迟执行，不是错误）
//! 3. 在线：写入 IN_PROGRESS（并发读者可见），调用远端
//! 4. 成功：合并服务端字段，COMPLETED → SYNCED；删除成功则移除记录
//! 5. 失败：按重试策略永久失败，或退回 SYNC_NEEDED、等待后重试

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::retry_policy::RetryDecision;
use super::status::{MutationOutcome, SyncStatusTracker};
use crate::context::SyncContext;
use crate::error::{ChatSyncError, FailureReason, RemoteError, Result};
use crate::events::{now_millis, SyncEvent};
use crate::network::{RemotePayload, RemoteRequest};
use crate::storage::entities::{EntityKey, EntityRecord, MutationKind, SyncStatus};

/// 变更结果
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    /// 最终写入本地的记录
    pub record: EntityRecord,
    pub status: SyncStatus,
    /// 最后一次远端失败（永久失败、或重试被中断时）
    pub error: Option<RemoteError>,
    /// 远端尝试次数（离线为 0）
    pub attempts: u32,
}

impl MutationResult {
    pub fn is_synced(&self) -> bool {
        self.status == SyncStatus::Synced
    }

    /// 已在本地生效、等待联网后同步
    pub fn is_deferred(&self) -> bool {
        self.status == SyncStatus::SyncNeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::FailedPermanently
    }
}

pub struct MutationOrchestrator {
    ctx: SyncContext,
    tracker: Arc<SyncStatusTracker>,
}

impl MutationOrchestrator {
    pub fn new(ctx: SyncContext, tracker: Arc<SyncStatusTracker>) -> Self {
        Self { ctx, tracker }
    }

    /// 执行一次变更，返回最终结果
    #[instrument(skip(self, record), fields(key = %record.key))]
    pub async fn execute(&self, record: EntityRecord, kind: MutationKind) -> Result<MutationResult> {
        let key = record.key.clone();
        self.ctx
            .with_entity_lock(&key, self.execute_locked(record, kind))
            .await
    }

    /// 重放一个待同步实体（重连补偿）。实体已不再是 SYNC_NEEDED 时返回 `None`
    pub async fn replay(&self, key: &EntityKey) -> Result<Option<MutationResult>> {
        self.ctx
            .with_entity_lock(key, async {
                let record = match self.ctx.store.get_by_id(key).await? {
                    Some(record) if record.sync_status == SyncStatus::SyncNeeded => record,
                    _ => {
                        debug!("{} no longer needs sync, skip replay", key);
                        return Ok(None);
                    }
                };
                let kind = record.pending_mutation.unwrap_or(MutationKind::Update);
                self.execute_locked(record, kind).await.map(Some)
            })
            .await
    }

    /// 人工介入：永久失败的实体重新执行其待同步变更
    pub async fn retry_failed(&self, key: &EntityKey) -> Result<MutationResult> {
        self.ctx
            .with_entity_lock(key, async {
                let mut record = self
                    .ctx
                    .store
                    .get_by_id(key)
                    .await?
                    .ok_or_else(|| ChatSyncError::NotFound(key.to_string()))?;
                self.tracker.reset_failed(&mut record).await?;
                let kind = record.pending_mutation.unwrap_or(MutationKind::Update);
                info!("retrying failed {} ({:?})", key, kind);
                self.execute_locked(record, kind).await
            })
            .await
    }

    /// 在实体锁内修改本地派生字段（不改变同步状态），实体不存在时返回 `None`
    pub async fn update_local<F>(&self, key: &EntityKey, apply: F) -> Result<Option<EntityRecord>>
    where
        F: FnOnce(&mut EntityRecord),
    {
        self.ctx
            .with_entity_lock(key, async {
                let Some(mut record) = self.ctx.store.get_by_id(key).await? else {
                    return Ok(None);
                };
                apply(&mut record);
                self.ctx.store.upsert(&record).await?;
                Ok::<_, ChatSyncError>(Some(record))
            })
            .await
    }

    async fn execute_locked(&self, mut record: EntityRecord, kind: MutationKind) -> Result<MutationResult> {
        if self.ctx.is_cancelled() {
            return Err(self.ctx.cancelled_error());
        }

        let stored = self.ctx.store.get_by_id(&record.key).await?;
        let kind = self.prepare(&mut record, stored.as_ref(), kind);

        if !self.ctx.connection.is_online() {
            self.tracker.mark_pending(&mut record, 0).await?;
            info!("{} {:?} deferred until online", record.key, kind);
            return Ok(MutationResult {
                record,
                status: SyncStatus::SyncNeeded,
                error: None,
                attempts: 0,
            });
        }

        self.run_attempts(record, kind).await
    }

    /// 合并存储中的已有状态，返回实际要执行的变更类型
    fn prepare(&self, record: &mut EntityRecord, stored: Option<&EntityRecord>, kind: MutationKind) -> MutationKind {
        let kind = MutationKind::merge(stored.and_then(|s| s.pending_mutation), kind);
        if let Some(stored) = stored {
            record.sync_status = match stored.sync_status {
                // 残留的进行中状态（调用已不存在）
                SyncStatus::InProgress | SyncStatus::Completed => SyncStatus::SyncNeeded,
                status => status,
            };
            if record.remote_id.is_none() {
                record.remote_id = stored.remote_id.clone();
            }
            if record.created_by.is_none() {
                record.created_by = stored.created_by.clone();
            }
            if record.created_at.is_none() {
                record.created_at = stored.created_at;
            }
            // 调用方读取之后由实时事件推进的派生字段
            record.last_message_at = record.last_message_at.max(stored.last_message_at);
        }
        let now = now_millis();
        if record.created_at.is_none() {
            record.created_at = Some(now);
        }
        record.updated_at = Some(now);
        if kind == MutationKind::Delete && record.deleted_at.is_none() {
            record.deleted_at = Some(now);
        }
        record.pending_mutation = Some(kind);
        kind
    }

    async fn run_attempts(&self, mut record: EntityRecord, kind: MutationKind) -> Result<MutationResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.tracker.mark_in_progress(&mut record, attempt).await?;

            let request = match kind {
                MutationKind::Create => RemoteRequest::Create(record.clone()),
                MutationKind::Update => RemoteRequest::Update(record.clone()),
                MutationKind::Delete => RemoteRequest::Delete(record.key.clone()),
            };
            let outcome = match self.ctx.call_remote(request).await {
                Ok(Ok(payload)) => {
                    if let RemotePayload::Entity(server) = &payload {
                        record.merge_server_fields(server);
                    }
                    MutationOutcome::Success
                }
                // 删除一个服务端已不存在的实体，视为成功
                Ok(Err(e)) if kind == MutationKind::Delete && e.reason == FailureReason::NotFound => {
                    debug!("{} already gone remotely", record.key);
                    MutationOutcome::Success
                }
                Ok(Err(e)) => MutationOutcome::Failure(e),
                Err(cancelled) => {
                    self.tracker.release(&mut record, attempt).await?;
                    return Err(cancelled);
                }
            };
            let last_error = match &outcome {
                MutationOutcome::Failure(e) => Some(e.clone()),
                MutationOutcome::Success => None,
            };

            let resolution = self.tracker.resolve(&mut record, kind, outcome, attempt).await?;
            match resolution.decision {
                None => {
                    info!("{} {:?} synced after {} attempt(s)", record.key, kind, attempt);
                    return Ok(MutationResult {
                        record,
                        status: SyncStatus::Synced,
                        error: None,
                        attempts: attempt,
                    });
                }
                Some(RetryDecision::RetryAfter(delay)) => {
                    self.ctx.events.emit(SyncEvent::RetryScheduled {
                        key: record.key.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        timestamp: now_millis(),
                    });
                    info!("{} retry scheduled in {:?} (attempt {})", record.key, delay, attempt);
                    tokio::select! {
                        _ = self.ctx.cancel.cancelled() => return Err(self.ctx.cancelled_error()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if !self.ctx.connection.is_online() {
                        info!("{} went offline while waiting, left for reconnect", record.key);
                        return Ok(MutationResult {
                            record,
                            status: SyncStatus::SyncNeeded,
                            error: last_error,
                            attempts: attempt,
                        });
                    }
                }
                Some(RetryDecision::PermanentFailure) | Some(RetryDecision::GiveUp) => {
                    let error = last_error
                        .unwrap_or_else(|| RemoteError::new(FailureReason::Unknown, "mutation failed"));
                    warn!("{} {:?} failed permanently: {}", record.key, kind, error);
                    self.ctx.events.emit(SyncEvent::MutationFailed {
                        key: record.key.clone(),
                        error: error.clone(),
                        timestamp: now_millis(),
                    });
                    return Ok(MutationResult {
                        record,
                        status: SyncStatus::FailedPermanently,
                        error: Some(error),
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connection_state::{ConnectionState, ConnectionStateManager};
    use crate::context::UserIdentity;
    use crate::events::EventManager;
    use crate::storage::{LocalStore, MemoryStore};
    use crate::sync::retry_policy::NoRetryPolicy;
    use crate::testing::ScriptedTransport;
    use std::time::Duration;

    fn orchestrator(online: bool) -> (Arc<MutationOrchestrator>, Arc<ScriptedTransport>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let connection = ConnectionStateManager::new();
        if online {
            connection.set(ConnectionState::Connected);
        }
        let events = EventManager::new(64);
        let ctx = SyncContext::new(
            UserIdentity::new("alice"),
            store.clone(),
            transport.clone(),
            connection,
            events.clone(),
            Arc::new(SyncConfig::default()),
        );
        let tracker = Arc::new(SyncStatusTracker::new(store.clone(), events, Arc::new(NoRetryPolicy)));
        (Arc::new(MutationOrchestrator::new(ctx, tracker)), transport, store)
    }

    #[tokio::test]
    async fn same_entity_mutations_serialize() {
        let (orchestrator, transport, store) = orchestrator(true);
        let record = EntityRecord::channel("messaging", "busy");
        transport.push_delayed(
            "create",
            Duration::from_millis(50),
            Ok(RemotePayload::Entity(record.clone())),
        );

        let first = {
            let orchestrator = orchestrator.clone();
            let record = record.clone();
            tokio::spawn(async move { orchestrator.execute(record, MutationKind::Create).await })
        };
        let second = {
            let orchestrator = orchestrator.clone();
            let record = record.clone().with_attribute("name", serde_json::json!("renamed"));
            tokio::spawn(async move { orchestrator.execute(record, MutationKind::Update).await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(first.is_synced());
        assert!(second.is_synced());
        assert_eq!(transport.calls().len(), 2);

        let stored = store.get_by_id(&record.key).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn deleting_missing_remote_entity_counts_as_success() {
        let (orchestrator, transport, store) = orchestrator(true);
        let record = EntityRecord::channel("messaging", "ghost");
        store.upsert(&record).await.unwrap();
        transport.push_error("delete", RemoteError::from_status(404, "no such channel"));

        let result = orchestrator.execute(record.clone(), MutationKind::Delete).await.unwrap();
        assert!(result.is_synced());
        assert!(result.record.is_deleted());
        assert!(store.get_by_id(&record.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_skips_entities_that_no_longer_need_sync() {
        let (orchestrator, transport, store) = orchestrator(true);
        let record = EntityRecord::channel("messaging", "done");
        store.upsert(&record).await.unwrap();

        assert!(orchestrator.replay(&record.key).await.unwrap().is_none());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn entity_locks_are_released_after_each_mutation() {
        let (orchestrator, transport, _store) = orchestrator(true);
        for i in 0..200 {
            let message = EntityRecord::message("messaging:busy", &format!("m{}", i), "hi");
            let result = orchestrator.execute(message, MutationKind::Create).await.unwrap();
            assert!(result.is_synced());
        }
        assert_eq!(transport.call_count("create"), 200);

        let key = EntityKey::channel("messaging:busy");
        orchestrator.replay(&key).await.unwrap();
        orchestrator.update_local(&key, |_| {}).await.unwrap();
        assert!(orchestrator.retry_failed(&key).await.is_err());
        assert_eq!(orchestrator.ctx.entity_locks.len().await, 0);
    }

    #[tokio::test]
    async fn offline_delete_keeps_record_marked() {
        let (orchestrator, transport, store) = orchestrator(false);
        let record = EntityRecord::channel("messaging", "later");
        store.upsert(&record).await.unwrap();

        let result = orchestrator.execute(record.clone(), MutationKind::Delete).await.unwrap();
        assert!(result.is_deferred());
        assert!(transport.calls().is_empty());
        let stored = store.get_by_id(&record.key).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert_eq!(stored.pending_mutation, Some(MutationKind::Delete));
    }
}
