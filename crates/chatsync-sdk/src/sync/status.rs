//! 同步状态跟踪器
//!
//! 实体同步状态的唯一写入方：每次转换都先校验合法性，再写入本地存储，最后广播
//! `SyncEvent::StatusChanged`。同一实体同时最多一个 IN_PROGRESS（由编排器的实体锁保证，
//! 这里再做一次快速失败检查）。

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry_policy::{RetryDecision, RetryPolicy};
use crate::error::{ChatSyncError, RemoteError, Result};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::storage::entities::{EntityKey, EntityRecord, MutationKind, SyncStatus};
use crate::storage::LocalStore;

/// 一次远端调用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Success,
    Failure(RemoteError),
}

/// `resolve` 之后的最终状态
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub status: SyncStatus,
    /// 失败时的重试决策
    pub decision: Option<RetryDecision>,
}

pub struct SyncStatusTracker {
    store: Arc<dyn LocalStore>,
    events: EventManager,
    retry_policy: Arc<dyn RetryPolicy>,
    in_flight: Mutex<HashSet<EntityKey>>,
}

impl SyncStatusTracker {
    pub fn new(
        store: Arc<dyn LocalStore>,
        events: EventManager,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            store,
            events,
            retry_policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_in_flight(&self, key: &EntityKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    /// 标记为待同步并写入（乐观写入 / 失败重新排队）
    pub async fn mark_pending(&self, record: &mut EntityRecord, attempt: u32) -> Result<()> {
        if self.is_in_flight(&record.key) {
            return Err(ChatSyncError::AlreadyInProgress(record.key.clone()));
        }
        self.apply(record, SyncStatus::SyncNeeded, attempt, true).await
    }

    /// 标记为进行中并写入，让并发读者看到进行中的状态
    pub async fn mark_in_progress(&self, record: &mut EntityRecord, attempt: u32) -> Result<()> {
        if !self.in_flight.lock().insert(record.key.clone()) {
            warn!("{} is already in progress", record.key);
            return Err(ChatSyncError::AlreadyInProgress(record.key.clone()));
        }
        let result = self.apply(record, SyncStatus::InProgress, attempt, true).await;
        if result.is_err() {
            self.in_flight.lock().remove(&record.key);
        }
        result
    }

    /// 根据远端结果结束本次尝试
    ///
    /// 成功：COMPLETED（仅广播）→ SYNCED（写入；删除操作则从存储移除）。
    /// 失败：交给重试策略，可重试 → SYNC_NEEDED，否则 → FAILED_PERMANENTLY。
    pub async fn resolve(
        &self,
        record: &mut EntityRecord,
        kind: MutationKind,
        outcome: MutationOutcome,
        attempt: u32,
    ) -> Result<Resolution> {
        self.in_flight.lock().remove(&record.key);

        match outcome {
            MutationOutcome::Success => {
                self.apply(record, SyncStatus::Completed, attempt, false).await?;
                record.pending_mutation = None;
                if kind == MutationKind::Delete {
                    record.sync_status = SyncStatus::Synced;
                    self.store.delete(&record.key).await?;
                    self.emit(&record.key, SyncStatus::Completed, SyncStatus::Synced, attempt);
                    info!("{} deleted (remote confirmed)", record.key);
                } else {
                    self.apply(record, SyncStatus::Synced, attempt, true).await?;
                }
                Ok(Resolution {
                    status: SyncStatus::Synced,
                    decision: None,
                })
            }
            MutationOutcome::Failure(error) => {
                let decision = self.retry_policy.should_retry(&error, attempt);
                let status = match decision {
                    RetryDecision::RetryAfter(_) => SyncStatus::SyncNeeded,
                    RetryDecision::PermanentFailure | RetryDecision::GiveUp => {
                        SyncStatus::FailedPermanently
                    }
                };
                debug!(
                    "{} attempt {} failed: {} -> {:?}",
                    record.key, attempt, error, decision
                );
                self.apply(record, status, attempt, true).await?;
                Ok(Resolution {
                    status,
                    decision: Some(decision),
                })
            }
        }
    }

    /// 会话取消时释放进行中的实体，退回待同步
    pub async fn release(&self, record: &mut EntityRecord, attempt: u32) -> Result<()> {
        self.in_flight.lock().remove(&record.key);
        if record.sync_status == SyncStatus::InProgress {
            self.apply(record, SyncStatus::SyncNeeded, attempt, true).await?;
        }
        Ok(())
    }

    /// 人工介入：永久失败的实体重新排队
    pub async fn reset_failed(&self, record: &mut EntityRecord) -> Result<()> {
        if record.sync_status != SyncStatus::FailedPermanently {
            return Err(ChatSyncError::InvalidTransition {
                key: record.key.clone(),
                from: record.sync_status,
                to: SyncStatus::SyncNeeded,
            });
        }
        self.apply(record, SyncStatus::SyncNeeded, 0, true).await
    }

    /// 崩溃恢复：存储里残留的 IN_PROGRESS（当前无进行中调用）退回 SYNC_NEEDED
    pub async fn recover_stale(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut record in self.store.records_with_status(SyncStatus::InProgress).await? {
            if self.is_in_flight(&record.key) {
                continue;
            }
            self.apply(&mut record, SyncStatus::SyncNeeded, 0, true).await?;
            recovered += 1;
        }
        if recovered > 0 {
            info!("recovered {} stale in-progress entities", recovered);
        }
        Ok(recovered)
    }

    async fn apply(
        &self,
        record: &mut EntityRecord,
        to: SyncStatus,
        attempt: u32,
        persist: bool,
    ) -> Result<()> {
        let from = record.sync_status;
        if !from.can_transition_to(to) {
            return Err(ChatSyncError::InvalidTransition {
                key: record.key.clone(),
                from,
                to,
            });
        }
        record.sync_status = to;
        if persist {
            self.store.upsert(record).await?;
        }
        self.emit(&record.key, from, to, attempt);
        Ok(())
    }

    fn emit(&self, key: &EntityKey, from: SyncStatus, to: SyncStatus, attempt: u32) {
        debug!("{}: {} -> {} (attempt {})", key, from, to, attempt);
        self.events.emit(SyncEvent::StatusChanged {
            key: key.clone(),
            from,
            to,
            attempt,
            timestamp: now_millis(),
        });
    }
}
