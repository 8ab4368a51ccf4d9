//! 重连补偿
//!
//! 连接进入 CONNECTED 后：
//! 1. 按频道 → 成员 → 消息的顺序重放所有 SYNC_NEEDED 实体
//! 2. 刷新本会话内执行过的查询
//!
//! 会话开始时把残留的 IN_PROGRESS 记录退回 SYNC_NEEDED（上次进程在调用途中退出）。

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::orchestrator::MutationOrchestrator;
use super::query::{QueryController, RefreshOutcome};
use super::status::SyncStatusTracker;
use crate::context::SyncContext;
use crate::error::Result;
use crate::storage::entities::{EntityKind, SyncStatus};

/// 一轮重放的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub attempted: usize,
    pub synced: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct SyncManager {
    ctx: SyncContext,
    tracker: Arc<SyncStatusTracker>,
    orchestrator: Arc<MutationOrchestrator>,
    query: QueryController,
    replay_lock: Mutex<()>,
}

impl SyncManager {
    pub fn new(
        ctx: SyncContext,
        tracker: Arc<SyncStatusTracker>,
        orchestrator: Arc<MutationOrchestrator>,
        query: QueryController,
    ) -> Self {
        Self {
            ctx,
            tracker,
            orchestrator,
            query,
            replay_lock: Mutex::new(()),
        }
    }

    /// 会话开始时的崩溃恢复
    pub async fn recover(&self) -> Result<usize> {
        self.tracker.recover_stale().await
    }

    /// 连接建立后的补偿流程
    pub async fn on_connected(&self) -> Result<ReplayReport> {
        let report = if self.ctx.config.retry_pending_on_connect {
            self.replay_pending().await?
        } else {
            ReplayReport::default()
        };

        if self.ctx.config.query.refresh_on_reconnect && self.ctx.connection.is_online() {
            for (spec_key, outcome) in self.query.refresh_active().await {
                if let RefreshOutcome::Failed(e) = outcome {
                    warn!("refresh of {} after reconnect failed: {}", spec_key, e);
                }
            }
        }
        Ok(report)
    }

    /// 重放所有待同步实体；中途离线则停止，剩余的留给下次连接
    pub async fn replay_pending(&self) -> Result<ReplayReport> {
        let _guard = self.replay_lock.lock().await;
        let mut pending = self.ctx.store.records_with_status(SyncStatus::SyncNeeded).await?;
        // 同类实体按本地修改时间重放（消息保持发送顺序）
        pending.sort_by_key(|r| {
            let order = EntityKind::REPLAY_ORDER
                .iter()
                .position(|kind| *kind == r.key.kind)
                .unwrap_or(usize::MAX);
            (order, r.updated_at.unwrap_or_default())
        });
        if pending.is_empty() {
            return Ok(ReplayReport::default());
        }
        info!("replaying {} pending entities", pending.len());

        let mut report = ReplayReport::default();
        for record in pending {
            if !self.ctx.connection.is_online() {
                info!("connection lost, replay stopped after {} entities", report.attempted);
                break;
            }
            let result = match self.orchestrator.replay(&record.key).await {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!("replay of {} failed: {}", record.key, e);
                    report.attempted += 1;
                    report.failed += 1;
                    continue;
                }
            };
            report.attempted += 1;
            match result.status {
                SyncStatus::Synced => report.synced += 1,
                SyncStatus::FailedPermanently => report.failed += 1,
                _ => report.deferred += 1,
            }
            // 刚同步的实体可能改变了活跃查询的内容（服务端字段、删除确认）
            if result.is_synced() {
                if result.record.is_deleted() {
                    self.query.republish(result.record.key.kind).await?;
                } else {
                    self.query.apply_local(&result.record).await?;
                }
            }
        }
        info!("replay finished: {:?}", report);
        Ok(report)
    }
}
