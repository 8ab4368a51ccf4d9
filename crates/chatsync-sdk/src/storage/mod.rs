//! 本地存储模块
//!
//! 同步核心只依赖 [`LocalStore`] 的读写契约：
//! - 单实体 upsert 原子，进程内写后读可见
//! - 按查询描述保存/读取有序实体列表
//! - `observe_latest` 返回可重复订阅的惰性流
//!
//! 提供两种实现：[`MemoryStore`]（测试、临时会话）和 [`SledStore`]（按用户隔离的 sled 树）。

pub mod entities;
pub mod query;
pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::watch;

use crate::error::Result;
use entities::{EntityKey, EntityKind, EntityRecord, SyncStatus};
use query::{CachedQuery, QuerySpec};

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// 本地持久化契约
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// 插入或覆盖单个实体
    async fn upsert(&self, record: &EntityRecord) -> Result<()>;

    /// 批量 upsert（整批原子）
    async fn upsert_batch(&self, records: &[EntityRecord]) -> Result<()>;

    async fn get_by_id(&self, key: &EntityKey) -> Result<Option<EntityRecord>>;

    /// 按给定顺序读取，缺失的 key 跳过
    async fn get_by_ids(&self, keys: &[EntityKey]) -> Result<Vec<EntityRecord>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get_by_id(key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// 读取等价查询的缓存结果
    async fn get_by_spec(&self, spec: &QuerySpec) -> Result<Option<CachedQuery>>;

    /// 覆盖等价查询的缓存结果
    async fn save_query(&self, spec: &QuerySpec, keys: &[EntityKey]) -> Result<()>;

    /// 删除实体（仅用于远端确认的删除），同时从所有缓存查询中移除
    async fn delete(&self, key: &EntityKey) -> Result<()>;

    async fn records_of_kind(&self, kind: EntityKind) -> Result<Vec<EntityRecord>>;

    async fn records_with_status(&self, status: SyncStatus) -> Result<Vec<EntityRecord>> {
        let mut records = Vec::new();
        for kind in EntityKind::REPLAY_ORDER {
            records.extend(
                self.records_of_kind(kind)
                    .await?
                    .into_iter()
                    .filter(|r| r.sync_status == status),
            );
        }
        Ok(records)
    }

    /// 订阅某类实体的最新全集：订阅时先给出当前值，之后每次变更再给出一次
    fn observe_latest(&self, kind: EntityKind) -> BoxStream<'static, Result<Vec<EntityRecord>>>;
}

/// 按实体类型分组的变更通知（版本号递增）
#[derive(Debug)]
pub(crate) struct StoreNotifier {
    senders: HashMap<EntityKind, watch::Sender<u64>>,
}

impl StoreNotifier {
    pub(crate) fn new() -> Self {
        let senders = EntityKind::REPLAY_ORDER
            .iter()
            .map(|kind| (*kind, watch::channel(0u64).0))
            .collect();
        Self { senders }
    }

    pub(crate) fn notify(&self, kind: EntityKind) {
        if let Some(sender) = self.senders.get(&kind) {
            sender.send_modify(|version| *version += 1);
        }
    }

    pub(crate) fn subscribe(&self, kind: EntityKind) -> watch::Receiver<u64> {
        // REPLAY_ORDER 覆盖了全部类型
        self.senders[&kind].subscribe()
    }
}

/// 把 watch 通知转换成"当前值 + 后续变更"的惰性流
pub(crate) fn watch_stream<T, F, Fut>(rx: watch::Receiver<u64>, load: F) -> BoxStream<'static, T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    futures::stream::unfold((rx, load, true), |(mut rx, load, first)| async move {
        if first {
            let _ = rx.borrow_and_update();
        } else if rx.changed().await.is_err() {
            return None;
        }
        let value = load().await;
        Some((value, (rx, load, false)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifier_bumps_version_per_kind() {
        let notifier = StoreNotifier::new();
        let mut channels = notifier.subscribe(EntityKind::Channel);
        let messages = notifier.subscribe(EntityKind::Message);

        notifier.notify(EntityKind::Channel);
        channels.changed().await.unwrap();
        assert_eq!(*channels.borrow(), 1);
        assert!(!messages.has_changed().unwrap());
    }
}
