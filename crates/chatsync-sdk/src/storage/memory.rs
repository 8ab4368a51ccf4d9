//! 内存存储实现

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::entities::{EntityKey, EntityKind, EntityRecord};
use super::query::{CachedQuery, QuerySpec};
use super::{watch_stream, LocalStore, StoreNotifier};
use crate::error::Result;

#[derive(Debug, Default)]
struct Inner {
    entities: HashMap<EntityKey, EntityRecord>,
    queries: HashMap<String, CachedQuery>,
}

/// 基于内存的存储（进程退出即丢失）
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    notifier: Arc<StoreNotifier>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            notifier: Arc::new(StoreNotifier::new()),
        }
    }

    /// 当前实体数量
    pub fn len(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn upsert(&self, record: &EntityRecord) -> Result<()> {
        self.inner
            .write()
            .entities
            .insert(record.key.clone(), record.clone());
        self.notifier.notify(record.key.kind);
        Ok(())
    }

    async fn upsert_batch(&self, records: &[EntityRecord]) -> Result<()> {
        let mut kinds = Vec::new();
        {
            let mut inner = self.inner.write();
            for record in records {
                inner.entities.insert(record.key.clone(), record.clone());
                if !kinds.contains(&record.key.kind) {
                    kinds.push(record.key.kind);
                }
            }
        }
        for kind in kinds {
            self.notifier.notify(kind);
        }
        Ok(())
    }

    async fn get_by_id(&self, key: &EntityKey) -> Result<Option<EntityRecord>> {
        Ok(self.inner.read().entities.get(key).cloned())
    }

    async fn get_by_spec(&self, spec: &QuerySpec) -> Result<Option<CachedQuery>> {
        Ok(self.inner.read().queries.get(&spec.key()).cloned())
    }

    async fn save_query(&self, spec: &QuerySpec, keys: &[EntityKey]) -> Result<()> {
        let spec_key = spec.key();
        let cached = CachedQuery {
            spec_key: spec_key.clone(),
            keys: keys.to_vec(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        self.inner.write().queries.insert(spec_key, cached);
        Ok(())
    }

    async fn delete(&self, key: &EntityKey) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.entities.remove(key);
            for cached in inner.queries.values_mut() {
                cached.keys.retain(|k| k != key);
            }
        }
        self.notifier.notify(key.kind);
        Ok(())
    }

    async fn records_of_kind(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let mut records: Vec<EntityRecord> = self
            .inner
            .read()
            .entities
            .values()
            .filter(|r| r.key.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    fn observe_latest(&self, kind: EntityKind) -> BoxStream<'static, Result<Vec<EntityRecord>>> {
        let store = self.clone();
        watch_stream(self.notifier.subscribe(kind), move || {
            let store = store.clone();
            async move { store.records_of_kind(kind).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::SyncStatus;
    use crate::storage::query::Filter;
    use futures::StreamExt;

    #[tokio::test]
    async fn read_after_write() {
        let store = MemoryStore::new();
        let record = EntityRecord::channel("messaging", "general");
        store.upsert(&record).await.unwrap();
        assert_eq!(store.get_by_id(&record.key).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn get_by_ids_preserves_order_and_skips_missing() {
        let store = MemoryStore::new();
        let a = EntityRecord::channel("messaging", "a");
        let b = EntityRecord::channel("messaging", "b");
        store.upsert_batch(&[a.clone(), b.clone()]).await.unwrap();

        let keys = vec![b.key.clone(), EntityKey::channel("messaging:zzz"), a.key.clone()];
        let records = store.get_by_ids(&keys).await.unwrap();
        assert_eq!(records, vec![b, a]);
    }

    #[tokio::test]
    async fn delete_removes_from_cached_queries() {
        let store = MemoryStore::new();
        let a = EntityRecord::channel("messaging", "a");
        let b = EntityRecord::channel("messaging", "b");
        store.upsert_batch(&[a.clone(), b.clone()]).await.unwrap();
        let spec = QuerySpec::channels(Filter::All, vec![]);
        store
            .save_query(&spec, &[a.key.clone(), b.key.clone()])
            .await
            .unwrap();

        store.delete(&a.key).await.unwrap();
        let cached = store.get_by_spec(&spec).await.unwrap().unwrap();
        assert_eq!(cached.keys, vec![b.key.clone()]);
        assert!(store.get_by_id(&a.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_with_status_filters_across_kinds() {
        let store = MemoryStore::new();
        let mut channel = EntityRecord::channel("messaging", "a");
        channel.sync_status = SyncStatus::SyncNeeded;
        let mut message = EntityRecord::message("messaging:a", "m1", "hi");
        message.sync_status = SyncStatus::SyncNeeded;
        let synced = EntityRecord::channel("messaging", "b");
        store
            .upsert_batch(&[message.clone(), channel.clone(), synced])
            .await
            .unwrap();

        let pending = store.records_with_status(SyncStatus::SyncNeeded).await.unwrap();
        assert_eq!(pending, vec![channel, message]);
    }

    #[tokio::test]
    async fn observe_latest_replays_current_then_changes() {
        let store = MemoryStore::new();
        store
            .upsert(&EntityRecord::channel("messaging", "a"))
            .await
            .unwrap();

        let mut stream = store.observe_latest(EntityKind::Channel);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        store
            .upsert(&EntityRecord::channel("messaging", "b"))
            .await
            .unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 2);

        // 重新订阅同样从当前值开始
        let mut again = store.observe_latest(EntityKind::Channel);
        assert_eq!(again.next().await.unwrap().unwrap().len(), 2);
    }
}
