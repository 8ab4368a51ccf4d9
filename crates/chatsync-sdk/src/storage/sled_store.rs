//! sled 存储实现 - 按用户隔离的持久化实体库
//!
//! 每个用户使用独立的两棵 Tree：
//! - `user_{uid}:entities`：`{kind}:{id}` → EntityRecord（JSON）
//! - `user_{uid}:queries`：查询缓存 key → CachedQuery（JSON）

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::entities::{EntityKey, EntityKind, EntityRecord};
use super::query::{CachedQuery, QuerySpec};
use super::{watch_stream, LocalStore, StoreNotifier};
use crate::error::{ChatSyncError, Result};

/// 持久化实体存储
#[derive(Debug, Clone)]
pub struct SledStore {
    base_path: PathBuf,
    uid: String,
    db: Db,
    entities: Tree,
    queries: Tree,
    notifier: Arc<StoreNotifier>,
}

impl SledStore {
    /// 打开（或创建）指定用户的实体库
    pub async fn open(base_path: &Path, uid: &str) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let db_path = base_path.join("sync");

        tokio::fs::create_dir_all(&db_path)
            .await
            .map_err(|e| ChatSyncError::Store(format!("创建存储目录失败: {}", e)))?;

        // 切换账号后旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut attempt = 0;
        let db = loop {
            match sled::open(&db_path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(ChatSyncError::Store(format!("打开 sled 数据库失败: {}", e)));
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << (attempt - 1));
                    debug!("sled locked, retry {} in {}ms", attempt, delay_ms);
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        };

        let entities = db.open_tree(format!("user_{}:entities", uid))?;
        let queries = db.open_tree(format!("user_{}:queries", uid))?;
        info!("用户实体库已打开: uid={}, path={}", uid, db_path.display());

        Ok(Self {
            base_path,
            uid: uid.to_string(),
            db,
            entities,
            queries,
            notifier: Arc::new(StoreNotifier::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// 清理当前用户的全部数据
    pub async fn cleanup_user_data(&self) -> Result<()> {
        self.entities.clear()?;
        self.queries.clear()?;
        for kind in EntityKind::REPLAY_ORDER {
            self.notifier.notify(kind);
        }
        info!("用户实体库已清空: uid={}", self.uid);
        Ok(())
    }

    fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl LocalStore for SledStore {
    async fn upsert(&self, record: &EntityRecord) -> Result<()> {
        self.entities
            .insert(record.key.storage_key(), Self::encode(record)?)?;
        self.notifier.notify(record.key.kind);
        Ok(())
    }

    async fn upsert_batch(&self, records: &[EntityRecord]) -> Result<()> {
        let mut batch = sled::Batch::default();
        let mut kinds = Vec::new();
        for record in records {
            batch.insert(record.key.storage_key().as_bytes(), Self::encode(record)?);
            if !kinds.contains(&record.key.kind) {
                kinds.push(record.key.kind);
            }
        }
        self.entities.apply_batch(batch)?;
        for kind in kinds {
            self.notifier.notify(kind);
        }
        Ok(())
    }

    async fn get_by_id(&self, key: &EntityKey) -> Result<Option<EntityRecord>> {
        match self.entities.get(key.storage_key())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_by_spec(&self, spec: &QuerySpec) -> Result<Option<CachedQuery>> {
        match self.queries.get(spec.key())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_query(&self, spec: &QuerySpec, keys: &[EntityKey]) -> Result<()> {
        let cached = CachedQuery {
            spec_key: spec.key(),
            keys: keys.to_vec(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        self.queries
            .insert(cached.spec_key.as_bytes(), Self::encode(&cached)?)?;
        Ok(())
    }

    async fn delete(&self, key: &EntityKey) -> Result<()> {
        self.entities.remove(key.storage_key())?;
        for entry in self.queries.iter() {
            let (raw_key, bytes) = entry?;
            let mut cached: CachedQuery = Self::decode(&bytes)?;
            let before = cached.keys.len();
            cached.keys.retain(|k| k != key);
            if cached.keys.len() != before {
                self.queries.insert(raw_key, Self::encode(&cached)?)?;
            }
        }
        self.notifier.notify(key.kind);
        Ok(())
    }

    async fn records_of_kind(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let prefix = format!("{}:", kind.as_str());
        let mut records = Vec::new();
        for entry in self.entities.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            records.push(Self::decode(&bytes)?);
        }
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
