//! 进程内测试替身
//!
//! - [`ScriptedTransport`]：按请求类型排队的脚本化响应、调用记录、可注入的事件流
//! - [`FailingStore`]：可按需让写入失败的本地存储包装

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{ChatSyncError, RemoteError, Result};
use crate::network::{ConnectionEvent, DomainEvent, RemotePayload, RemoteRequest, Transport, TransportEvent};
use crate::storage::entities::{EntityKey, EntityKind, EntityRecord};
use crate::storage::query::{CachedQuery, QuerySpec};
use crate::storage::{LocalStore, MemoryStore};

type RemoteResult = std::result::Result<RemotePayload, RemoteError>;

#[derive(Debug, Clone)]
enum Scripted {
    Reply(RemoteResult),
    Delayed(Duration, RemoteResult),
}

#[derive(Default)]
struct Script {
    responses: HashMap<&'static str, VecDeque<Scripted>>,
    calls: Vec<RemoteRequest>,
}

/// 脚本化传输层
///
/// 未排队响应时的默认行为：create/update 回显实体（`remote_id` 取本地 id），
/// delete 返回 `Deleted`，query 返回空页。
pub struct ScriptedTransport {
    script: Mutex<Script>,
    connection: Mutex<ConnectionEvent>,
    sender: broadcast::Sender<TransportEvent>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            script: Mutex::new(Script::default()),
            connection: Mutex::new(ConnectionEvent::Disconnected),
            sender,
        }
    }

    /// 为某类请求（`create` / `update` / `delete` / `query`）排队一个响应
    pub fn push_response(&self, request: &'static str, result: RemoteResult) {
        self.push(request, Scripted::Reply(result));
    }

    pub fn push_error(&self, request: &'static str, error: RemoteError) {
        self.push_response(request, Err(error));
    }

    /// 延迟返回的响应
    pub fn push_delayed(&self, request: &'static str, delay: Duration, result: RemoteResult) {
        self.push(request, Scripted::Delayed(delay, result));
    }

    /// 查询结果页
    pub fn push_page(&self, entities: Vec<EntityRecord>, removed: Vec<EntityKey>) {
        self.push_response("query", Ok(RemotePayload::Page { entities, removed }));
    }

    fn push(&self, request: &'static str, scripted: Scripted) {
        self.script
            .lock()
            .responses
            .entry(request)
            .or_default()
            .push_back(scripted);
    }

    /// 已收到的全部调用
    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.script.lock().calls.clone()
    }

    pub fn call_count(&self, request: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| call.name() == request)
            .count()
    }

    pub fn set_connection(&self, event: ConnectionEvent) {
        *self.connection.lock() = event;
        self.emit(TransportEvent::Connection(event));
    }

    pub fn connect(&self) {
        self.set_connection(ConnectionEvent::Connected);
    }

    pub fn disconnect(&self) {
        self.set_connection(ConnectionEvent::Disconnected);
    }

    pub fn emit_domain(&self, event: DomainEvent) {
        self.emit(TransportEvent::Domain(event));
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.sender.send(event).is_err() {
            warn!("scripted transport event dropped: no subscribers");
        }
    }

    fn next_scripted(&self, request: &RemoteRequest) -> Option<Scripted> {
        let mut script = self.script.lock();
        script.calls.push(request.clone());
        script
            .responses
            .get_mut(request.name())
            .and_then(|queue| queue.pop_front())
    }

    fn default_reply(request: &RemoteRequest) -> RemoteResult {
        match request {
            RemoteRequest::Create(record) | RemoteRequest::Update(record) => {
                let mut echo = record.clone();
                if echo.remote_id.is_none() {
                    echo.remote_id = Some(record.key.id.clone());
                }
                Ok(RemotePayload::Entity(echo))
            }
            RemoteRequest::Delete(_) => Ok(RemotePayload::Deleted),
            RemoteRequest::Query(_) => Ok(RemotePayload::Page {
                entities: Vec::new(),
                removed: Vec::new(),
            }),
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, request: RemoteRequest) -> RemoteResult {
        match self.next_scripted(&request) {
            Some(Scripted::Reply(result)) => result,
            Some(Scripted::Delayed(delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
            None => Self::default_reply(&request),
        }
    }

    /// 新订阅先收到当前连接状态，再收到后续事件
    fn events(&self) -> BoxStream<'static, TransportEvent> {
        let rx = self.sender.subscribe();
        let current = TransportEvent::Connection(*self.connection.lock());
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("scripted transport subscriber lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::once(async move { current }).chain(live).boxed()
    }
}

/// 可让写入失败的存储包装（验证本地存储错误向调用方传播）
#[derive(Clone, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatSyncError::Store("write failure injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FailingStore {
    async fn upsert(&self, record: &EntityRecord) -> Result<()> {
        self.check()?;
        self.inner.upsert(record).await
    }

    async fn upsert_batch(&self, records: &[EntityRecord]) -> Result<()> {
        self.check()?;
        self.inner.upsert_batch(records).await
    }

    async fn get_by_id(&self, key: &EntityKey) -> Result<Option<EntityRecord>> {
        self.inner.get_by_id(key).await
    }

    async fn get_by_spec(&self, spec: &QuerySpec) -> Result<Option<CachedQuery>> {
        self.inner.get_by_spec(spec).await
    }

    async fn save_query(&self, spec: &QuerySpec, keys: &[EntityKey]) -> Result<()> {
        self.check()?;
        self.inner.save_query(spec, keys).await
    }

    async fn delete(&self, key: &EntityKey) -> Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn records_of_kind(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        self.inner.records_of_kind(kind).await
    }

    fn observe_latest(&self, kind: EntityKind) -> BoxStream<'static, Result<Vec<EntityRecord>>> {
        self.inner.observe_latest(kind)
    }
}
