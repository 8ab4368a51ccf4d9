//! 传输层契约
//!
//! 同步核心不解析任何线上字节：传输层（长连接、HTTP、重连退避）由宿主实现，
//! 这里只约定已解码的请求/结果和事件流。

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::connection_state::ConnectionState;
use crate::error::RemoteError;
use crate::storage::entities::{EntityKey, EntityRecord};
use crate::storage::query::QuerySpec;

/// 远端请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteRequest {
    Create(EntityRecord),
    Update(EntityRecord),
    Delete(EntityKey),
    Query(QuerySpec),
}

impl RemoteRequest {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteRequest::Create(_) => "create",
            RemoteRequest::Update(_) => "update",
            RemoteRequest::Delete(_) => "delete",
            RemoteRequest::Query(_) => "query",
        }
    }
}

/// 远端成功结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemotePayload {
    /// 服务端返回的权威实体
    Entity(EntityRecord),
    /// 查询结果页：按服务端顺序排列的实体，以及服务端明确声明已移除的实体
    Page {
        entities: Vec<EntityRecord>,
        removed: Vec<EntityKey>,
    },
    /// 删除已确认
    Deleted,
    /// 无内容
    Empty,
}

/// 连接事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected,
}

impl From<ConnectionEvent> for ConnectionState {
    fn from(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Connecting => ConnectionState::Connecting,
            ConnectionEvent::Connected => ConnectionState::Connected,
            ConnectionEvent::Disconnected => ConnectionState::Offline,
        }
    }
}

/// 已解码的领域事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    ChannelCreated(EntityRecord),
    ChannelUpdated(EntityRecord),
    /// 服务端明确删除
    ChannelDeleted(EntityKey),
    MessageNew(EntityRecord),
    MemberAdded { cid: String, user_id: String },
    MemberRemoved { cid: String, user_id: String },
}

/// 传输层事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEvent {
    Connection(ConnectionEvent),
    Domain(DomainEvent),
}

/// 传输层协作者（由宿主实现）
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发起一次远端调用
    async fn call(&self, request: RemoteRequest) -> std::result::Result<RemotePayload, RemoteError>;

    /// 事件流（无限），每次调用返回一个新的订阅
    fn events(&self) -> BoxStream<'static, TransportEvent>;
}
