//! 数据实体定义
//!
//! 频道、消息、成员统一用 `EntityRecord` 表示：
//! - 不可变的身份 `EntityKey { kind, id }`
//! - 可变的 payload（属性、时间戳、成员列表）
//! - 同步状态 `SyncStatus`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// 实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Channel,
    Member,
    Message,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Member => "member",
            Self::Message => "message",
        }
    }

    /// 重连补偿时的执行顺序：频道先于成员，成员先于消息
    pub const REPLAY_ORDER: [EntityKind; 3] = [Self::Channel, Self::Member, Self::Message];
}

impl FromStr for EntityKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" => Ok(Self::Channel),
            "member" => Ok(Self::Member),
            "message" => Ok(Self::Message),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实体身份（创建后不可变）
///
/// 频道的 id 为 cid（`{type}:{id}`），成员的 id 为 `{cid}/{user_id}`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn channel(cid: impl Into<String>) -> Self {
        Self::new(EntityKind::Channel, cid)
    }

    pub fn message(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Message, id)
    }

    pub fn member(cid: &str, user_id: &str) -> Self {
        Self::new(EntityKind::Member, format!("{}/{}", cid, user_id))
    }

    /// 存储层使用的字符串 key：`{kind}:{id}`
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.id)
    }

    pub fn from_storage_key(raw: &str) -> Option<Self> {
        let (kind, id) = raw.split_once(':')?;
        Some(Self::new(EntityKind::from_str(kind).ok()?, id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// 本地与最后一次确认的远端状态一致
    Synced,
    /// 有待同步的本地变更，尚未请求远端
    SyncNeeded,
    /// 远端调用进行中
    InProgress,
    /// 远端调用成功（过渡状态，随即转为 Synced）
    Completed,
    /// 不可重试的失败，需要人工介入
    FailedPermanently,
}

impl SyncStatus {
    /// 检查是否可以从当前状态转换到目标状态
    pub fn can_transition_to(&self, target: SyncStatus) -> bool {
        use SyncStatus::*;
        match (self, target) {
            (InProgress, InProgress) => false,
            (_, InProgress) => true,
            (InProgress, Completed) => true,
            (Completed, Synced) => true,
            (InProgress, FailedPermanently) => true,
            (InProgress, SyncNeeded) => true,
            (Synced, SyncNeeded) => true,
            (SyncNeeded, SyncNeeded) => true,
            (FailedPermanently, SyncNeeded) => true,
            _ => false,
        }
    }

    /// 是否有尚未被远端确认的本地变更
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncStatus::SyncNeeded | SyncStatus::InProgress | SyncStatus::FailedPermanently
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "SYNCED",
            SyncStatus::SyncNeeded => "SYNC_NEEDED",
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::FailedPermanently => "FAILED_PERMANENTLY",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// 离线期间多次变更合并：未同步的 Create 之后的 Update 仍然是 Create，Delete 覆盖一切
    pub fn merge(previous: Option<MutationKind>, next: MutationKind) -> MutationKind {
        match (previous, next) {
            (_, MutationKind::Delete) => MutationKind::Delete,
            (Some(MutationKind::Create), MutationKind::Update) => MutationKind::Create,
            (_, next) => next,
        }
    }
}

/// 同步实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    /// 服务端分配的 ID（确认后写入；本地身份不变）
    pub remote_id: Option<String>,
    /// 所属频道 cid（消息、成员）
    pub parent: Option<String>,
    pub attributes: Map<String, Value>,
    pub members: Vec<String>,
    pub created_by: Option<String>,
    /// 毫秒时间戳
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub last_message_at: Option<i64>,
    /// 本地已删除、等待远端确认
    pub deleted_at: Option<i64>,
    pub sync_status: SyncStatus,
    /// 待重放的变更类型
    pub pending_mutation: Option<MutationKind>,
}

impl EntityRecord {
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            remote_id: None,
            parent: None,
            attributes: Map::new(),
            members: Vec::new(),
            created_by: None,
            created_at: None,
            updated_at: None,
            last_message_at: None,
            deleted_at: None,
            sync_status: SyncStatus::Synced,
            pending_mutation: None,
        }
    }

    /// 频道：cid = `{channel_type}:{channel_id}`
    pub fn channel(channel_type: &str, channel_id: &str) -> Self {
        Self::new(EntityKey::channel(format!("{}:{}", channel_type, channel_id)))
    }

    pub fn message(cid: &str, id: &str, text: &str) -> Self {
        let mut record = Self::new(EntityKey::message(id));
        record.parent = Some(cid.to_string());
        record
            .attributes
            .insert("text".to_string(), Value::String(text.to_string()));
        record
    }

    pub fn member(cid: &str, user_id: &str) -> Self {
        let mut record = Self::new(EntityKey::member(cid, user_id));
        record.parent = Some(cid.to_string());
        record.members = vec![user_id.to_string()];
        record
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_last_message_at(mut self, ts: i64) -> Self {
        self.last_message_at = Some(ts);
        self
    }

    pub fn with_created_at(mut self, ts: i64) -> Self {
        self.created_at = Some(ts);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// 频道类型（cid 的前半段）
    pub fn channel_type(&self) -> Option<&str> {
        match self.key.kind {
            EntityKind::Channel => self.key.id.split_once(':').map(|(t, _)| t),
            _ => None,
        }
    }

    /// 查询过滤使用的字段视图
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "cid" if self.key.kind == EntityKind::Channel => Some(Value::String(self.key.id.clone())),
            "type" => self.channel_type().map(|t| Value::String(t.to_string())),
            "id" => Some(Value::String(match self.key.id.split_once(':') {
                Some((_, id)) if self.key.kind == EntityKind::Channel => id.to_string(),
                _ => self.key.id.clone(),
            })),
            "members" => Some(Value::Array(
                self.members.iter().cloned().map(Value::String).collect(),
            )),
            "created_by" => self.created_by.clone().map(Value::String),
            "parent" => self.parent.clone().map(Value::String),
            "created_at" => self.created_at.map(Value::from),
            "updated_at" => self.updated_at.map(Value::from),
            "last_message_at" => self.last_message_at.map(Value::from),
            other => self.attributes.get(other).cloned(),
        }
    }

    /// 合并服务端权威字段（ID、创建者、时间戳、服务端返回的属性）
    pub fn merge_server_fields(&mut self, server: &EntityRecord) {
        self.remote_id = server
            .remote_id
            .clone()
            .or_else(|| Some(server.key.id.clone()));
        if server.created_by.is_some() {
            self.created_by = server.created_by.clone();
        }
        if server.created_at.is_some() {
            self.created_at = server.created_at;
        }
        if server.updated_at.is_some() {
            self.updated_at = server.updated_at;
        }
        self.last_message_at = match (self.last_message_at, server.last_message_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (name, value) in &server.attributes {
            self.attributes.insert(name.clone(), value.clone());
        }
        if !server.members.is_empty() {
            self.members = server.members.clone();
        }
    }
}
