//! ChatSync SDK - 离线优先的聊天数据同步核心
//!
//! 本 SDK 在客户端维护频道、消息、成员的本地副本，并在不稳定的网络下与服务端保持一致：
//! - 读取立即走本地缓存，在线时后台刷新并合并服务端结果
//! - 写入先乐观落地，联网后再由服务端确认（失败按策略重试或标记永久失败）
//! - 重连后自动重放离线期间的变更，刷新活跃查询
//! - 实时事件直接合并进查询结果，无需重新查询
//!
//! 传输层（长连接、HTTP、重连退避）由宿主通过 [`Transport`] 提供。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatsync_sdk::{ChatSyncClient, SyncConfig, UserIdentity};
//! use chatsync_sdk::storage::query::{Filter, QuerySpec, SortField, SortKey};
//! use chatsync_sdk::testing::ScriptedTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build()?;
//!     let transport = Arc::new(ScriptedTransport::new());
//!     let client = ChatSyncClient::new(config, transport)?;
//!
//!     client.connect_user(UserIdentity::new("alice")).await?;
//!
//!     // 离线也能立即创建，联网后自动同步
//!     client
//!         .create_channel("messaging", "general", vec!["alice".into(), "bob".into()], Default::default())
//!         .await?;
//!
//!     let spec = QuerySpec::channels(
//!         Filter::in_values("members", ["alice"]),
//!         vec![SortField::descending(SortKey::LastMessageAt)],
//!     );
//!     let response = client.query_channels(spec).await?;
//!     println!("本地结果: {}", response.entities.len());
//!
//!     client.disconnect_user().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod config;
pub mod connection_state;
pub mod context;
pub mod error;
pub mod events;
pub mod logging;
pub mod network;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod testing;

// 重新导出核心类型，方便使用
pub use config::{QueryConfig, RetryConfig, StorageConfig, SyncConfig, SyncConfigBuilder};
pub use connection_state::{ConnectionSnapshot, ConnectionState, ConnectionStateManager};
pub use context::{SyncContext, UserIdentity};
pub use error::{ChatSyncError, ErrorClass, FailureReason, RemoteError, Result};
pub use events::{EventManager, EventStats, SyncEvent};
pub use network::{ConnectionEvent, DomainEvent, RemotePayload, RemoteRequest, Transport, TransportEvent};
pub use sdk::ChatSyncClient;
pub use storage::entities::{EntityKey, EntityKind, EntityRecord, MutationKind, SyncStatus};
pub use storage::query::{Filter, QuerySpec, SortField, SortKey};
pub use storage::{LocalStore, MemoryStore, SledStore};
pub use sync::{
    ExponentialBackoffPolicy, MutationResult, NoRetryPolicy, QueryResponse, RefreshOutcome,
    RetryDecision, RetryPolicy,
};
