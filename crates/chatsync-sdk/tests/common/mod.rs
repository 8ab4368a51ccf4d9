#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatsync_sdk::testing::ScriptedTransport;
use chatsync_sdk::{
    ChatSyncClient, ConnectionState, EntityKey, EntityRecord, MemoryStore, RetryConfig, SyncConfig,
    SyncEvent, SyncStatus, UserIdentity,
};
use tokio::sync::broadcast;

pub struct Harness {
    pub client: Arc<ChatSyncClient>,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub async fn go_online(&self) {
        self.transport.connect();
        self.client.wait_for_connection(ConnectionState::Connected).await;
    }

    pub async fn go_offline(&self) {
        self.transport.disconnect();
        self.client.wait_for_connection(ConnectionState::Offline).await;
    }
}

/// 确定性的重试配置：无抖动；重连后不自动刷新查询（避免与显式查询争用脚本响应）
pub fn test_config(max_attempts: u32) -> SyncConfig {
    SyncConfig::builder()
        .in_memory()
        .refresh_on_reconnect(false)
        .retry(RetryConfig {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        })
        .build()
        .unwrap()
}

pub async fn harness() -> Harness {
    harness_with(test_config(3), Arc::new(MemoryStore::new())).await
}

pub async fn harness_with(config: SyncConfig, store: Arc<MemoryStore>) -> Harness {
    chatsync_sdk::logging::init_tracing(Some("chatsync_sdk=debug"));
    let transport = Arc::new(ScriptedTransport::new());
    let client = Arc::new(ChatSyncClient::new(config, transport.clone()).unwrap());
    client
        .connect_user_with_store(UserIdentity::new("alice"), store.clone())
        .await
        .unwrap();
    Harness {
        client,
        transport,
        store,
    }
}

pub fn synced_channel(cid: &str) -> EntityRecord {
    let (channel_type, id) = cid.split_once(':').unwrap();
    EntityRecord::channel(channel_type, id).with_members(["alice"])
}

/// 取出当前已到达的某实体状态序列
pub fn drain_statuses(rx: &mut broadcast::Receiver<SyncEvent>, key: &EntityKey) -> Vec<SyncStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::StatusChanged { key: k, to, .. } = event {
            if &k == key {
                statuses.push(to);
            }
        }
    }
    statuses
}

/// 等待某实体进入指定状态
pub async fn wait_for_status(rx: &mut broadcast::Receiver<SyncEvent>, key: &EntityKey, status: SyncStatus) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::StatusChanged { key: k, to, .. }) if &k == key && to == status => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("status not reached in time");
}

/// 轮询直到条件成立（实时事件在后台应用）
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
