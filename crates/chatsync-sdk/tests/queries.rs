mod common;

use std::time::Duration;

use chatsync_sdk::storage::query::SortField;
use chatsync_sdk::{
    ChatSyncError, DomainEvent, EntityKey, EntityKind, EntityRecord, Filter, LocalStore, MutationKind,
    QuerySpec, RefreshOutcome, RemoteError, RemotePayload, SortKey, SyncEvent, SyncStatus,
};
use common::{eventually, harness, synced_channel, wait_for_status};
use futures::StreamExt;
use serde_json::json;

fn members_spec() -> QuerySpec {
    QuerySpec::channels(
        Filter::in_values("members", ["alice"]),
        vec![SortField::descending(SortKey::LastMessageAt)],
    )
}

fn keys(records: &[EntityRecord]) -> Vec<EntityKey> {
    records.iter().map(|r| r.key.clone()).collect()
}

fn cids(ids: &[&str]) -> Vec<EntityKey> {
    ids.iter().map(|id| EntityKey::channel(*id)).collect()
}

async fn seed_cached(h: &common::Harness, spec: &QuerySpec, ids: &[&str]) {
    for id in ids {
        h.store.upsert(&synced_channel(id)).await.unwrap();
    }
    h.store.save_query(spec, &cids(ids)).await.unwrap();
}

#[tokio::test]
async fn server_order_wins_and_absent_entities_stay_in_store() {
    let h = harness().await;
    let spec = members_spec();
    seed_cached(&h, &spec, &["messaging:cid1", "messaging:cid2"]).await;
    h.go_online().await;

    h.transport.push_page(
        vec![synced_channel("messaging:cid2"), synced_channel("messaging:cid3")],
        Vec::new(),
    );
    let response = h.client.query_channels(spec.clone()).await.unwrap();

    // 先返回本地缓存
    assert_eq!(keys(&response.entities), cids(&["messaging:cid1", "messaging:cid2"]));

    match response.refresh.outcome().await {
        RefreshOutcome::Updated(updated) => {
            assert_eq!(updated, cids(&["messaging:cid2", "messaging:cid3"]))
        }
        other => panic!("unexpected refresh outcome: {:?}", other),
    }

    let cached = h.store.get_by_spec(&spec).await.unwrap().unwrap();
    assert_eq!(cached.keys, cids(&["messaging:cid2", "messaging:cid3"]));
    // cid1 不在新列表里，但仍然在本地存储中
    assert!(h
        .store
        .get_by_id(&EntityKey::channel("messaging:cid1"))
        .await
        .unwrap()
        .is_some());

    let mut observed = h.client.observe_query(spec).await.unwrap();
    assert_eq!(
        keys(&observed.next().await.unwrap()),
        cids(&["messaging:cid2", "messaging:cid3"])
    );
}

#[tokio::test]
async fn failed_remote_query_keeps_local_result() {
    let h = harness().await;
    let spec = members_spec();
    seed_cached(&h, &spec, &["messaging:cid1", "messaging:cid2"]).await;
    h.go_online().await;

    h.transport
        .push_error("query", RemoteError::unavailable("backend down"));
    let mut rx = h.client.subscribe_events();
    let response = h.client.query_channels(spec.clone()).await.unwrap();
    assert_eq!(keys(&response.entities), cids(&["messaging:cid1", "messaging:cid2"]));

    match response.refresh.outcome().await {
        RefreshOutcome::Failed(ChatSyncError::Remote(e)) => {
            assert_eq!(e, RemoteError::unavailable("backend down"))
        }
        other => panic!("unexpected refresh outcome: {:?}", other),
    }

    let mut query_failed = false;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::QueryFailed { spec_key, .. } = event {
            assert_eq!(spec_key, spec.key());
            query_failed = true;
        }
    }
    assert!(query_failed);

    let cached = h.store.get_by_spec(&spec).await.unwrap().unwrap();
    assert_eq!(cached.keys, cids(&["messaging:cid1", "messaging:cid2"]));
    let mut observed = h.client.observe_query(spec).await.unwrap();
    assert_eq!(
        keys(&observed.next().await.unwrap()),
        cids(&["messaging:cid1", "messaging:cid2"])
    );
}

#[tokio::test]
async fn equivalent_queries_are_idempotent() {
    let h = harness().await;
    let spec = members_spec();
    seed_cached(&h, &spec, &["messaging:a", "messaging:b"]).await;

    let first = h.client.query_channels(spec.clone()).await.unwrap();
    let second = h.client.query_channels(members_spec()).await.unwrap();

    assert_eq!(first.spec_key, second.spec_key);
    assert_eq!(first.entities, second.entities);
    // 离线不发起远端查询
    assert!(first.refresh.is_skipped());
    assert!(matches!(second.refresh.outcome().await, RefreshOutcome::Skipped));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn uncached_query_is_evaluated_locally() {
    let h = harness().await;
    h.store
        .upsert(&synced_channel("messaging:old").with_last_message_at(10))
        .await
        .unwrap();
    h.store
        .upsert(&synced_channel("messaging:new").with_last_message_at(20))
        .await
        .unwrap();
    h.store
        .upsert(&EntityRecord::channel("messaging", "other").with_members(["bob"]))
        .await
        .unwrap();

    let response = h.client.query_channels(members_spec()).await.unwrap();
    assert_eq!(keys(&response.entities), cids(&["messaging:new", "messaging:old"]));
}

#[tokio::test]
async fn pending_local_copy_survives_server_page_and_removed_are_deleted() {
    let h = harness().await;
    let spec = members_spec();
    seed_cached(&h, &spec, &["messaging:gone"]).await;
    // 永久失败的本地修改：不会被重连重放，也不能被服务端副本覆盖
    let mut local = synced_channel("messaging:edited").with_attribute("name", json!("local"));
    local.sync_status = SyncStatus::FailedPermanently;
    local.pending_mutation = Some(MutationKind::Update);
    h.store.upsert(&local).await.unwrap();
    h.go_online().await;

    h.transport.push_page(
        vec![synced_channel("messaging:edited").with_attribute("name", json!("server"))],
        cids(&["messaging:gone"]),
    );
    let response = h.client.query_channels(spec).await.unwrap();
    assert!(matches!(response.refresh.outcome().await, RefreshOutcome::Updated(_)));

    let edited = h
        .store
        .get_by_id(&EntityKey::channel("messaging:edited"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edited.attributes.get("name"), Some(&json!("local")));
    assert_eq!(edited.sync_status, SyncStatus::FailedPermanently);
    assert!(h
        .store
        .get_by_id(&EntityKey::channel("messaging:gone"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn live_events_update_active_queries() {
    let h = harness().await;
    let spec = members_spec();
    seed_cached(&h, &spec, &["messaging:quiet"]).await;
    h.client.query_channels(spec.clone()).await.unwrap();
    h.go_online().await;

    let mut observed = h.client.observe_query(spec.clone()).await.unwrap();
    assert_eq!(keys(&observed.next().await.unwrap()), cids(&["messaging:quiet"]));

    // 新频道匹配过滤条件，按最近消息时间排在前面
    h.transport.emit_domain(DomainEvent::ChannelCreated(
        synced_channel("messaging:busy").with_last_message_at(100),
    ));
    let next = tokio::time::timeout(Duration::from_secs(5), observed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(keys(&next), cids(&["messaging:busy", "messaging:quiet"]));

    // 新消息把 quiet 顶到最前
    let mut message = EntityRecord::message("messaging:quiet", "m1", "hello");
    message.created_at = Some(200);
    h.transport.emit_domain(DomainEvent::MessageNew(message));
    let next = tokio::time::timeout(Duration::from_secs(5), observed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(keys(&next), cids(&["messaging:quiet", "messaging:busy"]));

    // 不匹配过滤条件的频道不会进入列表
    h.transport.emit_domain(DomainEvent::ChannelCreated(
        EntityRecord::channel("messaging", "foreign").with_members(["bob"]),
    ));
    // 服务端删除
    h.transport
        .emit_domain(DomainEvent::ChannelDeleted(EntityKey::channel("messaging:busy")));
    let next = tokio::time::timeout(Duration::from_secs(5), observed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(keys(&next), cids(&["messaging:quiet"]));
    let foreign = EntityKey::channel("messaging:foreign");
    eventually(|| {
        let (store, foreign) = (h.store.clone(), foreign.clone());
        async move { store.get_by_id(&foreign).await.unwrap().is_some() }
    })
    .await;
}

#[tokio::test]
async fn member_events_update_channel_membership() {
    let h = harness().await;
    h.store.upsert(&synced_channel("messaging:team")).await.unwrap();

    h.transport.emit_domain(DomainEvent::MemberAdded {
        cid: "messaging:team".to_string(),
        user_id: "carol".to_string(),
    });
    h.transport.emit_domain(DomainEvent::MemberRemoved {
        cid: "messaging:team".to_string(),
        user_id: "alice".to_string(),
    });

    // 事件循环按顺序处理；等到第二个事件生效
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let channel = h.client.channel("messaging:team").await.unwrap().unwrap();
            if channel.members == vec!["carol".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(h
        .store
        .get_by_id(&EntityKey::member("messaging:team", "carol"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn offline_created_channel_joins_active_query() {
    let h = harness().await;
    let spec = members_spec();
    h.client.query_channels(spec.clone()).await.unwrap();

    h.client
        .create_channel(
            "messaging",
            "fresh",
            vec!["alice".to_string(), "bob".to_string()],
            Default::default(),
        )
        .await
        .unwrap();

    let mut observed = h.client.observe_query(spec).await.unwrap();
    let current = observed.next().await.unwrap();
    assert_eq!(keys(&current), cids(&["messaging:fresh"]));
    assert_eq!(current[0].sync_status, SyncStatus::SyncNeeded);
}

#[tokio::test]
async fn reconnect_refreshes_active_queries() {
    let mut config = common::test_config(3);
    config.query.refresh_on_reconnect = true;
    let h = common::harness_with(config, std::sync::Arc::new(chatsync_sdk::MemoryStore::new())).await;
    let spec = members_spec();
    h.client.query_channels(spec.clone()).await.unwrap();
    assert_eq!(h.transport.call_count("query"), 0);

    h.transport
        .push_page(vec![synced_channel("messaging:remote")], Vec::new());
    let mut rx = h.client.subscribe_events();
    h.go_online().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SyncEvent::QueryUpdated { keys, .. } = rx.recv().await.unwrap() {
                if keys == cids(&["messaging:remote"]) {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(h.transport.call_count("query"), 1);
}

async fn next_within(stream: &mut futures::stream::BoxStream<'static, Vec<EntityRecord>>) -> Vec<EntityRecord> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("query was not republished")
        .unwrap()
}

#[tokio::test]
async fn live_message_joins_active_message_query() {
    let h = harness().await;
    h.store.upsert(&synced_channel("messaging:c")).await.unwrap();

    let mut observed = h
        .client
        .observe_query(QuerySpec::messages("messaging:c"))
        .await
        .unwrap();
    assert!(observed.next().await.unwrap().is_empty());

    let later = EntityRecord::message("messaging:c", "m2", "second").with_created_at(200);
    let earlier = EntityRecord::message("messaging:c", "m1", "first").with_created_at(100);
    h.transport.emit_domain(DomainEvent::MessageNew(later));
    assert_eq!(
        keys(&next_within(&mut observed).await),
        vec![EntityKey::message("m2")]
    );
    h.transport.emit_domain(DomainEvent::MessageNew(earlier));
    assert_eq!(
        keys(&next_within(&mut observed).await),
        vec![EntityKey::message("m1"), EntityKey::message("m2")]
    );
}

#[tokio::test]
async fn member_events_republish_member_queries() {
    let h = harness().await;
    h.store.upsert(&synced_channel("messaging:team")).await.unwrap();
    let spec = QuerySpec::new(EntityKind::Member, Filter::eq("parent", "messaging:team"), Vec::new());
    let mut observed = h.client.observe_query(spec).await.unwrap();
    assert!(observed.next().await.unwrap().is_empty());

    h.transport.emit_domain(DomainEvent::MemberAdded {
        cid: "messaging:team".to_string(),
        user_id: "carol".to_string(),
    });
    assert_eq!(
        keys(&next_within(&mut observed).await),
        vec![EntityKey::member("messaging:team", "carol")]
    );

    h.transport.emit_domain(DomainEvent::MemberRemoved {
        cid: "messaging:team".to_string(),
        user_id: "carol".to_string(),
    });
    assert!(next_within(&mut observed).await.is_empty());
}

#[tokio::test]
async fn live_merge_respects_page_limit() {
    let h = harness().await;
    let spec = members_spec().with_pagination(0, 2);
    h.store
        .upsert(&synced_channel("messaging:a").with_last_message_at(10))
        .await
        .unwrap();
    h.store
        .upsert(&synced_channel("messaging:b").with_last_message_at(20))
        .await
        .unwrap();
    h.store
        .save_query(&spec, &cids(&["messaging:b", "messaging:a"]))
        .await
        .unwrap();

    let mut observed = h.client.observe_query(spec.clone()).await.unwrap();
    assert_eq!(
        keys(&observed.next().await.unwrap()),
        cids(&["messaging:b", "messaging:a"])
    );

    h.transport.emit_domain(DomainEvent::ChannelCreated(
        synced_channel("messaging:c").with_last_message_at(30),
    ));
    assert_eq!(
        keys(&next_within(&mut observed).await),
        cids(&["messaging:c", "messaging:b"])
    );
    let cached = h.store.get_by_spec(&spec).await.unwrap().unwrap();
    assert_eq!(cached.keys, cids(&["messaging:c", "messaging:b"]));
}

#[tokio::test]
async fn deleted_channel_takes_members_and_messages_with_it() {
    let h = harness().await;
    h.store.upsert(&synced_channel("messaging:doomed")).await.unwrap();
    h.store
        .upsert(&EntityRecord::member("messaging:doomed", "alice"))
        .await
        .unwrap();
    h.store
        .upsert(&EntityRecord::message("messaging:doomed", "m1", "bye").with_created_at(1))
        .await
        .unwrap();
    h.store
        .upsert(&EntityRecord::message("messaging:other", "m2", "stay").with_created_at(2))
        .await
        .unwrap();

    let mut observed = h
        .client
        .observe_query(QuerySpec::messages("messaging:doomed"))
        .await
        .unwrap();
    assert_eq!(keys(&observed.next().await.unwrap()), vec![EntityKey::message("m1")]);

    h.transport
        .emit_domain(DomainEvent::ChannelDeleted(EntityKey::channel("messaging:doomed")));
    assert!(next_within(&mut observed).await.is_empty());

    for key in [
        EntityKey::channel("messaging:doomed"),
        EntityKey::member("messaging:doomed", "alice"),
        EntityKey::message("m1"),
    ] {
        assert!(h.store.get_by_id(&key).await.unwrap().is_none(), "{} still stored", key);
    }
    assert!(h
        .store
        .get_by_id(&EntityKey::message("m2"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn message_during_inflight_channel_create_is_applied_afterwards() {
    let h = harness().await;
    h.go_online().await;
    let key = EntityKey::channel("messaging:busy");
    h.transport.push_delayed(
        "create",
        Duration::from_millis(300),
        Ok(RemotePayload::Entity(synced_channel("messaging:busy"))),
    );

    let mut rx = h.client.subscribe_events();
    let create = {
        let client = h.client.clone();
        tokio::spawn(async move {
            client
                .create_channel("messaging", "busy", vec!["alice".to_string()], Default::default())
                .await
        })
    };
    wait_for_status(&mut rx, &key, SyncStatus::InProgress).await;

    let message = EntityRecord::message("messaging:busy", "m1", "early").with_created_at(500);
    h.transport.emit_domain(DomainEvent::MessageNew(message));

    let result = create.await.unwrap().unwrap();
    assert!(result.is_synced());
    eventually(|| {
        let client = h.client.clone();
        async move {
            let channel = client.channel("messaging:busy").await.unwrap().unwrap();
            channel.last_message_at == Some(500)
        }
    })
    .await;
    let channel = h.client.channel("messaging:busy").await.unwrap().unwrap();
    assert_eq!(channel.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn live_events_fold_into_pending_channel() {
    let h = harness().await;
    h.client
        .create_channel("messaging", "draft", vec!["alice".to_string()], Default::default())
        .await
        .unwrap();

    h.transport.emit_domain(DomainEvent::MessageNew(
        EntityRecord::message("messaging:draft", "m1", "hi").with_created_at(700),
    ));
    eventually(|| {
        let client = h.client.clone();
        async move {
            let channel = client.channel("messaging:draft").await.unwrap().unwrap();
            channel.last_message_at == Some(700)
        }
    })
    .await;
    let channel = h.client.channel("messaging:draft").await.unwrap().unwrap();
    assert_eq!(channel.sync_status, SyncStatus::SyncNeeded);
    assert_eq!(channel.pending_mutation, Some(MutationKind::Create));
}
