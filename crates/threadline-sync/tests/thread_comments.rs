//! A thread's comment list kept live while comments are posted and removed
//! through the cached collection.

use std::time::Duration;

use pretty_assertions::assert_eq;
use threadline_pb::{Comment, CommentValues, ConnectionStatus, ListOptions};
use threadline_sync::{
    CachedCollection, ListParams, ListSnapshot, MemorySource, QueryCache, QueryMethod,
    RealtimeListResource, ResourceState,
};
use tokio::sync::watch;
use tokio::time::timeout;

async fn wait_for_ids(rx: &mut watch::Receiver<ListSnapshot<Comment>>, expected: &[&str]) {
    let reached = timeout(
        Duration::from_secs(2),
        rx.wait_for(|snapshot| snapshot.ids() == expected),
    )
    .await
    .is_ok();
    assert!(reached, "timed out waiting for ids {:?}", expected);
}

fn comment(thread: &str, content: &str) -> CommentValues {
    CommentValues {
        thread: Some(thread.to_string()),
        author: Some("u1".to_string()),
        content: Some(content.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn posted_and_deleted_comments_reach_the_live_list() {
    let source: MemorySource<Comment> = MemorySource::new();
    let cache = QueryCache::new();
    let comments: CachedCollection<Comment, _> = cache.collection(source.clone());

    let resource: RealtimeListResource<Comment, _> = RealtimeListResource::open(
        source.clone(),
        ListParams::new().filter("thread = 't1'").sort("created"),
    );
    resource.load().await.unwrap();
    assert_eq!(resource.state(), ResourceState::Resolved);
    assert!(resource.snapshot().is_empty());

    // Warm the cache so the mutation has something to invalidate
    comments.get_list(1, 50, &ListOptions::new()).await.unwrap();
    assert_eq!(cache.len(), 1);

    let mut rx = resource.watch();
    let first = comments.create(&comment("t1", "first")).await.unwrap();
    assert!(cache.is_empty());
    wait_for_ids(&mut rx, &[first.system.id.as_str()]).await;

    let second = comments.create(&comment("t1", "second")).await.unwrap();
    wait_for_ids(&mut rx, &[first.system.id.as_str(), second.system.id.as_str()]).await;

    comments.delete(&first.system.id).await.unwrap();
    wait_for_ids(&mut rx, &[second.system.id.as_str()]).await;

    let snapshot = resource.snapshot();
    assert_eq!(snapshot.total_items, 1);
    assert_eq!(snapshot.items[0].content, "second");

    resource.close().await;
    assert_eq!(source.active_subscriptions(), 0);
}

#[tokio::test]
async fn edits_flow_through_and_cached_reads_refresh() {
    let source = MemorySource::with_records(vec![Comment::new("c1", "t1", "draft")]);
    let cache = QueryCache::new();
    let comments: CachedCollection<Comment, _> = cache.collection(source.clone());

    let resource: RealtimeListResource<Comment, _> =
        RealtimeListResource::open(source.clone(), ListParams::new());
    resource.load().await.unwrap();

    let before = comments.get_one("c1", &Default::default()).await.unwrap();
    assert_eq!(before.content, "draft");
    assert_eq!(comments.invalidate_method(QueryMethod::GetList), 0);

    let mut rx = resource.watch();
    comments
        .update("c1", &serde_json::json!({ "content": "final" }))
        .await
        .unwrap();

    let reached = timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| s.get("c1").map(|c| c.content.as_str()) == Some("final")),
    )
    .await
    .is_ok();
    assert!(reached, "update never reached the list");

    let after = comments.get_one("c1", &Default::default()).await.unwrap();
    assert_eq!(after.content, "final");
}

#[tokio::test]
async fn connection_status_is_forwarded() {
    let source: MemorySource<Comment> = MemorySource::new();
    let resource: RealtimeListResource<Comment, _> =
        RealtimeListResource::open(source.clone(), ListParams::new());
    resource.subscribe().await.unwrap();

    let mut connection = resource.connection();
    let reached = timeout(
        Duration::from_secs(2),
        connection.wait_for(|s| *s == ConnectionStatus::Connected),
    )
    .await
    .is_ok();
    assert!(reached);

    source.set_connection(ConnectionStatus::Disconnected);
    let reached = timeout(
        Duration::from_secs(2),
        connection.wait_for(|s| *s == ConnectionStatus::Disconnected),
    )
    .await
    .is_ok();
    assert!(reached);
}
