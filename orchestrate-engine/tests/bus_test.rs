use orchestrate_engine::stage::{self, topic};
use orchestrate_engine::test_utils::create_test_db;
use orchestrate_engine::{
    EventBus, OrchestratorError, RequestKind, SqliteEventBus, Stage, StageEvent,
};
use serde_json::json;

fn event(request_id: &str, attempt: u32) -> StageEvent {
    StageEvent::succeeded(request_id, Stage::Start, attempt, json!({}))
}

#[tokio::test]
async fn test_subscription_delivers_in_publish_order() {
    let bus = SqliteEventBus::new(create_test_db().await).with_batch_size(2);
    let start = topic(RequestKind::Image, Stage::Start);
    let end = topic(RequestKind::Image, Stage::End);

    for i in 1..=5 {
        bus.publish(&start, &event(&format!("req-{}", i), 1)).await.unwrap();
    }
    bus.publish(&end, &event("req-other", 1)).await.unwrap();

    let mut subscription = bus.subscribe("tester", &start).await.unwrap();
    assert_eq!(subscription.topic(), start);

    let mut seen = Vec::new();
    while let Some(delivery) = subscription.next().await.unwrap() {
        assert_eq!(delivery.topic, start);
        seen.push(delivery.event().unwrap().request_id);
    }

    assert_eq!(seen, vec!["req-1", "req-2", "req-3", "req-4", "req-5"]);
}

#[tokio::test]
async fn test_unacked_messages_are_redelivered() {
    let bus = SqliteEventBus::new(create_test_db().await);
    let start = topic(RequestKind::Template, Stage::Start);

    bus.publish(&start, &event("req-1", 1)).await.unwrap();
    bus.publish(&start, &event("req-2", 1)).await.unwrap();

    let mut subscription = bus.subscribe("tester", &start).await.unwrap();
    let first = subscription.next().await.unwrap().unwrap();
    subscription.ack(first.seq).await.unwrap();
    let second = subscription.next().await.unwrap().unwrap();
    assert_eq!(second.event().unwrap().request_id, "req-2");
    drop(subscription);

    // req-2 was never acknowledged
    let mut subscription = bus.subscribe("tester", &start).await.unwrap();
    let redelivered = subscription.next().await.unwrap().unwrap();
    assert_eq!(redelivered.seq, second.seq);
    assert_eq!(bus.backlog("tester", &start).await.unwrap(), 1);

    // Subscribers keep independent offsets
    assert_eq!(bus.backlog("someone-else", &start).await.unwrap(), 2);
}

#[tokio::test]
async fn test_ack_never_moves_backwards() {
    let bus = SqliteEventBus::new(create_test_db().await);
    let start = topic(RequestKind::Instance, Stage::Start);

    let first = bus.publish(&start, &event("req-1", 1)).await.unwrap();
    let second = bus.publish(&start, &event("req-2", 1)).await.unwrap();

    let mut subscription = bus.subscribe("tester", &start).await.unwrap();
    subscription.ack(second).await.unwrap();
    subscription.ack(first).await.unwrap();

    assert_eq!(bus.acked_seq("tester", &start).await.unwrap(), second);
    assert_eq!(bus.backlog("tester", &start).await.unwrap(), 0);
}

#[tokio::test]
async fn test_history_decodes_published_events() {
    let bus = SqliteEventBus::new(create_test_db().await);
    let end = topic(RequestKind::System, Stage::End);

    bus.publish(&end, &event("req-1", 2)).await.unwrap();

    let history = bus.history(&end).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].attempt, 2);
}

#[test]
fn test_decode_rejects_unknown_version() {
    let payload = stage::encode(&event("req-1", 1)).unwrap().replacen(
        "\"version\":1",
        "\"version\":2",
        1,
    );

    assert!(matches!(
        stage::decode(&payload),
        Err(OrchestratorError::MalformedEvent(_))
    ));
}
