use super::*;
use std::collections::HashSet;

use futures::StreamExt;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_millis(200);

fn spec(durable: &str) -> ConsumerSpec {
    ConsumerSpec::new(StreamKind::Cmd, "cmd.documents.DeleteDocument", durable)
}

fn command(body: &str) -> OutboundMessage {
    OutboundMessage::new(StreamKind::Cmd, "cmd.documents.DeleteDocument", body.to_string())
}

async fn next(sub: &mut Subscription) -> Option<Delivery> {
    match timeout(WAIT, sub.next()).await {
        Ok(Some(Ok(delivery))) => Some(delivery),
        _ => None,
    }
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn test_publish_assigns_sequences() {
    let broker = ChannelBroker::new();

    let first = broker.publish(command("1")).await.unwrap();
    let second = broker.publish(command("2")).await.unwrap();

    assert_eq!(first.stream, "cmd");
    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    assert_eq!(broker.messages(StreamKind::Cmd).len(), 2);
    assert!(broker.messages(StreamKind::Events).is_empty());
}

#[tokio::test]
async fn test_publish_rejects_subject_outside_stream() {
    let broker = ChannelBroker::new();
    let msg = OutboundMessage::new(StreamKind::Events, "cmd.documents.DeleteDocument", "x");
    assert!(matches!(
        broker.publish(msg).await,
        Err(BusError::InvalidSubject(_))
    ));
}

#[tokio::test]
async fn test_publish_deduplicates_on_message_id() {
    let broker = ChannelBroker::new();

    let first = broker.publish(command("1").with_message_id("abc")).await.unwrap();
    let again = broker.publish(command("1").with_message_id("abc")).await.unwrap();

    assert!(!first.duplicate);
    assert!(again.duplicate);
    assert_eq!(again.sequence, first.sequence);
    assert_eq!(broker.messages(StreamKind::Cmd).len(), 1);
    assert_eq!(broker.messages(StreamKind::Cmd)[0].message_id, "abc");
}

#[tokio::test]
async fn test_message_id_falls_back_to_sequence() {
    let broker = ChannelBroker::new();
    broker.publish(command("1")).await.unwrap();
    assert_eq!(broker.messages(StreamKind::Cmd)[0].message_id, "1");
}

// ============================================================================
// Durable consumers
// ============================================================================

#[tokio::test]
async fn test_consumer_backfills_existing_messages() {
    let broker = ChannelBroker::new();
    broker.publish(command("early")).await.unwrap();

    let mut sub = broker.subscribe(spec("documents-document-delete")).await.unwrap();
    let delivery = next(&mut sub).await.expect("backfilled message");

    assert_eq!(delivery.message().payload.as_ref(), b"early");
    assert_eq!(delivery.message().delivered, 1);
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn test_consumer_receives_live_messages() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();

    broker.publish(command("live")).await.unwrap();

    let delivery = next(&mut sub).await.expect("live message");
    assert_eq!(delivery.message().subject, "cmd.documents.DeleteDocument");
    delivery.ack().await.unwrap();
    assert!(next(&mut sub).await.is_none());
}

#[tokio::test]
async fn test_filter_excludes_other_subjects() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();

    broker
        .publish(OutboundMessage::new(StreamKind::Cmd, "cmd.documents.CreateDocument", "x"))
        .await
        .unwrap();

    assert!(next(&mut sub).await.is_none());
}

#[tokio::test]
async fn test_queue_group_delivers_each_message_once() {
    let broker = Arc::new(ChannelBroker::new());
    let mut replica_a = broker.subscribe(spec("documents-document-delete")).await.unwrap();
    let mut replica_b = broker.subscribe(spec("documents-document-delete")).await.unwrap();

    for i in 0..20 {
        broker.publish(command(&i.to_string())).await.unwrap();
    }

    let collect = |mut sub: Subscription| async move {
        let mut seen = Vec::new();
        while let Some(delivery) = next(&mut sub).await {
            seen.push(String::from_utf8(delivery.message().payload.to_vec()).unwrap());
            delivery.ack().await.unwrap();
        }
        seen
    };
    let (a, b) = tokio::join!(collect(replica_a), collect(replica_b));

    let mut all: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
    all.sort();
    all.dedup();
    assert_eq!(a.len() + b.len(), 20);
    assert_eq!(all.len(), 20);

    let stats = broker
        .consumer_stats(StreamKind::Cmd, "documents-document-delete")
        .unwrap();
    assert_eq!(stats.delivered, 20);
    assert_eq!(stats.acked, 20);
}

#[tokio::test]
async fn test_distinct_durables_each_receive_everything() {
    let broker = ChannelBroker::new();
    let mut audit = broker.subscribe(spec("audit")).await.unwrap();
    let mut worker = broker.subscribe(spec("worker")).await.unwrap();

    broker.publish(command("x")).await.unwrap();

    assert!(next(&mut audit).await.is_some());
    assert!(next(&mut worker).await.is_some());
}

#[tokio::test]
async fn test_durable_filter_mismatch_rejected() {
    let broker = ChannelBroker::new();
    let _sub = broker.subscribe(spec("d")).await.unwrap();

    let other = ConsumerSpec::new(StreamKind::Cmd, "cmd.documents.CreateDocument", "d");
    assert!(matches!(
        broker.subscribe(other).await,
        Err(BusError::Subscribe(_))
    ));
}

// ============================================================================
// Settlement
// ============================================================================

#[tokio::test]
async fn test_nak_redelivers_with_incremented_count() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();
    broker.publish(command("x")).await.unwrap();

    let first = next(&mut sub).await.unwrap();
    first.nak(None).await.unwrap();

    let second = next(&mut sub).await.expect("redelivery");
    assert_eq!(second.message().delivered, 2);
    second.ack().await.unwrap();

    let stats = broker.consumer_stats(StreamKind::Cmd, "d").unwrap();
    assert_eq!(stats.naked, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test(start_paused = true)]
async fn test_nak_with_delay_waits_before_redelivery() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();
    broker.publish(command("x")).await.unwrap();

    let first = next(&mut sub).await.unwrap();
    first.nak(Some(Duration::from_secs(10))).await.unwrap();

    assert!(timeout(Duration::from_secs(9), sub.next()).await.is_err());
    let second = timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("redelivered after delay")
        .unwrap()
        .unwrap();
    assert_eq!(second.message().delivered, 2);
    second.ack().await.unwrap();
}

#[tokio::test]
async fn test_term_is_not_redelivered() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();
    broker.publish(command("x")).await.unwrap();

    next(&mut sub).await.unwrap().term().await.unwrap();

    assert!(next(&mut sub).await.is_none());
    let stats = broker.consumer_stats(StreamKind::Cmd, "d").unwrap();
    assert_eq!(stats.terminated, 1);
}

#[tokio::test]
async fn test_dropped_delivery_is_redelivered() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();
    broker.publish(command("x")).await.unwrap();

    drop(next(&mut sub).await.unwrap());

    let again = next(&mut sub).await.expect("redelivery after drop");
    assert_eq!(again.message().delivered, 2);
    again.ack().await.unwrap();

    let stats = broker.consumer_stats(StreamKind::Cmd, "d").unwrap();
    assert_eq!(stats.abandoned, 1);
}

#[tokio::test]
async fn test_max_deliver_stops_redelivery() {
    let broker = ChannelBroker::new();
    let mut sub = broker
        .subscribe(spec("d").with_max_deliver(Some(2)))
        .await
        .unwrap();
    broker.publish(command("x")).await.unwrap();

    next(&mut sub).await.unwrap().nak(None).await.unwrap();
    next(&mut sub).await.unwrap().nak(None).await.unwrap();

    assert!(next(&mut sub).await.is_none());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_close_ends_subscriptions_and_rejects_publish() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe(spec("d")).await.unwrap();

    broker.close().await.unwrap();

    assert!(matches!(
        broker.publish(command("x")).await,
        Err(BusError::Closed)
    ));
    let ended = timeout(WAIT, sub.next()).await.unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn test_wait_for_messages() {
    let broker = Arc::new(ChannelBroker::new());
    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher.publish(command("a")).await.unwrap();
        publisher.publish(command("b")).await.unwrap();
    });

    timeout(Duration::from_secs(1), broker.wait_for_messages(StreamKind::Cmd, 2))
        .await
        .unwrap();
    let ids: HashSet<_> = broker
        .messages(StreamKind::Cmd)
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(ids.len(), 2);
}

#[test]
fn test_messages_matching() {
    let broker = ChannelBroker::new();
    tokio_test::block_on(async {
        broker.publish(command("a")).await.unwrap();
        broker
            .publish(OutboundMessage::new(StreamKind::Cmd, "cmd.projects.CreateProject", "b"))
            .await
            .unwrap();
    });
    assert_eq!(broker.messages_matching(StreamKind::Cmd, "cmd.projects.>").len(), 1);
    assert_eq!(broker.messages_matching(StreamKind::Cmd, "cmd.>").len(), 2);
}
