use super::*;
use tokio::time::{Duration, timeout};

async fn recv_bus(rx: &mut mpsc::Receiver<BusMessage>) -> BusMessage {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("bus receive timed out")
        .expect("sink closed")
}

#[test]
fn topic_round_trips_board_id() {
    let topic = board_topic("AAAAAAAAAAAA");
    assert_eq!(topic, "board.AAAAAAAAAAAA");
    assert_eq!(board_from_topic(&topic), Some("AAAAAAAAAAAA"));
}

#[test]
fn foreign_topics_have_no_board() {
    assert_eq!(board_from_topic("jobs.email"), None);
    assert_eq!(board_from_topic("board."), None);
}

#[tokio::test]
async fn publish_without_subscribers_is_ok() {
    let bus = MemoryBackplane::new();
    bus.publish("board.nobody", Bytes::from_static(b"x"), None)
        .await
        .expect("publish should succeed");
}

#[tokio::test]
async fn every_subscriber_gets_the_message_with_exclusion() {
    let bus = MemoryBackplane::new();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let _sub_a = bus.subscribe("board.t", tx_a).await.expect("subscribe a");
    let _sub_b = bus.subscribe("board.t", tx_b).await.expect("subscribe b");
    assert_eq!(bus.subscriber_count("board.t"), 2);

    bus.publish("board.t", Bytes::from_static(b"hello"), Some(7))
        .await
        .expect("publish");

    for rx in [&mut rx_a, &mut rx_b] {
        let msg = recv_bus(rx).await;
        assert_eq!(msg.topic, "board.t");
        assert_eq!(&msg.payload[..], b"hello");
        assert_eq!(msg.exclude_user, Some(7));
    }
}

#[tokio::test]
async fn topics_are_isolated() {
    let bus = MemoryBackplane::new();
    let (tx, mut rx) = mpsc::channel(8);
    let _sub = bus.subscribe("board.one", tx).await.expect("subscribe");

    bus.publish("board.two", Bytes::from_static(b"nope"), None)
        .await
        .expect("publish");

    assert!(timeout(Duration::from_millis(80), rx.recv()).await.is_err());
}

#[tokio::test]
async fn unsubscribe_releases_the_topic() {
    let bus = MemoryBackplane::new();
    let (tx, _rx) = mpsc::channel(8);
    let sub = bus.subscribe("board.gone", tx).await.expect("subscribe");
    assert_eq!(sub.topic(), "board.gone");
    assert_eq!(bus.subscriber_count("board.gone"), 1);

    bus.unsubscribe(sub).await;
    assert_eq!(bus.subscriber_count("board.gone"), 0);
}
