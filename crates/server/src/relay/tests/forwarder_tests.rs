use super::*;
use std::time::Duration;
use tokio::sync::mpsc;

struct RecordingRelay {
    tx: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl ExternalRelay for RecordingRelay {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let _ = self.tx.send((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

struct BrokenRelay {
    attempts: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ExternalRelay for BrokenRelay {
    async fn publish(&self, _channel: &str, payload: &str) -> anyhow::Result<()> {
        let _ = self.attempts.send(payload.to_string());
        anyhow::bail!("relay unreachable")
    }
}

#[test]
fn full_queue_drops_oldest_payload() {
    let forwarder = RelayForwarder::new(2);
    forwarder.enqueue("a".into());
    forwarder.enqueue("b".into());
    forwarder.enqueue("c".into());

    assert_eq!(forwarder.pending(), 2);
    assert_eq!(forwarder.dropped(), 1);
    let queue = forwarder.queue.lock().expect("queue");
    assert_eq!(queue.iter().collect::<Vec<_>>(), vec!["b", "c"]);
}

#[tokio::test]
async fn forwards_payloads_in_order_to_channel() {
    let forwarder = RelayForwarder::new(16);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = forwarder.spawn(Arc::new(RecordingRelay { tx }), "chat-room-1");

    forwarder.enqueue("one".into());
    forwarder.enqueue("two".into());

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first in time")
        .expect("first");
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("second in time")
        .expect("second");
    assert_eq!(first, ("chat-room-1".to_string(), "one".to_string()));
    assert_eq!(second.1, "two");
    handle.abort();
}

#[tokio::test]
async fn relay_failures_do_not_stop_forwarding() {
    let forwarder = RelayForwarder::new(16);
    let (attempts, mut rx) = mpsc::unbounded_channel();
    let handle = forwarder.spawn(Arc::new(BrokenRelay { attempts }), "chat-room-1");

    forwarder.enqueue("x".into());
    forwarder.enqueue("y".into());

    for expected in ["x", "y"] {
        let attempt = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("attempt in time")
            .expect("attempt");
        assert_eq!(attempt, expected);
    }
    handle.abort();
}

#[test]
fn zero_capacity_still_keeps_latest() {
    let forwarder = RelayForwarder::new(0);
    forwarder.enqueue("a".into());
    forwarder.enqueue("b".into());
    assert_eq!(forwarder.pending(), 1);
    assert_eq!(forwarder.dropped(), 1);
}
