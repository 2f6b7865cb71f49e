//! Per-stream notification bus.
//!
//! A liveness signal, not a data channel: waiters re-read storage after a
//! wake. Lagged receivers are fine for the same reason - missing an
//! intermediate `Appended` only means the next read returns more data.

use tokio::sync::broadcast;

use crate::offset::OffsetToken;

/// Signal published to blocked readers.
#[derive(Clone, Debug)]
pub enum StreamSignal {
    /// The head advanced to this offset.
    Appended(OffsetToken),
    /// The stream was deleted; readers should terminate.
    Deleted,
}

/// Broadcast bus for one stream.
pub struct NotifyBus {
    tx: broadcast::Sender<StreamSignal>,
}

impl NotifyBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Register a waiter. Subscribing before re-checking the head closes the
    /// publish race: a signal sent after `subscribe` returns is never lost.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamSignal> {
        self.tx.subscribe()
    }

    /// Wake all current waiters. No-op when nobody is waiting.
    pub fn publish(&self, signal: StreamSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiter_registered_before_publish_sees_wake() {
        let bus = NotifyBus::new();
        let mut rx = bus.subscribe();
        bus.publish(StreamSignal::Appended(OffsetToken::first()));
        match rx.recv().await.unwrap() {
            StreamSignal::Appended(o) => assert_eq!(o, OffsetToken::first()),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_waiters_is_a_noop() {
        let bus = NotifyBus::new();
        bus.publish(StreamSignal::Deleted);
        // A receiver subscribed after the fact sees nothing.
        let mut rx = bus.subscribe();
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn all_waiters_wake() {
        let bus = NotifyBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(StreamSignal::Deleted);
        assert!(matches!(a.recv().await.unwrap(), StreamSignal::Deleted));
        assert!(matches!(b.recv().await.unwrap(), StreamSignal::Deleted));
    }
}
