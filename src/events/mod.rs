//! Broadcast notifications for flow-control and pipeline activity.
//!
//! Every externally visible transition (upstream state changes, measured
//! bitrate samples, source readiness, encoder failures) is published here
//! and fanned out to WebSocket clients and any internal listener.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Ring buffer size per subscriber. Bitrate samples arrive every two
/// seconds at most, so a slow client has plenty of headroom before lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out bus for [`SystemEvent`] notifications.
///
/// Thin wrapper over a tokio broadcast channel. Publishing never blocks
/// and never fails; a subscriber that falls behind gets a `Lagged` error
/// from its receiver and simply misses the overwritten events.
///
/// ```no_run
/// use av_uplink::events::{EventBus, SystemEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(SystemEvent::UpstreamStateChanged { state: 1 });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Fire-and-forget: with no subscribers attached the event is dropped.
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Open a new receiver that sees all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Number of currently attached receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SystemEvent::UpstreamStateChanged { state: 3 });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                SystemEvent::UpstreamStateChanged { state } => assert_eq!(state, 3),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(SystemEvent::SourceReady);

        let mut rx = bus.subscribe();
        bus.publish(SystemEvent::TcpBitrate { kbit_per_sec: 2500 });

        match rx.recv().await.unwrap() {
            SystemEvent::TcpBitrate { kbit_per_sec } => assert_eq!(kbit_per_sec, 2500),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(SystemEvent::SourceReady);
    }
}
