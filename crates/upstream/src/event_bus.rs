use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use futures::StreamExt;
use gateway_domain::capability::EventBusClient;
use gateway_domain::model::OrderEvent;
use metrics::counter;
use serde::Deserialize;
use tokio::{net::TcpStream, sync::broadcast, time::sleep};
use tokio_tungstenite::{
    connect_async, tungstenite::Error as WsError, tungstenite::Message, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{info, warn};

use crate::UpstreamError;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Event-bus client backed by an upstream WebSocket feed. Decoded events are
/// fanned out to every subscriber through a broadcast channel; the feed task
/// reconnects on its own and stops once the client is dropped.
pub struct EventBusFeed {
    sender: broadcast::Sender<OrderEvent>,
}

impl EventBusFeed {
    /// A feed with no upstream attached. Events only arrive through
    /// [`EventBusFeed::publish`].
    pub fn detached() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Opens the upstream connection. Failing to connect here means the
    /// event bus is unavailable for this process.
    pub async fn connect(url: &str) -> Result<Arc<Self>, UpstreamError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| UpstreamError::EventBus(err.to_string()))?;
        info!(url, "connected to event bus");

        let feed = Arc::new(Self::detached());
        tokio::spawn(follow_feed(url.to_owned(), stream, Arc::downgrade(&feed)));
        Ok(feed)
    }

    /// Fans an event out to current subscribers and returns how many
    /// received it.
    pub fn publish(&self, event: OrderEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl EventBusClient for EventBusFeed {
    fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.sender.subscribe()
    }
}

enum FeedExit {
    Closed,
    Detached,
}

async fn follow_feed(url: String, mut stream: FeedStream, feed: Weak<EventBusFeed>) {
    let mut backoff = ReconnectBackoff::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY);
    loop {
        match pump_events(&mut stream, &feed).await {
            Ok(FeedExit::Detached) => return,
            Ok(FeedExit::Closed) => info!("event bus closed the connection"),
            Err(err) => warn!(%err, "event bus connection lost"),
        }

        stream = loop {
            if feed.strong_count() == 0 {
                return;
            }
            let delay = backoff.next_delay();
            warn!(delay_ms = delay.as_millis() as u64, "reconnecting to event bus");
            sleep(delay).await;
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    backoff.reset();
                    info!(url = url.as_str(), "reconnected to event bus");
                    break stream;
                }
                Err(err) => warn!(%err, "event bus reconnect failed"),
            }
        };
    }
}

async fn pump_events(
    stream: &mut FeedStream,
    feed: &Weak<EventBusFeed>,
) -> Result<FeedExit, WsError> {
    while let Some(message) = stream.next().await {
        let Some(feed) = feed.upgrade() else {
            return Ok(FeedExit::Detached);
        };
        let events = match message? {
            Message::Text(text) => decode_events(text.as_str().as_bytes()),
            Message::Binary(bytes) => decode_events(&bytes),
            Message::Close(_) => return Ok(FeedExit::Closed),
            _ => continue,
        };
        for event in events {
            feed.publish(event);
        }
    }
    Ok(FeedExit::Closed)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Batch(Vec<OrderEvent>),
    Single(OrderEvent),
}

/// Decodes a feed frame holding either one event or a batch. Undecodable
/// frames are counted and dropped.
pub fn decode_events(frame: &[u8]) -> Vec<OrderEvent> {
    match serde_json::from_slice::<Envelope>(frame) {
        Ok(Envelope::Batch(events)) => events,
        Ok(Envelope::Single(event)) => vec![event],
        Err(err) => {
            counter!("gateway_event_bus_frames_dropped_total").increment(1);
            warn!(%err, "dropping undecodable event bus frame");
            Vec::new()
        }
    }
}

/// Doubling reconnect delay capped at `max`.
#[derive(Debug)]
struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_domain::model::OrderEventKind;
    use serde_json::json;

    fn event_json(hash: &str) -> serde_json::Value {
        json!({
            "orderHash": hash,
            "makerAddress": "0xmaker",
            "makerToken": "0xaaa",
            "takerToken": "0xbbb",
            "kind": "added",
        })
    }

    #[test]
    fn decodes_single_and_batched_frames() {
        let single = serde_json::to_vec(&event_json("0x1")).unwrap();
        let events = decode_events(&single);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, OrderEventKind::Added);

        let batch = serde_json::to_vec(&json!([event_json("0x1"), event_json("0x2")])).unwrap();
        let events = decode_events(&batch);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].order_hash, "0x2");
    }

    #[test]
    fn drops_garbage_frames() {
        assert!(decode_events(b"not json").is_empty());
        assert!(decode_events(br#"{"orderHash": 1}"#).is_empty());
    }

    #[test]
    fn backoff_doubles_until_cap_and_resets() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn detached_feed_fans_out_to_subscribers() {
        let feed = EventBusFeed::detached();
        let mut first = feed.subscribe();
        let mut second = feed.subscribe();

        let event: OrderEvent = serde_json::from_value(event_json("0xabc")).unwrap();
        assert_eq!(feed.publish(event.clone()), 2);
        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn unreachable_event_bus_fails_to_connect() {
        let err = EventBusFeed::connect("ws://127.0.0.1:1/events")
            .await
            .err()
            .expect("connection refused");
        assert!(matches!(err, UpstreamError::EventBus(_)));
    }
}
