//! Server-sent-event fan-out, keyed by channel.
//!
//! Each channel owns its subscriber set and a replay source that renders the
//! current snapshot for late joiners. Delivery is best-effort per subscriber:
//! a full or closed queue disconnects that subscriber and nobody else, and
//! publishing never blocks the producer.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Frames a subscriber can buffer before it is considered too slow and is
/// disconnected.
const SUBSCRIBER_BUFFER: usize = 64;

/// Comment frame used as a heartbeat; keeps intermediaries from reaping idle
/// connections.
const HEARTBEAT_FRAME: &[u8] = b":\n\n";

/// A named SSE event with a JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub name: &'static str,
    pub data: String,
}

impl Event {
    pub fn new(name: &'static str, data: String) -> Self {
        Event { name, data }
    }

    /// Renders the wire frame. Multi-line payloads become one `data:` line
    /// per input line, per the SSE framing rules.
    pub fn to_frame(&self) -> Bytes {
        let mut frame = String::with_capacity(self.data.len() + 16);
        frame.push_str("event: ");
        frame.push_str(self.name);
        frame.push('\n');
        for line in self.data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        Bytes::from(frame)
    }
}

/// Source of the synthetic snapshot event sent to every new subscriber.
#[async_trait]
pub trait Replay: Send + Sync {
    /// Returns the replay event, or None when no snapshot exists yet.
    async fn replay(&self) -> Option<Event>;
}

struct Subscriber {
    tx: mpsc::Sender<Bytes>,
}

struct Channel {
    replay: Arc<dyn Replay>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

/// Fan-out broadcaster for all environments' channels.
pub struct EventPublisher {
    channels: RwLock<HashMap<String, Channel>>,
    heartbeat: Option<Duration>,
}

impl EventPublisher {
    /// `heartbeat` of None (or a zero interval upstream of this call)
    /// disables heartbeats.
    pub fn new(heartbeat: Option<Duration>) -> Self {
        EventPublisher {
            channels: RwLock::new(HashMap::new()),
            heartbeat,
        }
    }

    /// Creates the channel and starts its heartbeat ticker if configured.
    pub fn register(&self, channel: &str, replay: Arc<dyn Replay>) {
        let subscribers = Arc::new(Mutex::new(Vec::new()));

        if let Some(interval) = self.heartbeat {
            let subscribers = subscribers.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so idle
                // subscribers see heartbeats at the configured cadence.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    fan_out(&subscribers, Bytes::from_static(HEARTBEAT_FRAME));
                }
            });
        }

        self.channels.write().insert(
            channel.to_string(),
            Channel {
                replay,
                subscribers,
            },
        );
    }

    /// Delivers an event to every current subscriber of the channel,
    /// serialising it once. Unknown channels are a no-op.
    pub fn publish(&self, channel: &str, event: &Event) {
        let subscribers = {
            let channels = self.channels.read();
            match channels.get(channel) {
                Some(c) => c.subscribers.clone(),
                None => return,
            }
        };
        fan_out(&subscribers, event.to_frame());
    }

    /// Attaches a new subscriber: the replay event is queued first, then the
    /// subscriber joins the live fan-out. Returns the streaming response
    /// body, or None for an unknown channel.
    pub async fn subscribe(&self, channel: &str) -> Option<BoxBody<Bytes, Infallible>> {
        let (replay, subscribers) = {
            let channels = self.channels.read();
            let c = channels.get(channel)?;
            (c.replay.clone(), c.subscribers.clone())
        };

        let (tx, rx) = mpsc::channel::<Bytes>(SUBSCRIBER_BUFFER);

        if let Some(event) = replay.replay().await {
            // The queue is freshly created, so there is always room.
            let _ = tx.try_send(event.to_frame());
        }

        subscribers.lock().push(Subscriber { tx });

        let stream = ReceiverStream::new(rx).map(|chunk| Ok(Frame::data(chunk)));
        Some(BodyExt::boxed(StreamBody::new(stream)))
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|c| c.subscribers.lock().len())
            .unwrap_or(0)
    }
}

/// Best-effort delivery: subscribers that cannot take the frame (queue full
/// or connection gone) are dropped here.
fn fan_out(subscribers: &Mutex<Vec<Subscriber>>, frame: Bytes) {
    subscribers
        .lock()
        .retain(|s| s.tx.try_send(frame.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoReplay;

    #[async_trait]
    impl Replay for NoReplay {
        async fn replay(&self) -> Option<Event> {
            None
        }
    }

    struct FixedReplay(Event);

    #[async_trait]
    impl Replay for FixedReplay {
        async fn replay(&self) -> Option<Event> {
            Some(self.0.clone())
        }
    }

    async fn next_frame(body: &mut BoxBody<Bytes, Infallible>) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("frame error");
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn frames_are_sse_formatted() {
        let event = Event::new("patch", r#"{"path":"/flags/x"}"#.to_string());
        assert_eq!(
            event.to_frame(),
            Bytes::from("event: patch\ndata: {\"path\":\"/flags/x\"}\n\n")
        );
    }

    #[test]
    fn multi_line_data_gets_one_data_line_each() {
        let event = Event::new("put", "a\nb".to_string());
        assert_eq!(event.to_frame(), Bytes::from("event: put\ndata: a\ndata: b\n\n"));
    }

    #[tokio::test]
    async fn replay_is_delivered_before_live_events() {
        let publisher = EventPublisher::new(None);
        publisher.register(
            "chan",
            Arc::new(FixedReplay(Event::new("put", "snapshot".to_string()))),
        );

        let mut body = publisher.subscribe("chan").await.unwrap();
        publisher.publish("chan", &Event::new("patch", "delta".to_string()));

        assert!(next_frame(&mut body).await.contains("snapshot"));
        assert!(next_frame(&mut body).await.contains("delta"));
    }

    #[tokio::test]
    async fn unknown_channel_refuses_subscription() {
        let publisher = EventPublisher::new(None);
        assert!(publisher.subscribe("nope").await.is_none());
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers_in_order() {
        let publisher = EventPublisher::new(None);
        publisher.register("chan", Arc::new(NoReplay));

        let mut a = publisher.subscribe("chan").await.unwrap();
        let mut b = publisher.subscribe("chan").await.unwrap();

        publisher.publish("chan", &Event::new("patch", "one".to_string()));
        publisher.publish("chan", &Event::new("patch", "two".to_string()));

        for body in [&mut a, &mut b] {
            assert!(next_frame(body).await.contains("one"));
            assert!(next_frame(body).await.contains("two"));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_affecting_others() {
        let publisher = Arc::new(EventPublisher::new(None));
        publisher.register("chan", Arc::new(NoReplay));

        // Subscriber that never reads.
        let _stalled = publisher.subscribe("chan").await.unwrap();

        // Subscriber with a task draining frames as they arrive.
        let mut healthy = publisher.subscribe("chan").await.unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = healthy.frame().await {
                let _ = seen_tx.send(String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap());
            }
        });

        assert_eq!(publisher.subscriber_count("chan"), 2);

        for i in 0..=SUBSCRIBER_BUFFER {
            publisher.publish("chan", &Event::new("patch", format!("n{i}")));
            tokio::task::yield_now().await;
        }

        publisher.publish("chan", &Event::new("patch", "final".to_string()));
        assert_eq!(publisher.subscriber_count("chan"), 1);

        let mut got_final = false;
        while let Some(frame) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("timed out draining healthy subscriber")
        {
            if frame.contains("final") {
                got_final = true;
                break;
            }
        }
        assert!(got_final);
    }

    #[tokio::test]
    async fn idle_subscriber_receives_heartbeats() {
        let publisher = EventPublisher::new(Some(Duration::from_millis(20)));
        publisher.register("chan", Arc::new(NoReplay));

        let mut body = publisher.subscribe("chan").await.unwrap();
        let frame = next_frame(&mut body).await;
        assert!(frame.starts_with(':'), "expected comment frame, got {frame:?}");
    }
}
