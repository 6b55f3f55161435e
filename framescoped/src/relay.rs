//! Fan-out relay between a producer and any number of viewers.
//!
//! Whoever sends `frame`, `stats` or `error` messages is treated as the
//! producer; its messages are forwarded to every other client. The
//! latest frame and stats are cached so a viewer that connects mid-stream gets
//! something to show immediately.
//!
//! Producers that send flat messages (`{"type":"frame","width":..}` with the
//! payload fields beside the tag, as the Android capture app does) are
//! wrapped into the `{type,data}` envelope before forwarding.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use framescope::protocol::{self, DecodeError, Envelope, MessageKind};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

pub type ClientId = u64;

/// Sender id used by the built-in mock producer.
pub const MOCK_CLIENT: ClientId = 0;

pub const WELCOME_MESSAGE: &str = "Connected to framescope relay";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub from: ClientId,
    pub text: Arc<str>,
}

#[derive(Debug, Default)]
struct Latest {
    frame: Option<Arc<str>>,
    stats: Option<Arc<str>>,
}

pub struct Relay {
    latest: RwLock<Latest>,
    tx: broadcast::Sender<Outbound>,
    next_client: AtomicU64,
}

impl Relay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: RwLock::new(Latest::default()),
            tx,
            next_client: AtomicU64::new(MOCK_CLIENT + 1),
        }
    }

    pub fn register(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    /// Caches (frames and stats only) and forwards `text`.
    ///
    /// Returns the number of subscribers it was queued for.
    pub async fn publish(&self, from: ClientId, kind: MessageKind, text: String) -> usize {
        let text: Arc<str> = text.into();
        {
            let mut latest = self.latest.write().await;
            match kind {
                MessageKind::Frame => latest.frame = Some(Arc::clone(&text)),
                MessageKind::Stats => latest.stats = Some(Arc::clone(&text)),
                MessageKind::Error => {}
            }
        }
        self.tx.send(Outbound { from, text }).unwrap_or(0)
    }

    /// Cached messages for a newly connected viewer: frame first, then stats.
    pub async fn replay(&self) -> Vec<Arc<str>> {
        let latest = self.latest.read().await;
        latest
            .frame
            .iter()
            .chain(latest.stats.iter())
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// What to do with a message received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Forward(MessageKind),
    Ignore(String),
    Reject(String),
}

/// Wraps a flat producer message into the `{type,data}` envelope.
///
/// Anything that is not a JSON object with a string `type` and no `data`
/// field is returned as is.
pub fn normalize(text: &str) -> Cow<'_, str> {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(text) else {
        return Cow::Borrowed(text);
    };
    if fields.contains_key("data") || !fields.get("type").is_some_and(Value::is_string) {
        return Cow::Borrowed(text);
    }

    let tag = fields.remove("type").unwrap_or(Value::Null);
    let mut envelope = Map::new();
    envelope.insert("type".to_string(), tag);
    envelope.insert("data".to_string(), Value::Object(fields));
    Cow::Owned(Value::Object(envelope).to_string())
}

pub fn classify(text: &str) -> Inbound {
    match protocol::decode(text) {
        Ok(Envelope::Frame(frame)) => match frame.validate() {
            Ok(()) => Inbound::Forward(MessageKind::Frame),
            Err(e) => Inbound::Reject(e.to_string()),
        },
        Ok(envelope) => Inbound::Forward(envelope.kind()),
        Err(DecodeError::UnknownType(tag)) => Inbound::Ignore(tag),
        Err(e) => Inbound::Reject(e.to_string()),
    }
}

pub fn welcome() -> String {
    json!({ "type": "info", "data": WELCOME_MESSAGE }).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Viewer,
    Producer,
}

pub async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay>,
) -> Result<(), RelayError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let id = relay.register();
    let mut rx = relay.subscribe();
    let mut role = Role::Viewer;

    write.send(Message::Text(welcome().into())).await?;
    for text in relay.replay().await {
        write.send(Message::Text(text.to_string().into())).await?;
    }

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(raw))) => {
                    let text = normalize(raw.as_str());
                    match classify(&text) {
                        Inbound::Forward(kind) => {
                            if role == Role::Viewer {
                                info!(%addr, "producer attached");
                                role = Role::Producer;
                            }
                            let queued = relay.publish(id, kind, text.into_owned()).await;
                            debug!(%addr, %kind, queued, "forwarded");
                        }
                        Inbound::Ignore(tag) => debug!(%addr, %tag, "ignoring message"),
                        Inbound::Reject(reason) => warn!(%addr, %reason, "rejected message"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            outbound = rx.recv() => match outbound {
                Ok(msg) if msg.from == id || role == Role::Producer => {}
                Ok(msg) => write.send(Message::Text(msg.text.to_string().into())).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%addr, skipped, "viewer lagging; dropped messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if role == Role::Producer {
        info!(%addr, "producer disconnected");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;

    const FRAME: &str = r#"{"type":"frame","data":{"timestamp":1,"width":1920,"height":1080,"fps":21,"processingMode":3,"processingTime":8}}"#;
    const STATS: &str = r#"{"type":"stats","data":{"averageFPS":20,"maxFPS":30,"minFPS":10,"averageProcessingTime":9,"totalFrames":42,"uptime":1000}}"#;

    #[test]
    fn classify_sorts_messages() {
        assert_eq!(classify(FRAME), Inbound::Forward(MessageKind::Frame));
        assert_eq!(classify(STATS), Inbound::Forward(MessageKind::Stats));
        assert_eq!(
            classify(r#"{"type":"error","data":"lens cap"}"#),
            Inbound::Forward(MessageKind::Error)
        );
        assert_eq!(
            classify(r#"{"type":"echo","data":{}}"#),
            Inbound::Ignore("echo".to_string())
        );
        assert!(matches!(classify("garbage"), Inbound::Reject(_)));

        let zero_width = FRAME.replace("1920", "0");
        assert!(matches!(classify(&zero_width), Inbound::Reject(_)));
    }

    #[test]
    fn flat_producer_messages_are_enveloped() {
        let flat = r#"{"type":"frame","timestamp":1700000000000,"width":1280,"height":720,"fps":24.5,"processingMode":1,"processingTime":12}"#;
        let wrapped = normalize(flat);
        assert!(matches!(wrapped, Cow::Owned(_)));
        assert_eq!(classify(&wrapped), Inbound::Forward(MessageKind::Frame));
        let Ok(Envelope::Frame(frame)) = protocol::decode(&wrapped) else {
            panic!("not a frame: {wrapped}");
        };
        assert_eq!((frame.width, frame.height), (1280, 720));
        assert_eq!(frame.processing_mode, protocol::ProcessingMode::CannyEdge);

        let flat_stats = r#"{"type":"stats","averageFPS":24,"maxFPS":28.8,"minFPS":19.2,"averageProcessingTime":12,"totalFrames":3,"uptime":1002}"#;
        assert_eq!(
            classify(&normalize(flat_stats)),
            Inbound::Forward(MessageKind::Stats)
        );
    }

    #[test]
    fn enveloped_and_non_object_messages_pass_through() {
        assert!(matches!(normalize(FRAME), Cow::Borrowed(t) if t == FRAME));
        assert!(matches!(normalize("garbage"), Cow::Borrowed("garbage")));
        assert!(matches!(normalize("[1,2]"), Cow::Borrowed(_)));
        assert!(matches!(normalize(r#"{"type":7}"#), Cow::Borrowed(_)));
    }

    #[test]
    fn welcome_is_an_info_message() {
        assert!(matches!(
            protocol::decode(&welcome()),
            Err(DecodeError::UnknownType(tag)) if tag == "info"
        ));
    }

    #[tokio::test]
    async fn publish_caches_latest_and_tags_sender() {
        let relay = Relay::new(8);
        let mut rx = relay.subscribe();
        assert!(relay.replay().await.is_empty());

        let queued = relay.publish(7, MessageKind::Stats, STATS.to_string()).await;
        assert_eq!(queued, 1);
        relay.publish(7, MessageKind::Frame, FRAME.to_string()).await;
        relay
            .publish(7, MessageKind::Error, r#"{"type":"error","data":"x"}"#.to_string())
            .await;

        let replay: Vec<String> = relay.replay().await.iter().map(|t| t.to_string()).collect();
        assert_eq!(replay, [FRAME, STATS]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.from, 7);
        assert_eq!(&*first.text, STATS);
    }

    #[tokio::test]
    async fn viewer_receives_producer_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(Relay::new(16));

        {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = listener.accept().await.unwrap();
                    let relay = Arc::clone(&relay);
                    tokio::spawn(async move {
                        let _ = handle_client(stream, peer, relay).await;
                    });
                }
            });
        }

        let url = format!("ws://{addr}/ws");
        let (mut viewer, _) = connect_async(url.as_str()).await.unwrap();
        let (mut producer, _) = connect_async(url.as_str()).await.unwrap();

        let next_text = |msg: Option<Result<Message, tungstenite::Error>>| match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            other => panic!("expected text, got {other:?}"),
        };

        assert_eq!(next_text(viewer.next().await), welcome());
        assert_eq!(next_text(producer.next().await), welcome());

        // Both sockets are registered once their welcome has arrived.
        while relay.subscriber_count() < 2 {
            tokio::task::yield_now().await;
        }

        producer
            .send(Message::Text(FRAME.to_string().into()))
            .await
            .unwrap();
        assert_eq!(next_text(viewer.next().await), FRAME);

        producer
            .send(Message::Text(
                r#"{"type":"stats","averageFPS":20,"maxFPS":30,"minFPS":10,"averageProcessingTime":9,"totalFrames":42,"uptime":1000}"#
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let forwarded = next_text(viewer.next().await);
        assert!(matches!(
            protocol::decode(&forwarded),
            Ok(Envelope::Stats(stats)) if stats.total_frames == 42
        ));

        // A late viewer gets the cached frame and stats after its welcome.
        let (mut late, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_text(late.next().await), welcome());
        assert_eq!(next_text(late.next().await), FRAME);
        assert_eq!(next_text(late.next().await), forwarded);
    }
}
