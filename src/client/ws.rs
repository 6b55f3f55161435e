//! tokio + WebSocket runtime for [`StreamClient`].
//!
//! Each session runs as its own task and reports back over a channel; the
//! [`StreamDriver`] drains that channel on a single task and feeds the state
//! machine, so handlers run one at a time in delivery order. Timers are tokio
//! sleep tasks that are aborted on cancellation.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ReconnectPolicy, Scheduler, SessionId, StreamClient, TimerHandle, TimerId, Transport,
    TransportError, TransportEvent,
};

/// Work for the driver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    RetryElapsed(TimerId),
}

type EventSender = mpsc::UnboundedSender<DriverEvent>;

struct LiveSession {
    id: SessionId,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

/// WebSocket transport backed by `tokio-tungstenite`.
///
/// Must be used from within a tokio runtime.
pub struct WsTransport {
    events: EventSender,
    live: Option<LiveSession>,
}

impl WsTransport {
    fn new(events: EventSender) -> Self {
        Self { events, live: None }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, session: SessionId, url: &str) -> Result<(), TransportError> {
        let request =
            url.into_client_request()
                .map_err(|e| TransportError::InvalidEndpoint {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        if let Some(previous) = self.live.take() {
            previous.shutdown.cancel();
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_session(
            session,
            request,
            outbound_rx,
            shutdown.clone(),
            self.events.clone(),
        ));

        self.live = Some(LiveSession {
            id: session,
            outbound: outbound_tx,
            shutdown,
        });
        Ok(())
    }

    fn send(&mut self, session: SessionId, text: String) -> Result<(), TransportError> {
        match &self.live {
            Some(live) if live.id == session => {
                live.outbound.send(text).map_err(|_| TransportError::Closed)
            }
            _ => Err(TransportError::NotOpen(session)),
        }
    }

    fn close(&mut self, session: SessionId) {
        if self.live.as_ref().is_some_and(|live| live.id == session) {
            if let Some(live) = self.live.take() {
                live.shutdown.cancel();
            }
        }
    }
}

type ClientRequest = tokio_tungstenite::tungstenite::handshake::client::Request;

async fn run_session(
    session: SessionId,
    request: ClientRequest,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    events: EventSender,
) {
    let emit = |event: TransportEvent| {
        // The driver owns the receiver; if it is gone nobody is listening.
        let _ = events.send(DriverEvent::Transport { session, event });
    };

    let connected = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = tokio_tungstenite::connect_async(request) => result,
    };

    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            emit(TransportEvent::Error(e.to_string()));
            emit(TransportEvent::Closed);
            return;
        }
    };

    emit(TransportEvent::Opened);
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Closed on request: the session is already stale, report nothing.
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    emit(TransportEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(session, ?frame, "server closed the stream");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    emit(TransportEvent::Closed);
}

/// Timer handle for [`TokioScheduler`].
#[derive(Debug)]
pub struct TokioTimer(AbortHandle);

impl TimerHandle for TokioTimer {
    fn cancel(self) {
        self.0.abort();
    }
}

/// One-shot timers as tokio sleep tasks.
pub struct TokioScheduler {
    events: EventSender,
}

impl Scheduler for TokioScheduler {
    type Handle = TokioTimer;

    fn schedule(&mut self, timer: TimerId, delay: Duration) -> TokioTimer {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(DriverEvent::RetryElapsed(timer));
        });
        TokioTimer(task.abort_handle())
    }
}

pub type WsStreamClient = StreamClient<WsTransport, TokioScheduler>;

/// Owns a [`WsStreamClient`] and the channel its transport and timers report on.
pub struct StreamDriver {
    client: WsStreamClient,
    events: mpsc::UnboundedReceiver<DriverEvent>,
}

impl StreamDriver {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = StreamClient::new(
            url,
            policy,
            WsTransport::new(tx.clone()),
            TokioScheduler { events: tx },
        );
        Self { client, events: rx }
    }

    pub fn client(&self) -> &WsStreamClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut WsStreamClient {
        &mut self.client
    }

    /// Waits for the next event. Never yields `None` while the driver is alive,
    /// since the transport and scheduler hold senders.
    pub async fn recv(&mut self) -> Option<DriverEvent> {
        self.events.recv().await
    }

    pub fn dispatch(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Transport { session, event } => self.client.handle(session, event),
            DriverEvent::RetryElapsed(timer) => self.client.retry_elapsed(timer),
        }
    }

    /// Connects and pumps events until `shutdown` fires, then disconnects.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        self.client.connect();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        warn!("stream driver channel closed");
                        break;
                    }
                },
            }
        }
        self.client.disconnect();
    }
}
