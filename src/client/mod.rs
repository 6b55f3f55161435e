//! Reconnecting stream client.
//!
//! [`StreamClient`] is a sans-io state machine. It never blocks and never
//! spawns anything itself: a [`Transport`] opens sessions and reports what
//! happens on them through [`StreamClient::handle`], and a [`Scheduler`] arms
//! the one-shot reconnection timer whose expiry is reported through
//! [`StreamClient::retry_elapsed`]. The tokio/WebSocket implementation of both
//! seams lives in [`ws`].
//!
//! Lifecycle:
//!
//! ```text
//!   Disconnected --connect()--> Connecting --Opened--> Connected
//!        ^                          |                      |
//!        +-------- Closed ----------+---------- Closed ----+
//!        |   (schedules retry k after base_delay * k while k <= max_attempts)
//!        +-------- disconnect() from any state (no retry)
//! ```

#[cfg(feature = "runtime")]
pub mod ws;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, DecodeError, Envelope, FrameRecord, StatsSnapshot};

/// Identifies one transport session. Every `connect()` opens a new one.
pub type SessionId = u64;

/// Identifies one armed reconnection timer.
pub type TimerId = u64;

/// Reported to the error handler when the transport reports a failure.
pub const TRANSPORT_ERROR_MESSAGE: &str = "WebSocket connection error";
/// Reported to the error handler when the transport cannot even be created.
pub const CONNECT_FAILED_MESSAGE: &str = "Failed to create WebSocket connection";
/// Reported to the error handler once the retry budget is spent.
pub const RECONNECT_EXHAUSTED_MESSAGE: &str =
    "Connection lost. Max reconnection attempts reached.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        })
    }
}

/// What a transport reports about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    /// A failure on the session. The transport follows up with `Closed`.
    Error(String),
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("session {0} is not open")]
    NotOpen(SessionId),

    #[error("transport is shut down")]
    Closed,
}

/// Connection seam.
pub trait Transport {
    /// Starts opening `session`. Outcome is reported later as events; an `Err`
    /// here means the session could not be created at all.
    fn open(&mut self, session: SessionId, url: &str) -> Result<(), TransportError>;

    fn send(&mut self, session: SessionId, text: String) -> Result<(), TransportError>;

    /// Tears `session` down. Events it still produces are stale.
    fn close(&mut self, session: SessionId);
}

/// Cancellable handle for an armed timer.
pub trait TimerHandle {
    fn cancel(self);
}

/// One-shot timer seam.
pub trait Scheduler {
    type Handle: TimerHandle;

    /// Arms `timer` to fire once after `delay`.
    fn schedule(&mut self, timer: TimerId, delay: Duration) -> Self::Handle;
}

/// Bounded, linearly growing reconnection delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }
}

type FrameHandler = Box<dyn FnMut(&FrameRecord)>;
type StatsHandler = Box<dyn FnMut(&StatsSnapshot)>;
type ErrorHandler = Box<dyn FnMut(&str)>;
type ConnectionHandler = Box<dyn FnMut(bool)>;

/// One optional slot per event kind.
#[derive(Default)]
struct Handlers {
    frame: Option<FrameHandler>,
    stats: Option<StatsHandler>,
    error: Option<ErrorHandler>,
    connection: Option<ConnectionHandler>,
}

struct PendingRetry<H> {
    timer: TimerId,
    handle: H,
}

pub struct StreamClient<T: Transport, S: Scheduler> {
    url: String,
    policy: ReconnectPolicy,
    transport: T,
    scheduler: S,
    state: ConnectionState,
    session: Option<SessionId>,
    next_session: SessionId,
    attempts: u32,
    pending_retry: Option<PendingRetry<S::Handle>>,
    next_timer: TimerId,
    handlers: Handlers,
}

impl<T: Transport, S: Scheduler> StreamClient<T, S> {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, transport: T, scheduler: S) -> Self {
        Self {
            url: url.into(),
            policy,
            transport,
            scheduler,
            state: ConnectionState::Disconnected,
            session: None,
            next_session: 1,
            attempts: 0,
            pending_retry: None,
            next_timer: 1,
            handlers: Handlers::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions. Each kind has a single slot: registering replaces the
    // previous handler.
    // ─────────────────────────────────────────────────────────────────────

    pub fn on_frame(&mut self, handler: impl FnMut(&FrameRecord) + 'static) {
        self.handlers.frame = Some(Box::new(handler));
    }

    pub fn on_stats(&mut self, handler: impl FnMut(&StatsSnapshot) + 'static) {
        self.handlers.stats = Some(Box::new(handler));
    }

    pub fn on_error(&mut self, handler: impl FnMut(&str) + 'static) {
        self.handlers.error = Some(Box::new(handler));
    }

    pub fn on_connection(&mut self, handler: impl FnMut(bool) + 'static) {
        self.handlers.connection = Some(Box::new(handler));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────

    /// Opens a new session. Ignored unless currently disconnected.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = %self.state, "connect ignored; session already active");
            return;
        }

        self.cancel_retry();

        let session = self.next_session;
        self.next_session += 1;
        self.session = Some(session);
        self.state = ConnectionState::Connecting;
        info!(url = %self.url, session, "connecting");

        if let Err(e) = self.transport.open(session, &self.url) {
            error!(url = %self.url, error = %e, "failed to create stream connection");
            self.session = None;
            self.state = ConnectionState::Disconnected;
            self.emit_error(CONNECT_FAILED_MESSAGE);
        }
    }

    /// Closes the live session and cancels any pending retry. Explicit
    /// disconnects never trigger reconnection.
    pub fn disconnect(&mut self) {
        self.cancel_retry();

        if let Some(session) = self.session.take() {
            self.transport.close(session);
        }

        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        if was_connected {
            info!(url = %self.url, "disconnected");
            self.emit_connection(false);
        }
    }

    /// Sends `payload` as JSON. Dropped with a warning unless connected.
    ///
    /// Returns whether the message was handed to the transport.
    pub fn send<P: Serialize + ?Sized>(&mut self, payload: &P) -> bool {
        let session = match (self.state, self.session) {
            (ConnectionState::Connected, Some(session)) => session,
            _ => {
                warn!(state = %self.state, "stream not connected; dropping outbound message");
                return false;
            }
        };

        let text = match protocol::encode(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                return false;
            }
        };

        match self.transport.send(session, text) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to send outbound message");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inputs from the transport and the scheduler
    // ─────────────────────────────────────────────────────────────────────

    /// Feeds one transport event. Events from any session other than the
    /// live one are dropped.
    pub fn handle(&mut self, session: SessionId, event: TransportEvent) {
        if self.session != Some(session) {
            debug!(session, ?event, "dropping event from stale session");
            return;
        }

        match event {
            TransportEvent::Opened => {
                info!(url = %self.url, session, "stream connected");
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                self.emit_connection(true);
            }
            TransportEvent::Message(text) => self.dispatch(&text),
            TransportEvent::Error(detail) => {
                warn!(session, %detail, "stream transport error");
                self.emit_error(TRANSPORT_ERROR_MESSAGE);
            }
            TransportEvent::Closed => {
                info!(url = %self.url, session, "stream disconnected");
                self.session = None;
                self.state = ConnectionState::Disconnected;
                self.emit_connection(false);
                self.schedule_retry();
            }
        }
    }

    /// Reports that `timer` fired. Only the currently armed timer reconnects.
    pub fn retry_elapsed(&mut self, timer: TimerId) {
        match self.pending_retry.take() {
            Some(pending) if pending.timer == timer => self.connect(),
            Some(pending) => {
                debug!(timer, armed = pending.timer, "ignoring superseded retry timer");
                self.pending_retry = Some(pending);
            }
            None => debug!(timer, "ignoring cancelled retry timer"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending_retry.is_some()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn dispatch(&mut self, text: &str) {
        match protocol::decode(text) {
            Ok(Envelope::Frame(frame)) => match frame.validate() {
                Ok(()) => {
                    if let Some(handler) = self.handlers.frame.as_mut() {
                        handler(&frame);
                    }
                }
                Err(e) => warn!(error = %e, "dropping invalid frame"),
            },
            Ok(Envelope::Stats(stats)) => {
                if let Some(handler) = self.handlers.stats.as_mut() {
                    handler(&stats);
                }
            }
            Ok(Envelope::Error(message)) => self.emit_error(&message),
            Err(DecodeError::UnknownType(tag)) => warn!(%tag, "unknown message type"),
            Err(e) => error!(error = %e, "failed to decode stream message"),
        }
    }

    fn schedule_retry(&mut self) {
        if self.attempts >= self.policy.max_attempts {
            error!(
                max_attempts = self.policy.max_attempts,
                "max reconnection attempts reached"
            );
            self.emit_error(RECONNECT_EXHAUSTED_MESSAGE);
            return;
        }

        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        info!(
            "attempting to reconnect ({}/{}) in {:?}",
            self.attempts, self.policy.max_attempts, delay
        );

        // A retry can only be armed from Disconnected, and firing it moves
        // straight to Connecting, so at most one is ever outstanding.
        self.cancel_retry();
        let timer = self.next_timer;
        self.next_timer += 1;
        let handle = self.scheduler.schedule(timer, delay);
        self.pending_retry = Some(PendingRetry { timer, handle });
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            debug!(timer = pending.timer, "cancelling pending retry");
            pending.handle.cancel();
        }
    }

    fn emit_error(&mut self, message: &str) {
        if let Some(handler) = self.handlers.error.as_mut() {
            handler(message);
        }
    }

    fn emit_connection(&mut self, connected: bool) {
        if let Some(handler) = self.handlers.connection.as_mut() {
            handler(connected);
        }
    }
}

impl<T: Transport, S: Scheduler> fmt::Debug for StreamClient<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("url", &self.url)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("attempts", &self.attempts)
            .field("pending_retry", &self.pending_retry.as_ref().map(|p| p.timer))
            .finish()
    }
}
