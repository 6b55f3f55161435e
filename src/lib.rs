//! # framescope
//!
//! Client side of a live frame-telemetry stream: an image-processing producer
//! publishes per-frame measurements and aggregate statistics as JSON over a
//! WebSocket, and this crate keeps a resilient connection to it while
//! maintaining rolling performance metrics for display.
//!
//! ## Quick Start
//!
//! ```
//! use framescope::prelude::*;
//!
//! let mut stats = StatsAggregator::new(100);
//!
//! let Ok(Envelope::Frame(frame)) = decode(
//!     r#"{"type":"frame","data":{"timestamp":0,"width":640,"height":480,
//!         "fps":24,"processingMode":1,"processingTime":8.5}}"#,
//! ) else {
//!     panic!("not a frame");
//! };
//!
//! let snapshot = stats.record_at(frame, 1_000.0);
//! assert_eq!(snapshot.total_frames, 1);
//! assert_eq!(snapshot.average_fps, 24.0);
//! ```
//!
//! ## Feature Flags
//!
//! - `runtime` (default): tokio + `tokio-tungstenite` driver in [`client::ws`]
//!
//! ## Modules
//!
//! - [`protocol`]: Wire envelope codec and message types
//! - [`stats`]: Bounded frame history and rolling statistics
//! - [`client`]: Reconnecting stream client state machine
//! - [`config`]: Endpoint resolution and viewer configuration

pub mod client;
pub mod config;
pub mod protocol;
pub mod stats;

/// Prelude module for convenient imports.
///
/// ```
/// use framescope::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::{
        ConnectionState, ReconnectPolicy, Scheduler, SessionId, StreamClient, TimerHandle,
        TimerId, Transport, TransportError, TransportEvent,
    };
    #[cfg(feature = "runtime")]
    pub use crate::client::ws::{DriverEvent, StreamDriver, WsStreamClient};
    pub use crate::config::{ConfigError, Endpoint, ViewerConfig};
    pub use crate::protocol::{
        decode, encode, DecodeError, Envelope, FrameRecord, InvalidFrame, MessageKind,
        ProcessingMode, StatsSnapshot,
    };
    pub use crate::stats::{HistoryWindow, PerformanceLevel, StatsAggregator};
}
