//! Synthetic producer used by `framescoped --simulate`.

use std::sync::Arc;
use std::time::Duration;

use framescope::protocol::{Envelope, FrameRecord, ProcessingMode, StatsSnapshot};
use framescope::stats::now_ms;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::prng::Prng;
use crate::relay::{Relay, MOCK_CLIENT};

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

#[derive(Debug, Clone)]
pub struct MockSource {
    rng: Prng,
}

impl MockSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Prng::new(seed),
        }
    }

    pub fn frame(&mut self, timestamp: f64) -> FrameRecord {
        let mode = self.rng.gen_inclusive_u64(0, 3) as usize;
        FrameRecord {
            timestamp,
            width: WIDTH,
            height: HEIGHT,
            fps: self.rng.gen_range_f64(10.0, 30.0),
            processing_mode: ProcessingMode::all()[mode],
            processing_time: self.rng.gen_range_f64(5.0, 50.0),
        }
    }

    pub fn stats(&mut self) -> StatsSnapshot {
        StatsSnapshot {
            average_fps: self.rng.gen_range_f64(15.0, 25.0),
            max_fps: self.rng.gen_range_f64(25.0, 35.0),
            min_fps: self.rng.gen_range_f64(5.0, 15.0),
            average_processing_time: self.rng.gen_range_f64(10.0, 40.0),
            total_frames: self.rng.gen_inclusive_u64(100, 1000),
            uptime: self.rng.gen_inclusive_u64(10_000, 100_000) as f64,
        }
    }
}

/// Publishes a frame every `frame_interval` and stats once a second until
/// `shutdown` fires.
pub async fn run(
    relay: Arc<Relay>,
    frame_interval: Duration,
    seed: u64,
    shutdown: CancellationToken,
) {
    let mut source = MockSource::new(seed);
    let mut frames = tokio::time::interval(frame_interval.max(Duration::from_millis(1)));
    let mut stats = tokio::time::interval(Duration::from_secs(1));
    info!(seed, interval_ms = frame_interval.as_millis() as u64, "mock producer started");

    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = frames.tick() => Envelope::Frame(source.frame(now_ms().floor())),
            _ = stats.tick() => Envelope::Stats(source.stats()),
        };

        match envelope.to_json() {
            Ok(text) => {
                relay.publish(MOCK_CLIENT, envelope.kind(), text).await;
            }
            Err(e) => warn!("mock encode failed: {}", e),
        }
    }

    info!("mock producer stopped");
}
