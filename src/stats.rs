//! Rolling statistics over a bounded frame history.

use std::collections::vec_deque;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::protocol::{FrameRecord, StatsSnapshot};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// FIFO window of the most recent frames.
///
/// Pushing past capacity evicts the oldest frame.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    frames: VecDeque<FrameRecord>,
    capacity: usize,
}

impl HistoryWindow {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `frame`, returning the evicted frame if the window was full.
    pub fn push(&mut self, frame: FrameRecord) -> Option<FrameRecord> {
        self.frames.push_back(frame);
        if self.frames.len() > self.capacity {
            self.frames.pop_front()
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn oldest(&self) -> Option<&FrameRecord> {
        self.frames.front()
    }

    pub fn newest(&self) -> Option<&FrameRecord> {
        self.frames.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, FrameRecord> {
        self.frames.iter()
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Maintains the history window and recomputes the summary on every insert.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    window: HistoryWindow,
    snapshot: StatsSnapshot,
}

impl StatsAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: HistoryWindow::new(capacity),
            snapshot: StatsSnapshot::empty(),
        }
    }

    /// Records `frame` using the wall clock for the uptime calculation.
    pub fn record(&mut self, frame: FrameRecord) -> StatsSnapshot {
        self.record_at(frame, now_ms())
    }

    /// Records `frame` with an explicit "now" in milliseconds since the epoch.
    ///
    /// Frames failing [`FrameRecord::validate`] (NaN or negative fps, zero
    /// dimensions, ...) are skipped and the current snapshot is returned
    /// unchanged, so `min <= avg <= max` holds for any input.
    pub fn record_at(&mut self, frame: FrameRecord, now_ms: f64) -> StatsSnapshot {
        if let Err(e) = frame.validate() {
            warn!(error = %e, "skipping invalid frame");
            return self.snapshot;
        }
        self.window.push(frame);
        self.snapshot = summarize(&self.window, now_ms);
        self.snapshot
    }

    /// The summary computed by the most recent `record` (or the neutral
    /// snapshot after `clear`).
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.snapshot = StatsSnapshot::empty();
    }

    pub fn history(&self) -> vec_deque::Iter<'_, FrameRecord> {
        self.window.iter()
    }

    /// Copies the newest `n` frames, oldest first.
    pub fn recent(&self, n: usize) -> Vec<FrameRecord> {
        let skip = self.window.len().saturating_sub(n);
        self.window.iter().skip(skip).copied().collect()
    }

    pub fn latest(&self) -> Option<&FrameRecord> {
        self.window.newest()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.window.capacity()
    }
}

/// Full recomputation over the window.
fn summarize(window: &HistoryWindow, now_ms: f64) -> StatsSnapshot {
    let Some(oldest) = window.oldest() else {
        return StatsSnapshot::empty();
    };

    let n = window.len() as f64;
    let mut fps_sum = 0.0;
    let mut processing_sum = 0.0;
    let mut min_fps = f64::INFINITY;
    let mut max_fps = f64::NEG_INFINITY;

    for frame in window.iter() {
        fps_sum += frame.fps;
        processing_sum += frame.processing_time;
        min_fps = min_fps.min(frame.fps);
        max_fps = max_fps.max(frame.fps);
    }

    let mut average_fps = fps_sum / n;
    // Rounding in the sum can push the mean a ulp outside [min, max].
    if min_fps <= max_fps {
        average_fps = average_fps.clamp(min_fps, max_fps);
    }

    StatsSnapshot {
        average_fps,
        max_fps,
        min_fps,
        average_processing_time: processing_sum / n,
        total_frames: window.len() as u64,
        uptime: (now_ms - oldest.timestamp).max(0.0),
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Coarse frame-rate rating used for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerformanceLevel {
    Good,
    Fair,
    Poor,
}

impl PerformanceLevel {
    pub fn classify(fps: f64) -> Self {
        if fps >= 20.0 {
            PerformanceLevel::Good
        } else if fps >= 10.0 {
            PerformanceLevel::Fair
        } else {
            PerformanceLevel::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PerformanceLevel::Good => "good",
            PerformanceLevel::Fair => "fair",
            PerformanceLevel::Poor => "poor",
        }
    }
}
