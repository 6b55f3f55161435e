//! framescope - terminal viewer for a frame telemetry stream
//!
//! Connects to a `framescoped` relay (or any producer speaking the same
//! envelope), keeps the connection alive across drops, and logs every frame,
//! stats update and error together with locally computed rolling statistics.
//!
//! Commands on stdin:
//!   refresh   drop the connection and reconnect after a short pause
//!   clear     forget the local frame history
//!   stats     print the local rolling statistics
//!   quit      exit

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;

use clap::Parser;
use framescope::client::ws::{StreamDriver, WsStreamClient};
use framescope::config::{ViewerConfig, DEFAULT_HOST};
use framescope::protocol::StatsSnapshot;
use framescope::stats::{PerformanceLevel, StatsAggregator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal viewer for a frame telemetry stream")]
struct Args {
    /// JSON config file (defaults to <config dir>/framescope/config.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream host; "localhost" or unset means this machine
    #[arg(long = "ws-host")]
    ws_host: Option<String>,

    #[arg(long = "ws-port")]
    ws_port: Option<u16>,

    /// Full stream URL, bypassing host/port resolution
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    #[arg(long)]
    reconnect_base_delay_ms: Option<u64>,

    /// Number of frames kept for rolling statistics
    #[arg(long)]
    history: Option<usize>,
}

impl Args {
    fn apply(&self, cfg: &mut ViewerConfig) {
        if let Some(host) = &self.ws_host {
            cfg.ws_host = Some(host.clone());
        }
        if let Some(port) = self.ws_port {
            cfg.ws_port = port;
        }
        if let Some(n) = self.max_reconnect_attempts {
            cfg.max_reconnect_attempts = n;
        }
        if let Some(ms) = self.reconnect_base_delay_ms {
            cfg.reconnect_base_delay_ms = ms;
        }
        if let Some(n) = self.history {
            cfg.history_capacity = n;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Refresh,
    Clear,
    Stats,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "refresh" => Ok(Command::Refresh),
            "c" | "clear" => Ok(Command::Clear),
            "s" | "stats" => Ok(Command::Stats),
            "q" | "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!(
                "unknown command {other:?} (expected refresh|clear|stats|quit)"
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Presentation
// ═══════════════════════════════════════════════════════════════════════════

fn fmt_min_fps(stats: &StatsSnapshot) -> String {
    match stats.min_fps() {
        Some(v) => format!("{v:.1}"),
        None => "-".to_string(),
    }
}

fn summary_line(stats: &StatsSnapshot) -> String {
    format!(
        "avg {:.1} FPS (min {}, max {:.1}), avg processing {:.2} ms, {} frames over {:.1}s",
        stats.average_fps,
        fmt_min_fps(stats),
        stats.max_fps,
        stats.average_processing_time,
        stats.total_frames,
        stats.uptime / 1000.0,
    )
}

fn trend_line(aggregator: &StatsAggregator, points: usize) -> Option<String> {
    let recent = aggregator.recent(points);
    if recent.len() < 2 {
        return None;
    }
    let lo = recent.iter().map(|f| f.fps).fold(f64::INFINITY, f64::min);
    let hi = recent.iter().map(|f| f.fps).fold(f64::NEG_INFINITY, f64::max);
    let first = recent[0].fps;
    let last = recent[recent.len() - 1].fps;
    Some(format!(
        "last {} frames: fps {:.1}..{:.1}, {:+.1} since first",
        recent.len(),
        lo,
        hi,
        last - first
    ))
}

fn wire_handlers(client: &mut WsStreamClient, aggregator: Rc<RefCell<StatsAggregator>>) {
    client.on_frame(move |frame| {
        let snapshot = aggregator.borrow_mut().record(*frame);
        info!(
            mode = frame.processing_mode.name(),
            processing_ms = frame.processing_time,
            level = PerformanceLevel::classify(frame.fps).label(),
            avg_fps = snapshot.average_fps,
            frames = snapshot.total_frames,
            "Frame received: {}x{} @ {:.1} FPS",
            frame.width,
            frame.height,
            frame.fps
        );
    });

    client.on_stats(|stats| {
        info!(
            "Stats: Avg FPS: {:.1}, Total Frames: {}",
            stats.average_fps, stats.total_frames
        );
    });

    client.on_error(|message| {
        error!("Error: {}", message);
    });

    client.on_connection(|connected| {
        if connected {
            info!("Connected");
        } else {
            warn!("Disconnected");
        }
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut cfg = ViewerConfig::load_or_default(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let url = args
        .url
        .clone()
        .unwrap_or_else(|| cfg.endpoint(DEFAULT_HOST).url());

    let aggregator = Rc::new(RefCell::new(StatsAggregator::new(cfg.history_capacity)));
    let mut driver = StreamDriver::new(url.clone(), cfg.reconnect_policy());
    wire_handlers(driver.client_mut(), Rc::clone(&aggregator));

    info!(%url, history = cfg.history_capacity, "Initializing...");
    driver.client_mut().connect();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut refresh_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = driver.recv() => driver.dispatch(event),
            _ = time::sleep_until(refresh_at.unwrap_or_else(Instant::now)), if refresh_at.is_some() => {
                refresh_at = None;
                driver.client_mut().connect();
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(Command::Refresh) => {
                        info!("Refreshing connection");
                        driver.client_mut().disconnect();
                        refresh_at = Some(Instant::now() + cfg.refresh_delay());
                    }
                    Ok(Command::Clear) => {
                        aggregator.borrow_mut().clear();
                        info!("Data cleared");
                    }
                    Ok(Command::Stats) => {
                        let agg = aggregator.borrow();
                        println!("{} [{}]", summary_line(&agg.snapshot()), driver.client().state());
                        if let Some(trend) = trend_line(&agg, cfg.chart_points) {
                            println!("{trend}");
                        }
                    }
                    Ok(Command::Quit) => break,
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    driver.client_mut().disconnect();
    info!("Viewer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use framescope::protocol::{FrameRecord, ProcessingMode};

    #[test]
    fn commands_parse_with_short_forms() {
        assert_eq!("refresh".parse::<Command>(), Ok(Command::Refresh));
        assert_eq!(" C ".parse::<Command>(), Ok(Command::Clear));
        assert_eq!("s".parse::<Command>(), Ok(Command::Stats));
        assert_eq!("exit".parse::<Command>(), Ok(Command::Quit));
        assert!("dance".parse::<Command>().is_err());
    }

    #[test]
    fn empty_window_prints_placeholder_min() {
        let line = summary_line(&StatsSnapshot::empty());
        assert!(line.contains("min -"));
        assert!(line.contains("0 frames"));
    }

    #[test]
    fn trend_needs_two_frames() {
        let mut agg = StatsAggregator::new(10);
        let frame = FrameRecord {
            timestamp: 0.0,
            width: 4,
            height: 4,
            fps: 12.0,
            processing_mode: ProcessingMode::Blur,
            processing_time: 1.0,
        };
        agg.record_at(frame, 0.0);
        assert!(trend_line(&agg, 50).is_none());

        agg.record_at(FrameRecord { fps: 18.0, ..frame }, 0.0);
        let trend = trend_line(&agg, 50).unwrap();
        assert!(trend.contains("fps 12.0..18.0"));
        assert!(trend.contains("+6.0"));
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from(["framescope", "--ws-host", "cam.lan", "--history", "7"]);
        let mut cfg = ViewerConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.ws_host.as_deref(), Some("cam.lan"));
        assert_eq!(cfg.history_capacity, 7);
        assert_eq!(cfg.endpoint(DEFAULT_HOST).url(), "ws://cam.lan:8080/ws");
    }
}
