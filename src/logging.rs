//! Tracing setup for odmigrate.
//!
//! Console output is for the operator watching the migration. A run can also
//! be mirrored into a plain-text file (`--log-file`) so the whole session can
//! be attached to a support ticket afterwards.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Default)]
pub struct LogConfig {
    /// JSON lines on stdout instead of the console format
    pub json: bool,
    /// Debug level for this crate unless `RUST_LOG` says otherwise
    pub verbose: bool,
    /// Append a plain-text copy of the session here
    pub file: Option<PathBuf>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. `RUST_LOG` overrides the level.
pub fn init(config: LogConfig) -> Result<()> {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("odmigrate={level}")));

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    layers.push(if config.json {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    });

    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();
    Ok(())
}

/// Lets a repeating log line through at most once per interval.
///
/// Keeps long copies and the exporter's wait loop from flooding the console.
pub struct LogThrottle {
    every: Duration,
    origin: Instant,
    /// Milliseconds since `origin` of the last emitted line, plus one; zero
    /// until the first line goes out.
    last: AtomicU64,
}

impl LogThrottle {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last.load(Ordering::Relaxed);
        if last != 0 && now - last < self.every.as_millis() as u64 {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
