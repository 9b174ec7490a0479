// src/progress.rs
//
// Progress channel and speed accounting.
//
// The transfer layer pushes (loaded, total) events into a ProgressFn; the
// task layer consumes aggregated per-file byte counts through a LoadedSink
// and derives a short-window transfer speed from them.

use crate::constants::SPEED_WINDOW_FLOOR_SECS;
use std::sync::Arc;
use std::time::Instant;

/// Per-transfer progress callback: (bytes_loaded, bytes_total).
/// Byte counts are monotonically increasing within one transfer.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Per-task aggregate sink: total confirmed + in-flight bytes for the file.
pub type LoadedSink = Arc<dyn Fn(u64) + Send + Sync>;

/// Windowed speed derivation: bytes since the last observation divided by
/// wall time since it, with the elapsed time floored to smooth bursty
/// callback timing.
#[derive(Debug)]
pub struct SpeedMeter {
    last_at: Instant,
    last_loaded: u64,
}

impl SpeedMeter {
    /// Start a fresh accounting window at `initial_loaded` bytes (non-zero
    /// when resuming a task that already has confirmed parts).
    pub fn new(initial_loaded: u64) -> Self {
        Self {
            last_at: Instant::now(),
            last_loaded: initial_loaded,
        }
    }

    /// Observe a new aggregate byte count and return bytes/second.
    pub fn observe(&mut self, loaded: u64) -> f64 {
        let now = Instant::now();
        let delta_bytes = loaded.saturating_sub(self.last_loaded) as f64;
        let delta_secs = (now - self.last_at)
            .as_secs_f64()
            .max(SPEED_WINDOW_FLOOR_SECS);
        self.last_at = now;
        self.last_loaded = loaded;
        let bps = delta_bytes / delta_secs;
        if bps.is_finite() { bps } else { 0.0 }
    }
}

/// Human-readable byte count, e.g. "17.25 MB".
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    // Trim trailing zeros the way a "%.2f then parseFloat" pass would.
    let s = format!("{:.2}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", s, UNITS[unit])
}

/// Human-readable transfer speed, "-" when idle or unknown.
pub fn format_speed(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return "-".to_string();
    }
    format!("{}/s", format_size(bytes_per_sec as u64))
}
