use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::monitor::MonitorState;

/// Per-monitor counters, written by the monitor thread and read by anyone.
#[derive(Debug, Default)]
pub struct MonitorStats {
    frames_ok: AtomicU64,
    crc_errors: AtomicU64,
    decode_errors: AtomicU64,
    sync_drops: AtomicU64,
    overflows: AtomicU64,
    recoveries: AtomicU64,
    bytes: AtomicU64,
    state: AtomicU8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_ok: u64,
    pub crc_errors: u64,
    pub decode_errors: u64,
    pub sync_drops: u64,
    pub overflows: u64,
    pub recoveries: u64,
    pub bytes: u64,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ok(&self) {
        self.frames_ok.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_crc_error(&self) {
        self.crc_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_sync_drops(&self, n: u64) {
        self.sync_drops.fetch_add(n, Ordering::Relaxed);
    }
    pub fn inc_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_ok: self.frames_ok.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            sync_drops: self.sync_drops.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ok={} crc={} decode={} sync_drops={} overflows={} recoveries={} bytes={}",
            self.frames_ok,
            self.crc_errors,
            self.decode_errors,
            self.sync_drops,
            self.overflows,
            self.recoveries,
            self.bytes
        )
    }
}

/// Rate-limits periodic statistics output and computes throughput between reports.
#[derive(Debug)]
pub struct StatsReporter {
    interval: Duration,
    last: Instant,
    last_bytes: u64,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Returns the snapshot and byte rate once per interval, `None` otherwise.
    pub fn maybe_report(&mut self, stats: &MonitorStats) -> Option<(StatsSnapshot, f64)> {
        let dur = self.last.elapsed();
        if dur < self.interval {
            return None;
        }
        let snap = stats.snapshot();
        let rate = (snap.bytes - self.last_bytes) as f64 / dur.as_secs_f64().max(1e-3);
        self.last = Instant::now();
        self.last_bytes = snap.bytes;
        Some((snap, rate))
    }
}
