//! Control & Diagnostics Surface: read-only health/telemetry and the
//! mutation points §4.7's control inputs land on (spec.md §4.9).
//!
//! All fields here are written by the pipeline thread and read from async
//! broadcast/control tasks (or vice versa for subscriber_count), so every
//! field is atomic or mutex-guarded; nothing here ever blocks the pipeline
//! thread on a reader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::session::SessionState;

/// One entry in the last-N-errors ring (spec.md §4.9, default capacity 64).
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub at_unix_ms: u64,
    pub kind: String,
    pub message: String,
}

/// One entry in the optional debugging frame ring (spec.md §1 Non-goals:
/// "no persistence of historical frames beyond an optional ring buffer for
/// debugging"). Deliberately lightweight — metadata only, not the grid
/// itself — so enabling it costs no meaningful memory or CPU on the hot
/// path.
#[derive(Debug, Clone, Copy)]
pub struct FrameDebugRecord {
    pub frame_id: u64,
    pub capture_ts_ns: u64,
    pub calibration_rev: u32,
}

/// Snapshot of one device's health, suitable for the wire `health` block
/// and the diagnostics status endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceHealth {
    pub present: bool,
    pub age_ms: Option<u64>,
}

/// Point-in-time read of the whole session for Control & Diagnostics
/// (spec.md §4.9: "session state, per-device health, tick cadence, last N
/// errors, subscriber count, calibration revision, uptime").
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    pub state: SessionState,
    pub uptime_ms: u64,
    pub frame_id: u64,
    pub calibration_rev: u32,
    pub tick_period_ms: u64,
    pub tick_overrun_count: u64,
    pub subscriber_count: usize,
    pub depth: DeviceHealth,
    pub primary_color: DeviceHealth,
    pub aux_color: DeviceHealth,
    pub recent_errors: Vec<ErrorRecord>,
    pub recent_frames: Vec<FrameDebugRecord>,
}

fn encode_state(state: SessionState) -> u8 {
    match state {
        SessionState::Initializing => 0,
        SessionState::Calibrating => 1,
        SessionState::Running => 2,
        SessionState::Degraded => 3,
        SessionState::Faulted => 4,
    }
}

fn decode_state(value: u8) -> SessionState {
    match value {
        0 => SessionState::Initializing,
        1 => SessionState::Calibrating,
        2 => SessionState::Running,
        3 => SessionState::Degraded,
        _ => SessionState::Faulted,
    }
}

/// Shared, thread-safe telemetry counters and error ring. Cheap to clone
/// (it is itself held behind an `Arc` by callers).
pub struct Diagnostics {
    started_at: Instant,
    state: AtomicU32,
    frame_id: AtomicU64,
    calibration_rev: AtomicU32,
    tick_period_ms: AtomicU64,
    tick_overrun_count: AtomicU64,
    subscriber_count: AtomicUsize,
    errors: Mutex<VecDeque<ErrorRecord>>,
    error_ring_size: usize,
    frames: Mutex<VecDeque<FrameDebugRecord>>,
    frame_ring_size: usize,
}

impl Diagnostics {
    pub fn new(tick_period_ms: u64, error_ring_size: usize) -> Self {
        Self {
            started_at: Instant::now(),
            state: AtomicU32::new(encode_state(SessionState::Initializing) as u32),
            frame_id: AtomicU64::new(0),
            calibration_rev: AtomicU32::new(0),
            tick_period_ms: AtomicU64::new(tick_period_ms),
            tick_overrun_count: AtomicU64::new(0),
            subscriber_count: AtomicUsize::new(0),
            errors: Mutex::new(VecDeque::with_capacity(error_ring_size)),
            error_ring_size: error_ring_size.max(1),
            frames: Mutex::new(VecDeque::with_capacity(error_ring_size)),
            frame_ring_size: error_ring_size.max(1),
        }
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(encode_state(state) as u32, Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        decode_state(self.state.load(Ordering::Relaxed) as u8)
    }

    pub fn set_frame_id(&self, id: u64) {
        self.frame_id.store(id, Ordering::Relaxed);
    }

    pub fn set_calibration_rev(&self, rev: u32) {
        self.calibration_rev.store(rev, Ordering::Relaxed);
    }

    pub fn set_tick_period_ms(&self, ms: u64) {
        self.tick_period_ms.store(ms, Ordering::Relaxed);
    }

    pub fn tick_period_ms(&self) -> u64 {
        self.tick_period_ms.load(Ordering::Relaxed)
    }

    pub fn record_overrun(&self) {
        self.tick_overrun_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_subscribers(&self) {
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_subscribers(&self) {
        self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Appends an error to the ring, evicting the oldest entry once the
    /// configured capacity is reached.
    pub fn record_error(&self, kind: impl Into<String>, message: impl Into<String>) {
        let at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut errors = self.errors.lock().unwrap();
        if errors.len() >= self.error_ring_size {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord { at_unix_ms, kind: kind.into(), message: message.into() });
    }

    /// Appends a lightweight record of one published frame to the
    /// debugging ring, evicting the oldest entry past capacity.
    pub fn record_frame(&self, record: FrameDebugRecord) {
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= self.frame_ring_size {
            frames.pop_front();
        }
        frames.push_back(record);
    }

    pub fn snapshot(
        &self,
        depth: DeviceHealth,
        primary_color: DeviceHealth,
        aux_color: DeviceHealth,
    ) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            state: self.state(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            frame_id: self.frame_id.load(Ordering::Relaxed),
            calibration_rev: self.calibration_rev.load(Ordering::Relaxed),
            tick_period_ms: self.tick_period_ms(),
            tick_overrun_count: self.tick_overrun_count.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count(),
            depth,
            primary_color,
            aux_color,
            recent_errors: self.errors.lock().unwrap().iter().cloned().collect(),
            recent_frames: self.frames.lock().unwrap().iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_evicts_oldest_past_capacity() {
        let diag = Diagnostics::new(33, 2);
        diag.record_error("DeviceTimeout", "first");
        diag.record_error("DeviceTimeout", "second");
        diag.record_error("DeviceTimeout", "third");
        let snap = diag.snapshot(DeviceHealth::default(), DeviceHealth::default(), DeviceHealth::default());
        assert_eq!(snap.recent_errors.len(), 2);
        assert_eq!(snap.recent_errors[0].message, "second");
        assert_eq!(snap.recent_errors[1].message, "third");
    }

    #[test]
    fn state_round_trips_through_atomic_encoding() {
        let diag = Diagnostics::new(33, 4);
        for state in [
            SessionState::Initializing,
            SessionState::Calibrating,
            SessionState::Running,
            SessionState::Degraded,
            SessionState::Faulted,
        ] {
            diag.set_state(state);
            assert_eq!(diag.state(), state);
        }
    }
}
