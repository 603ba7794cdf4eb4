//! Session Coordinator: owns the pipeline lifecycle, configuration,
//! calibration commands, and the health state machine (spec.md §4.7).
//!
//! Runs entirely on the pipeline thread (§5: "the pipeline thread never
//! blocks on I/O or on subscribers"). Control commands arrive from the
//! async Broadcast Server over an unbounded channel and are drained
//! non-blockingly at the top of every tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};

use crate::calibration::{Calibration, CalibrationStore};
use crate::color_map::{self, ColorBuffer};
use crate::device::{AdapterStatusHandle, Mailbox};
use crate::diagnostics::{DeviceHealth, Diagnostics, DiagnosticsSnapshot};
use crate::error::{Error, Result};
use crate::features::{self, FeatureConfig, FeatureSet};
use crate::frame::{ColorFrame, DepthFrame};
use crate::pipeline::{self, ElevationGrid, PipelineConfig, PipelineState};
use crate::sync::{FrameSynchronizer, SyncConfig};
use crate::broadcast::wire::{ControlOp, ControlStatus, FeatureFlags, RecalibrateTarget, WireHealth};

/// `{Initializing, Calibrating, Running, Degraded, Faulted}` (spec.md §3,
/// §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Calibrating,
    Running,
    Degraded,
    Faulted,
}

/// Everything one pipeline tick hands off to the Broadcast Server: the
/// computed grid plus whatever optional sections this tick's calibration
/// and CLI flags enabled. Subscribers each decide, from their own
/// `SubscribeOptions`, which sections to actually put on the wire.
pub struct BroadcastTick {
    pub frame_id: u64,
    pub capture_ts_ns: u64,
    pub calibration_rev: u32,
    pub grid: Arc<ElevationGrid>,
    pub color: Option<Arc<ColorBuffer>>,
    pub features: Option<Arc<FeatureSet>>,
    pub health: WireHealth,
}

/// A control command routed from a subscriber connection to the session
/// thread, with a reply channel for the ack/error the Broadcast Server
/// owes the client (spec.md §4.8 "Control messages are acknowledged").
pub struct ControlEnvelope {
    pub op: ControlOp,
    pub respond: oneshot::Sender<(ControlStatus, Option<String>)>,
}

struct BaselineCapture {
    remaining: u32,
    sum_mm: Vec<f64>,
    count: Vec<u32>,
    also_geometry: bool,
}

impl BaselineCapture {
    fn new(frames: u32, cols: u32, rows: u32, also_geometry: bool) -> Self {
        let len = (cols as usize) * (rows as usize);
        Self {
            remaining: frames.max(1),
            sum_mm: vec![0.0; len],
            count: vec![0; len],
            also_geometry,
        }
    }

    fn accumulate(&mut self, depth_frame: &DepthFrame, cols: u32, rows: u32) {
        let resampled = pipeline::resample_depth_to_grid(depth_frame, cols, rows);
        for (idx, sample) in resampled.iter().enumerate() {
            if let Some(mm) = sample {
                self.sum_mm[idx] += *mm as f64;
                self.count[idx] += 1;
            }
        }
        self.remaining = self.remaining.saturating_sub(1);
    }

    fn done(&self) -> bool {
        self.remaining == 0
    }

    fn into_baseline(self, previous: &[i32]) -> Vec<i32> {
        self.sum_mm
            .iter()
            .zip(self.count.iter())
            .enumerate()
            .map(|(idx, (sum, count))| {
                if *count > 0 {
                    (*sum / *count as f64).round() as i32
                } else {
                    previous.get(idx).copied().unwrap_or(0)
                }
            })
            .collect()
    }
}

/// Ticks without depth before a default recalibration request is issued;
/// mirrors the default baseline capture length spec.md §4.7 names.
pub const DEFAULT_BASELINE_CAPTURE_FRAMES: u32 = 30;

pub struct SessionConfig {
    pub tick_period_ms: u64,
    pub sync_window_ms: u64,
    pub staleness_ms: u64,
    pub max_depth_gap_ticks: u32,
    pub init_timeout_ms: u64,
    pub error_ring_size: usize,
    pub want_color: bool,
    pub want_features: bool,
    pub feature_config: FeatureConfig,
}

/// Owns Device Adapters (via their mailboxes/status handles), the
/// Calibration Store, the Frame Synchronizer, and the Elevation
/// Pipeline's per-tick state; runs the health state machine described in
/// spec.md §4.7.
pub struct SessionCoordinator {
    calibration: Arc<CalibrationStore>,
    calibrated: bool,
    synchronizer: FrameSynchronizer,
    depth_status: Option<Arc<AdapterStatusHandle>>,
    primary_color_status: Option<Arc<AdapterStatusHandle>>,
    aux_color_status: Option<Arc<AdapterStatusHandle>>,
    depth_present_ever: bool,
    pipeline_state: PipelineState,
    pipeline_config: PipelineConfig,
    feature_config: FeatureConfig,
    feature_flags: FeatureFlags,
    want_color: bool,
    want_features: bool,
    state: SessionState,
    started_at: Instant,
    init_timeout_ms: u64,
    frame_id: u64,
    baseline_capture: Option<BaselineCapture>,
    diagnostics: Arc<Diagnostics>,
    controls: mpsc::UnboundedReceiver<ControlEnvelope>,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        calibration: Arc<CalibrationStore>,
        depth: Option<(Arc<Mailbox<DepthFrame>>, Arc<AdapterStatusHandle>)>,
        primary_color: Option<(Arc<Mailbox<ColorFrame>>, Arc<AdapterStatusHandle>)>,
        aux_color: Option<(Arc<Mailbox<ColorFrame>>, Arc<AdapterStatusHandle>)>,
        diagnostics: Arc<Diagnostics>,
        controls: mpsc::UnboundedReceiver<ControlEnvelope>,
    ) -> Self {
        let sync_config = SyncConfig::from_millis(config.sync_window_ms, config.staleness_ms);
        let synchronizer = FrameSynchronizer::new(
            sync_config,
            depth.as_ref().map(|(mb, _)| mb.clone()),
            primary_color.as_ref().map(|(mb, _)| mb.clone()),
            aux_color.as_ref().map(|(mb, _)| mb.clone()),
        );

        Self {
            calibration,
            calibrated: false,
            synchronizer,
            depth_status: depth.map(|(_, st)| st),
            primary_color_status: primary_color.map(|(_, st)| st),
            aux_color_status: aux_color.map(|(_, st)| st),
            depth_present_ever: false,
            pipeline_state: PipelineState::default(),
            pipeline_config: PipelineConfig { max_depth_gap_ticks: config.max_depth_gap_ticks },
            feature_config: config.feature_config,
            feature_flags: FeatureFlags {
                contours: config.want_features,
                peaks: config.want_features,
                pits: config.want_features,
                roughness: config.want_features,
                histogram: config.want_features,
            },
            want_color: config.want_color,
            want_features: config.want_features,
            state: SessionState::Initializing,
            started_at: Instant::now(),
            init_timeout_ms: config.init_timeout_ms,
            frame_id: 0,
            baseline_capture: None,
            diagnostics,
            controls,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Marks calibration as having been explicitly established (either
    /// loaded from storage or completed via a baseline capture), which is
    /// distinct from the always-valid default calibration a fresh store
    /// seeds itself with (see DESIGN.md's resolution of this Open
    /// Question).
    pub fn mark_calibrated(&mut self) {
        self.calibrated = true;
    }

    fn drain_controls(&mut self) {
        while let Ok(envelope) = self.controls.try_recv() {
            let outcome = self.apply_control(envelope.op);
            let response = match outcome {
                Ok(()) => (ControlStatus::Ok, None),
                Err(e) => (ControlStatus::Error, Some(e.to_string())),
            };
            let _ = envelope.respond.send(response);
        }
    }

    fn apply_control(&mut self, op: ControlOp) -> Result<()> {
        match op {
            ControlOp::Recalibrate { target } => self.start_recalibration(target),
            ControlOp::ResetBaseline => self.start_recalibration(RecalibrateTarget::Baseline),
            ControlOp::SetTickPeriodMs { value } => {
                if value == 0 {
                    return Err(Error::calibration_invalid("tick period must be positive"));
                }
                self.diagnostics.set_tick_period_ms(value);
                Ok(())
            }
            ControlOp::SetAlpha { value } => {
                let snapshot = self.calibration.current();
                let mut next = snapshot.1.clone();
                next.alpha = value;
                self.calibration.propose(next)?;
                Ok(())
            }
            ControlOp::SetContourStep { value } => {
                if value <= 0 {
                    return Err(Error::calibration_invalid("contour step must be positive"));
                }
                self.feature_config.contour_step_mm = value;
                Ok(())
            }
            ControlOp::EnableFeatures { flags } => {
                self.apply_feature_flags(flags);
                Ok(())
            }
            ControlOp::Subscribe { .. } => {
                // Handled entirely within the owning connection task; by
                // the time a command reaches the session it is never a
                // Subscribe (see broadcast::server).
                Ok(())
            }
        }
    }

    fn apply_feature_flags(&mut self, flags: FeatureFlags) {
        self.want_features = flags.contours || flags.peaks || flags.pits || flags.roughness || flags.histogram;
        self.feature_flags = flags;
    }

    fn start_recalibration(&mut self, target: RecalibrateTarget) -> Result<()> {
        let (_, calibration) = &*self.calibration.current();
        let also_geometry = matches!(target, RecalibrateTarget::Geometry | RecalibrateTarget::Both);
        if matches!(target, RecalibrateTarget::Geometry) {
            // Geometry-only recalibration has no depth-averaging step;
            // apply it immediately rather than queuing a capture.
            let mut next = calibration.clone();
            next.depth = Some(Default::default());
            self.calibration.propose(next)?;
            self.persist_calibration();
            self.mark_calibrated();
            return Ok(());
        }
        self.baseline_capture = Some(BaselineCapture::new(
            DEFAULT_BASELINE_CAPTURE_FRAMES,
            calibration.canonical_cols,
            calibration.canonical_rows,
            also_geometry,
        ));
        Ok(())
    }

    fn finish_baseline_capture_if_due(&mut self) -> Result<()> {
        let Some(capture) = &self.baseline_capture else { return Ok(()) };
        if !capture.done() {
            return Ok(());
        }
        let capture = self.baseline_capture.take().unwrap();
        let also_geometry = capture.also_geometry;
        let (_, calibration) = &*self.calibration.current();
        let mut next = calibration.clone();
        let previous_baseline = next.baseline_mm.clone();
        next.baseline_mm = capture.into_baseline(&previous_baseline);
        if also_geometry {
            next.depth = Some(Default::default());
        }
        self.calibration.propose(next)?;
        self.persist_calibration();
        self.pipeline_state = PipelineState::default();
        self.mark_calibrated();
        Ok(())
    }

    /// Persists the now-current calibration so a completed recalibration
    /// survives a restart (spec.md §4.2 `persist()`). A failure here is
    /// logged and recorded for diagnostics but does not fail the
    /// recalibration itself: the new calibration is already live in
    /// memory and serving frames.
    fn persist_calibration(&self) {
        if let Err(e) = self.calibration.persist() {
            tracing::warn!("failed to persist calibration: {e}");
            self.diagnostics.record_error("CalibrationPersist", e.to_string());
        }
    }

    /// A device counts as present for this tick if the synchronizer
    /// included its frame in the tuple; the adapter's own `connected` flag
    /// is surfaced separately through diagnostics and does not gate this,
    /// since a device can be connected but simply stale for one tick.
    fn device_health(_status: Option<&Arc<AdapterStatusHandle>>, present: bool, age_ms: Option<u64>) -> DeviceHealth {
        DeviceHealth { present, age_ms }
    }

    /// Runs one tick of the whole pipeline: drains control commands,
    /// assembles a `SyncedTuple`, advances the health state machine, runs
    /// the elevation pipeline and (optionally) feature extraction and
    /// color mapping, and returns the artifact the Broadcast Server fans
    /// out to subscribers.
    pub fn tick(&mut self) -> Result<BroadcastTick> {
        self.drain_controls();

        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let tuple = self.synchronizer.tick(now_ns);

        if let Some(depth_frame) = &tuple.depth {
            self.depth_present_ever = true;
            if let Some(capture) = &mut self.baseline_capture {
                let (_, calibration) = &*self.calibration.current();
                capture.accumulate(depth_frame, calibration.canonical_cols, calibration.canonical_rows);
            }
        }
        self.finish_baseline_capture_if_due()?;

        let (calibration_rev, calibration) = {
            let snapshot = self.calibration.current();
            (snapshot.0, snapshot.1.clone())
        };

        let grid = if self.calibrated {
            pipeline::run_tick(&tuple, &calibration, &mut self.pipeline_state, &self.pipeline_config)?
        } else {
            pipeline::uncalibrated_grid(calibration.canonical_cols, calibration.canonical_rows)
        };

        let depth_present = tuple.depth.is_some();
        let primary_present = tuple.primary_color.is_some();
        let aux_present = tuple.aux_color.is_some();
        let depth_age = tuple.depth.as_ref().map(|f| now_ns.saturating_sub(f.capture_ts_ns) / 1_000_000);
        let primary_age = tuple.primary_color.as_ref().map(|f| now_ns.saturating_sub(f.capture_ts_ns) / 1_000_000);
        let aux_age = tuple.aux_color.as_ref().map(|f| now_ns.saturating_sub(f.capture_ts_ns) / 1_000_000);

        let depth_health = Self::device_health(self.depth_status.as_ref(), depth_present, depth_age);
        let primary_health = Self::device_health(self.primary_color_status.as_ref(), primary_present, primary_age);
        let aux_health = Self::device_health(self.aux_color_status.as_ref(), aux_present, aux_age);

        let any_present = self.depth_status.is_some() && depth_health.present
            || self.primary_color_status.is_some() && primary_health.present
            || self.aux_color_status.is_some() && aux_health.present;
        let all_configured_present = (self.depth_status.is_none() || depth_health.present)
            && (self.primary_color_status.is_none() || primary_health.present)
            && (self.aux_color_status.is_none() || aux_health.present);
        let grid_all_invalid = grid.valid.iter().all(|v| !v) && self.depth_status.is_some();
        let timed_out = self.started_at.elapsed().as_millis() as u64 > self.init_timeout_ms;

        self.state = compute_state(self.state, self.calibrated, any_present, all_configured_present, grid_all_invalid, timed_out);
        self.diagnostics.set_state(self.state);
        self.diagnostics.set_calibration_rev(calibration_rev);

        let color = if self.want_color {
            Some(Arc::new(color_map::apply(&grid, &calibration)))
        } else {
            None
        };
        let features = if self.want_features {
            Some(Arc::new(features::extract(&grid, &calibration, &self.feature_config)))
        } else {
            None
        };

        self.frame_id += 1;
        self.diagnostics.set_frame_id(self.frame_id);
        self.diagnostics.record_frame(crate::diagnostics::FrameDebugRecord {
            frame_id: self.frame_id,
            capture_ts_ns: tuple.reference_ts_ns,
            calibration_rev,
        });

        Ok(BroadcastTick {
            frame_id: self.frame_id,
            capture_ts_ns: tuple.reference_ts_ns,
            calibration_rev,
            grid: Arc::new(grid),
            color,
            features,
            health: WireHealth {
                depth_present: depth_health.present,
                primary_color_present: primary_health.present,
                aux_color_present: aux_health.present,
                depth_age_ms: depth_health.age_ms,
                primary_color_age_ms: primary_health.age_ms,
                aux_color_age_ms: aux_health.age_ms,
            },
        })
    }

    pub fn snapshot_diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot(
            DeviceHealth { present: self.depth_status.as_ref().map(|s| s.is_connected()).unwrap_or(false), age_ms: None },
            DeviceHealth { present: self.primary_color_status.as_ref().map(|s| s.is_connected()).unwrap_or(false), age_ms: None },
            DeviceHealth { present: self.aux_color_status.as_ref().map(|s| s.is_connected()).unwrap_or(false), age_ms: None },
        )
    }
}

/// Pure state-transition function, factored out of `tick` so the state
/// machine in spec.md §4.7 can be exercised without spinning up devices.
fn compute_state(
    previous: SessionState,
    calibrated: bool,
    any_present: bool,
    all_present: bool,
    grid_all_invalid: bool,
    init_timed_out: bool,
) -> SessionState {
    if previous == SessionState::Initializing {
        if any_present {
            return SessionState::Calibrating;
        }
        return if init_timed_out { SessionState::Faulted } else { SessionState::Initializing };
    }
    if !calibrated {
        return SessionState::Calibrating;
    }
    if !any_present || grid_all_invalid {
        return SessionState::Faulted;
    }
    if !all_present {
        return SessionState::Degraded;
    }
    SessionState::Running
}

/// Shared cooperative-shutdown flag: Device Adapter threads stop
/// accepting new frames and drain, the pipeline completes its current
/// tick, and the Broadcast Server flushes replies before closing
/// connections (spec.md §5).
pub fn new_shutdown_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

pub fn request_shutdown(flag: &AtomicBool) {
    flag.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializing_moves_to_calibrating_once_any_device_present() {
        let next = compute_state(SessionState::Initializing, false, true, false, false, false);
        assert_eq!(next, SessionState::Calibrating);
    }

    #[test]
    fn initializing_faults_after_timeout_with_no_devices() {
        let next = compute_state(SessionState::Initializing, false, false, false, false, true);
        assert_eq!(next, SessionState::Faulted);
    }

    #[test]
    fn calibrating_until_explicitly_calibrated() {
        let next = compute_state(SessionState::Calibrating, false, true, true, false, false);
        assert_eq!(next, SessionState::Calibrating);
    }

    #[test]
    fn running_when_calibrated_and_all_devices_present() {
        let next = compute_state(SessionState::Running, true, true, true, false, false);
        assert_eq!(next, SessionState::Running);
    }

    #[test]
    fn degraded_when_calibrated_but_a_device_missing() {
        let next = compute_state(SessionState::Running, true, true, false, false, false);
        assert_eq!(next, SessionState::Degraded);
    }

    #[test]
    fn faulted_when_no_device_present_at_all() {
        let next = compute_state(SessionState::Running, true, false, false, false, false);
        assert_eq!(next, SessionState::Faulted);
    }

    #[test]
    fn faulted_when_grid_entirely_invalid_despite_presence_flag() {
        let next = compute_state(SessionState::Degraded, true, true, true, true, false);
        assert_eq!(next, SessionState::Faulted);
    }

    #[test]
    fn baseline_capture_falls_back_to_previous_value_for_unseen_cells() {
        let mut capture = BaselineCapture::new(1, 2, 1, false);
        let frame = DepthFrame::new(2, 1, vec![1000, 0], 0, "d0", 1);
        capture.accumulate(&frame, 2, 1);
        assert!(capture.done());
        let baseline = capture.into_baseline(&[500, 500]);
        assert_eq!(baseline[0], 1000);
        assert_eq!(baseline[1], 500);
    }
}
