//! End-to-end coverage of the session health state machine (spec.md §4.7,
//! §8) against a `SessionCoordinator` wired directly to in-memory device
//! mailboxes, without spawning real adapter threads.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arsandbox_core::broadcast::wire::{ControlOp, RecalibrateTarget};
use arsandbox_core::calibration::CalibrationStore;
use arsandbox_core::device::{AdapterStatusHandle, Mailbox};
use arsandbox_core::diagnostics::Diagnostics;
use arsandbox_core::features::FeatureConfig;
use arsandbox_core::frame::{ColorFrame, DepthFrame};
use arsandbox_core::session::{ControlEnvelope, SessionConfig, SessionCoordinator, SessionState};

const COLS: u32 = 32;
const ROWS: u32 = 24;

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
}

fn session_config() -> SessionConfig {
    SessionConfig {
        tick_period_ms: 10,
        sync_window_ms: 50,
        staleness_ms: 5_000,
        max_depth_gap_ticks: 30,
        init_timeout_ms: 10_000,
        error_ring_size: 16,
        want_color: false,
        want_features: false,
        feature_config: FeatureConfig::default(),
    }
}

fn flat_depth_frame(mm: u16, sequence: u64) -> DepthFrame {
    DepthFrame::new(COLS, ROWS, vec![mm; (COLS * ROWS) as usize], now_ns(), "depth0", sequence)
}

fn flat_color_frame(capture_ts_ns: u64, sequence: u64) -> ColorFrame {
    ColorFrame::new(COLS, ROWS, vec![128u8; (COLS * ROWS * 3) as usize], capture_ts_ns, "color0", sequence)
}

#[test]
fn faults_immediately_with_no_devices_and_zero_init_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let calibration = Arc::new(CalibrationStore::new("t1", dir.path().to_path_buf(), COLS, ROWS));
    let diagnostics = Arc::new(Diagnostics::new(10, 16));
    let (_control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel::<ControlEnvelope>();

    let mut config = session_config();
    config.init_timeout_ms = 0;
    let mut coordinator =
        SessionCoordinator::new(config, calibration, None, None, None, diagnostics, control_rx);

    let tick = coordinator.tick().unwrap();
    assert_eq!(coordinator.state(), SessionState::Faulted);
    assert!(!tick.health.depth_present);
}

#[test]
fn moves_to_calibrating_then_running_after_baseline_capture_completes() {
    let dir = tempfile::tempdir().unwrap();
    let calibration = Arc::new(CalibrationStore::new("t2", dir.path().to_path_buf(), COLS, ROWS));
    let diagnostics = Arc::new(Diagnostics::new(10, 16));
    let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel::<ControlEnvelope>();

    let depth_mailbox = Arc::new(Mailbox::<DepthFrame>::new());
    let depth_status = Arc::new(AdapterStatusHandle::new());

    let mut coordinator = SessionCoordinator::new(
        session_config(),
        calibration,
        Some((depth_mailbox.clone(), depth_status)),
        None,
        None,
        diagnostics,
        control_rx,
    );

    depth_mailbox.publish_ordered(flat_depth_frame(2000, 1));
    coordinator.tick().unwrap();
    assert_eq!(coordinator.state(), SessionState::Calibrating);

    let (respond, response_rx) = tokio::sync::oneshot::channel();
    control_tx
        .send(ControlEnvelope { op: ControlOp::Recalibrate { target: RecalibrateTarget::Baseline }, respond })
        .unwrap();
    drop(response_rx);

    for seq in 2..=31u64 {
        depth_mailbox.publish_ordered(flat_depth_frame(2000, seq));
        coordinator.tick().unwrap();
    }

    assert_eq!(coordinator.state(), SessionState::Running);

    let snapshot = coordinator.snapshot_diagnostics();
    assert_eq!(snapshot.state, SessionState::Running);
    assert!(snapshot.calibration_rev >= 1);
}

#[test]
fn degrades_when_a_configured_color_camera_falls_out_of_the_sync_window() {
    let dir = tempfile::tempdir().unwrap();
    let calibration = Arc::new(CalibrationStore::new("t3", dir.path().to_path_buf(), COLS, ROWS));
    let diagnostics = Arc::new(Diagnostics::new(10, 16));
    let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel::<ControlEnvelope>();

    let depth_mailbox = Arc::new(Mailbox::<DepthFrame>::new());
    let depth_status = Arc::new(AdapterStatusHandle::new());
    let primary_mailbox = Arc::new(Mailbox::<ColorFrame>::new());
    let primary_status = Arc::new(AdapterStatusHandle::new());

    let mut coordinator = SessionCoordinator::new(
        session_config(),
        calibration,
        Some((depth_mailbox.clone(), depth_status)),
        Some((primary_mailbox.clone(), primary_status)),
        None,
        diagnostics,
        control_rx,
    );

    depth_mailbox.publish_ordered(flat_depth_frame(2000, 1));
    primary_mailbox.publish(flat_color_frame(now_ns(), 1));
    coordinator.tick().unwrap();

    let (respond, _response_rx) = tokio::sync::oneshot::channel();
    control_tx
        .send(ControlEnvelope { op: ControlOp::Recalibrate { target: RecalibrateTarget::Baseline }, respond })
        .unwrap();
    for seq in 2..=31u64 {
        depth_mailbox.publish_ordered(flat_depth_frame(2000, seq));
        primary_mailbox.publish(flat_color_frame(now_ns(), seq));
        coordinator.tick().unwrap();
    }
    assert_eq!(coordinator.state(), SessionState::Running);

    // The color camera's last frame is now far outside the 50ms sync
    // window relative to a fresh depth frame, so it drops out of the
    // tuple without the mailbox itself reporting disconnected.
    const TEN_SECONDS_NS: u64 = 10_000_000_000;
    primary_mailbox.publish(flat_color_frame(now_ns().saturating_sub(TEN_SECONDS_NS), 32));
    depth_mailbox.publish_ordered(flat_depth_frame(2000, 32));
    let tick = coordinator.tick().unwrap();

    assert!(!tick.health.primary_color_present);
    assert_eq!(coordinator.state(), SessionState::Degraded);
}
