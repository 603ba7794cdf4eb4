//! Thin CLI entry point: wires Device Adapters, the Calibration Store, the
//! Session Coordinator, and the Broadcast Server together (spec.md §6).
//!
//! This binary is deliberately thin — argument parsing and process
//! wiring only — matching xoq's own split between library logic and
//! small `src/bin/*.rs` entry points.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use arsandbox_core::broadcast::wire::WireHealth;
use arsandbox_core::broadcast::{self, TickSender};
use arsandbox_core::calibration::{self, CalibrationStore};
use arsandbox_core::config::{self, Config};
use arsandbox_core::device::mock::{MockColorOpener, MockDepthOpener};
#[cfg(feature = "realsense")]
use arsandbox_core::device::depth_realsense::RealSenseDepthOpener;
#[cfg(feature = "v4l")]
use arsandbox_core::device::color_v4l::V4lColorOpener;
use arsandbox_core::device::{self, AdapterStatusHandle, Mailbox};
use arsandbox_core::diagnostics::Diagnostics;
use arsandbox_core::error::{Error, Result};
use arsandbox_core::features::FeatureConfig;
use arsandbox_core::frame::{ColorFrame, DepthFrame};
use arsandbox_core::pipeline::ElevationGrid;
use arsandbox_core::session::{self, BroadcastTick, ControlEnvelope, SessionConfig, SessionCoordinator};

fn main() {
    config::init_tracing();
    let cfg = Config::parse();

    let code = match run(cfg) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("fatal: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

type DepthHandle = (Arc<Mailbox<DepthFrame>>, Arc<AdapterStatusHandle>);
type ColorHandle = (Arc<Mailbox<ColorFrame>>, Arc<AdapterStatusHandle>);

/// Device threads spawned at startup; joined cooperatively at shutdown
/// (spec.md §5: "Device Adapters stop accepting new frames and drain").
struct DeviceThreads(Vec<std::thread::JoinHandle<()>>);

impl DeviceThreads {
    fn join_all(self) {
        for handle in self.0 {
            let _ = handle.join();
        }
    }
}

fn run(cfg: Config) -> Result<()> {
    let (cols, rows) = cfg.canonical_grid_dims()?;
    let addr: SocketAddr = cfg
        .serve_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid --serve address '{}': {e}", cfg.serve_addr)))?;

    let calibration_store = Arc::new(CalibrationStore::new(
        cfg.profile.clone(),
        calibration::default_storage_dir(),
        cols,
        rows,
    ));
    let calibrated = match calibration_store.load_from_storage() {
        Ok(()) => {
            tracing::info!(profile = %cfg.profile, "loaded stored calibration");
            true
        }
        Err(Error::CalibrationMissing(_)) => {
            tracing::info!(profile = %cfg.profile, "no stored calibration, awaiting recalibrate");
            false
        }
        Err(e) => {
            tracing::warn!("stored calibration rejected: {e}");
            false
        }
    };

    let diagnostics = Arc::new(Diagnostics::new(cfg.tick_period_ms, cfg.error_ring_size));
    let shutdown_flag = session::new_shutdown_flag();
    let mut device_threads = Vec::new();

    let depth = spawn_depth_adapter(&cfg, shutdown_flag.clone(), &mut device_threads);
    let (primary_color, aux_color) = spawn_color_adapters(&cfg, shutdown_flag.clone(), &mut device_threads);
    let device_threads = DeviceThreads(device_threads);

    let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel::<ControlEnvelope>();

    let session_config = SessionConfig {
        tick_period_ms: cfg.tick_period_ms,
        sync_window_ms: cfg.sync_window_ms,
        staleness_ms: cfg.staleness_ms,
        max_depth_gap_ticks: cfg.max_depth_gap_ticks,
        init_timeout_ms: cfg.init_timeout_ms,
        error_ring_size: cfg.error_ring_size,
        want_color: !cfg.no_color,
        want_features: !cfg.no_features,
        feature_config: FeatureConfig::default(),
    };

    let mut coordinator = SessionCoordinator::new(
        session_config,
        calibration_store,
        depth,
        primary_color,
        aux_color,
        diagnostics.clone(),
        control_rx,
    );
    if calibrated {
        coordinator.mark_calibrated();
    }

    let sentinel = Arc::new(sentinel_tick(cols, rows));
    let (tick_tx, tick_rx) = broadcast::tick_channel(sentinel);

    let cancel = CancellationToken::new();
    let pipeline_shutdown = shutdown_flag.clone();
    let pipeline_cancel = cancel.clone();
    let pipeline_diagnostics = diagnostics.clone();

    let pipeline_handle = std::thread::Builder::new()
        .name("pipeline".to_string())
        .spawn(move || {
            run_pipeline_loop(coordinator, tick_tx, pipeline_shutdown, pipeline_diagnostics);
            pipeline_cancel.cancel();
        })
        .expect("failed to spawn pipeline thread");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Io(e.to_string()))?;

    let serve_cancel = cancel.clone();
    let serve_result = runtime.block_on(async move {
        tokio::select! {
            res = broadcast::serve(addr, tick_rx, control_tx, diagnostics.clone(), cfg.slow_subscriber_limit, serve_cancel.clone()) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
                serve_cancel.cancel();
                Ok(())
            }
        }
    });

    session::request_shutdown(&shutdown_flag);
    cancel.cancel();
    let _ = pipeline_handle.join();
    device_threads.join_all();

    serve_result
}

/// Runs the pipeline thread's tick loop until `shutdown` is signalled.
/// Never blocks on I/O or on subscribers (spec.md §5): each tick's
/// artifact is handed to the broadcast server via a single `send` on the
/// newest-wins tick channel, which never blocks the producer.
fn run_pipeline_loop(
    mut coordinator: SessionCoordinator,
    tick_tx: TickSender,
    shutdown: Arc<AtomicBool>,
    diagnostics: Arc<Diagnostics>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();
        match coordinator.tick() {
            Ok(tick) => {
                let _ = tick_tx.send(Arc::new(tick));
            }
            Err(e) => {
                tracing::error!("pipeline tick failed: {e}");
                diagnostics.record_error("PipelineTick", e.to_string());
            }
        }

        let budget = Duration::from_millis(diagnostics.tick_period_ms().max(1));
        if started.elapsed() > budget {
            diagnostics.record_overrun();
        }
        arsandbox_core::sync::FrameSynchronizer::sleep_until_next_tick(budget, started);
    }
}

/// The frame handed to subscribers that connect before the pipeline has
/// produced its first real tick: well-formed, all cells invalid.
fn sentinel_tick(cols: u32, rows: u32) -> BroadcastTick {
    BroadcastTick {
        frame_id: 0,
        capture_ts_ns: 0,
        calibration_rev: 0,
        grid: Arc::new(ElevationGrid::all_invalid(cols, rows)),
        color: None,
        features: None,
        health: WireHealth {
            depth_present: false,
            primary_color_present: false,
            aux_color_present: false,
            depth_age_ms: None,
            primary_color_age_ms: None,
            aux_color_age_ms: None,
        },
    }
}

/// Spawns the depth adapter named by the CLI: the mock source when
/// `--mock-devices` is given, or the `realsense` feature's hardware
/// backend when compiled in. With neither, the session runs depth-absent
/// and eventually reports `Faulted`, which is a legitimate per spec.md
/// §4.1 ("any non-empty subset") as long as some device is present; with
/// none at all it simply stays `Faulted` until an operator intervenes.
fn spawn_depth_adapter(
    cfg: &Config,
    shutdown: Arc<AtomicBool>,
    threads: &mut Vec<std::thread::JoinHandle<()>>,
) -> Option<DepthHandle> {
    if cfg.mock_devices {
        let (mailbox, status, handle) = device::spawn_depth_adapter(
            Arc::new(MockDepthOpener::default()),
            cfg.device_timeout_ms,
            shutdown,
        );
        threads.push(handle);
        return Some((mailbox, status));
    }

    #[cfg(feature = "realsense")]
    {
        let opener = RealSenseDepthOpener {
            width: cfg.canonical_grid_dims().map(|(w, _)| w).unwrap_or(200),
            height: cfg.canonical_grid_dims().map(|(_, h)| h).unwrap_or(150),
            fps: 30,
            serial: None,
        };
        let (mailbox, status, handle) = device::spawn_depth_adapter(Arc::new(opener), cfg.device_timeout_ms, shutdown);
        threads.push(handle);
        return Some((mailbox, status));
    }

    #[cfg(not(feature = "realsense"))]
    {
        tracing::warn!("no depth backend compiled in and --mock-devices not set; session will fault until a depth device is available");
        None
    }
}

/// Spawns the primary and (if configured) auxiliary color adapters.
/// Today only a single color source is wired up from the CLI surface;
/// a second physical color camera can be added by the same path once a
/// device-selection flag exists (see DESIGN.md's Open Question note).
fn spawn_color_adapters(
    cfg: &Config,
    shutdown: Arc<AtomicBool>,
    threads: &mut Vec<std::thread::JoinHandle<()>>,
) -> (Option<ColorHandle>, Option<ColorHandle>) {
    if cfg.mock_devices {
        let (mailbox, status, handle) = device::spawn_color_adapter(
            Arc::new(MockColorOpener::default()),
            cfg.device_timeout_ms,
            shutdown,
        );
        threads.push(handle);
        return (Some((mailbox, status)), None);
    }

    #[cfg(feature = "v4l")]
    {
        let (w, h) = cfg.canonical_grid_dims().unwrap_or((200, 150));
        let opener = V4lColorOpener::by_index(0, w, h);
        let (mailbox, status, handle) = device::spawn_color_adapter(Arc::new(opener), cfg.device_timeout_ms, shutdown);
        threads.push(handle);
        return (Some((mailbox, status)), None);
    }

    #[cfg(not(feature = "v4l"))]
    {
        (None, None)
    }
}
