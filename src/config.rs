//! CLI and environment configuration surface.
//!
//! Mirrors every flag with an `ARSANDBOX_`-prefixed environment variable;
//! the CLI flag wins when both are present, matching clap's own precedence
//! (`env` values are only read when the flag is absent on the command line).

use clap::Parser;

use crate::error::Error;

#[derive(Debug, Clone, Parser)]
#[command(name = "arsandbox-core", about = "AR sandbox sensor-fusion and elevation-broadcast engine")]
pub struct Config {
    /// Address to bind the broadcast server to, e.g. 0.0.0.0:7890.
    #[arg(long = "serve", env = "ARSANDBOX_SERVE", default_value = "0.0.0.0:7890")]
    pub serve_addr: String,

    /// Named calibration profile to load/persist.
    #[arg(long = "profile", env = "ARSANDBOX_PROFILE", default_value = "default")]
    pub profile: String,

    /// Pipeline tick period in milliseconds.
    #[arg(long = "tick-ms", env = "ARSANDBOX_TICK_MS", default_value_t = 33)]
    pub tick_period_ms: u64,

    /// Disable color payloads in published frames.
    #[arg(long = "no-color", env = "ARSANDBOX_NO_COLOR")]
    pub no_color: bool,

    /// Disable feature payloads (contours/peaks/pits/histogram) in published frames.
    #[arg(long = "no-features", env = "ARSANDBOX_NO_FEATURES")]
    pub no_features: bool,

    /// Device read deadline in milliseconds.
    #[arg(long = "device-timeout-ms", env = "ARSANDBOX_DEVICE_TIMEOUT_MS", default_value_t = 1000)]
    pub device_timeout_ms: u64,

    /// Canonical grid dimensions, "WxH".
    #[arg(long = "canonical-grid", env = "ARSANDBOX_CANONICAL_GRID", default_value = "200x150")]
    pub canonical_grid: String,

    /// Synchronization window in milliseconds.
    #[arg(long = "sync-window-ms", env = "ARSANDBOX_SYNC_WINDOW_MS", default_value_t = 50)]
    pub sync_window_ms: u64,

    /// Reference-frame staleness threshold in milliseconds.
    #[arg(long = "staleness-ms", env = "ARSANDBOX_STALENESS_MS", default_value_t = 500)]
    pub staleness_ms: u64,

    /// Ticks without depth before the elevation grid is marked globally invalid.
    #[arg(long = "max-depth-gap-ticks", env = "ARSANDBOX_MAX_DEPTH_GAP_TICKS", default_value_t = 30)]
    pub max_depth_gap_ticks: u32,

    /// Consecutive dropped frames before a subscriber is disconnected.
    #[arg(long = "slow-subscriber-limit", env = "ARSANDBOX_SLOW_SUBSCRIBER_LIMIT", default_value_t = 300)]
    pub slow_subscriber_limit: u32,

    /// Timeout waiting for the first device to connect, in milliseconds.
    #[arg(long = "init-timeout-ms", env = "ARSANDBOX_INIT_TIMEOUT_MS", default_value_t = 10_000)]
    pub init_timeout_ms: u64,

    /// Number of recent errors retained for diagnostics.
    #[arg(long = "error-ring-size", env = "ARSANDBOX_ERROR_RING_SIZE", default_value_t = 64)]
    pub error_ring_size: usize,

    /// Use the built-in synthetic device sources instead of hardware.
    #[arg(long = "mock-devices", env = "ARSANDBOX_MOCK_DEVICES")]
    pub mock_devices: bool,
}

impl Config {
    /// Parses `WxH` into (width, height), validating against the calibration
    /// grid bounds named in the component design ([32x24, 1024x768]).
    pub fn canonical_grid_dims(&self) -> crate::error::Result<(u32, u32)> {
        parse_grid_dims(&self.canonical_grid)
    }
}

pub fn parse_grid_dims(s: &str) -> crate::error::Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| Error::Configuration(format!("invalid canonical grid '{s}', expected WxH")))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid canonical grid width in '{s}'")))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid canonical grid height in '{s}'")))?;
    if !(32..=1024).contains(&width) || !(24..=768).contains(&height) {
        return Err(Error::Configuration(format!(
            "canonical grid {width}x{height} outside allowed range [32x24, 1024x768]"
        )));
    }
    Ok((width, height))
}

/// Installs the `tracing` subscriber used by every binary entry point,
/// honoring `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
