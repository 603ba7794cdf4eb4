//! Sensor-fusion and elevation-broadcast engine for AR sandbox rigs.
//!
//! Acquires frames from heterogeneous depth/color cameras, fuses them into
//! a calibrated elevation grid with derived features, and streams them to
//! rendering clients over a push socket (see spec.md §1 for the full
//! component map).

pub mod broadcast;
pub mod calibration;
pub mod color_map;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod features;
pub mod frame;
pub mod pipeline;
pub mod session;
pub mod sync;

pub use error::{Error, Result};
