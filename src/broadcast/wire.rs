//! Wire schemas for the `frame` and `control` channels (spec.md §6).
//!
//! Frame payloads are bincode-encoded `PublishedFrame` values; control
//! messages are newline-delimited JSON objects. Both directions are
//! length-prefixed with a little-endian `u32`, the same framing idiom the
//! teacher uses for its own fixed-width capture headers.

use serde::{Deserialize, Serialize};

use crate::color_map::ColorBuffer;
use crate::error::{Error, Result};
use crate::features::FeatureSet;
use crate::pipeline::ElevationGrid;

pub const SCHEMA_VERSION: u32 = 1;

/// Sentinel elevation value denoting an invalid cell on the wire.
pub const INVALID_ELEVATION: i16 = i16::MIN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireHealth {
    pub depth_present: bool,
    pub primary_color_present: bool,
    pub aux_color_present: bool,
    pub depth_age_ms: Option<u64>,
    pub primary_color_age_ms: Option<u64>,
    pub aux_color_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireContour {
    pub points: Vec<(f32, f32, f32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFeatures {
    pub contours: Vec<WireContour>,
    pub peaks: Vec<(f32, f32, f32)>,
    pub pits: Vec<(f32, f32, f32)>,
    pub roughness: f32,
    pub histogram: Vec<u32>,
}

impl From<&FeatureSet> for WireFeatures {
    fn from(f: &FeatureSet) -> Self {
        WireFeatures {
            contours: f
                .contours
                .iter()
                .map(|polyline| WireContour {
                    points: polyline.iter().map(|p| (p.col, p.row, p.elev_mm)).collect(),
                })
                .collect(),
            peaks: f.peaks.iter().map(|p| (p.col, p.row, p.elev_mm)).collect(),
            pits: f.pits.iter().map(|p| (p.col, p.row, p.elev_mm)).collect(),
            roughness: f.roughness,
            histogram: f.histogram.clone(),
        }
    }
}

/// The wire artifact broadcast once per tick per subscriber (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedFrame {
    pub schema_version: u32,
    pub frame_id: u64,
    pub capture_ts_ns: u64,
    pub calibration_rev: u32,
    pub width: u32,
    pub height: u32,
    pub elevation: Vec<i16>,
    pub color: Option<Vec<u8>>,
    pub features: Option<WireFeatures>,
    pub health: WireHealth,
}

impl PublishedFrame {
    pub fn from_grid(
        frame_id: u64,
        capture_ts_ns: u64,
        calibration_rev: u32,
        grid: &ElevationGrid,
        color: Option<&ColorBuffer>,
        features: Option<&FeatureSet>,
        health: WireHealth,
    ) -> Self {
        let elevation = grid
            .cells
            .iter()
            .zip(grid.valid.iter())
            .map(|(v, valid)| {
                if *valid {
                    v.round().clamp(i16::MIN as f32 + 1.0, i16::MAX as f32) as i16
                } else {
                    INVALID_ELEVATION
                }
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION,
            frame_id,
            capture_ts_ns,
            calibration_rev,
            width: grid.cols,
            height: grid.rows,
            elevation,
            color: color.map(|c| c.rgb.clone()),
            features: features.map(WireFeatures::from),
            health,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::DeviceProtocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::SubscriberProtocol(e.to_string()))
    }
}

/// Client→server control messages (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    Recalibrate { target: RecalibrateTarget },
    ResetBaseline,
    SetTickPeriodMs { value: u64 },
    SetAlpha { value: f32 },
    SetContourStep { value: i32 },
    EnableFeatures { flags: FeatureFlags },
    Subscribe { options: SubscribeOptions },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalibrateTarget {
    Baseline,
    Geometry,
    Both,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub contours: bool,
    pub peaks: bool,
    pub pits: bool,
    pub roughness: bool,
    pub histogram: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub want_color: bool,
    pub want_features: bool,
}

/// An incoming control message, with the client-assigned op id echoed back
/// in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub op_id: u64,
    #[serde(flatten)]
    pub op: ControlOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub op_id: u64,
    pub status: ControlStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Ok,
    Error,
}

impl ControlResponse {
    pub fn ok(op_id: u64) -> Self {
        Self { op_id, status: ControlStatus::Ok, reason: None }
    }

    pub fn error(op_id: u64, reason: impl Into<String>) -> Self {
        Self { op_id, status: ControlStatus::Error, reason: Some(reason.into()) }
    }
}

pub fn encode_control_line(value: &impl Serialize) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value).map_err(|e| Error::SubscriberProtocol(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_control_request(line: &str) -> Result<ControlRequest> {
    serde_json::from_str(line.trim()).map_err(|e| Error::SubscriberProtocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_frame_round_trips_through_bincode() {
        let grid = ElevationGrid::new_invalid(2, 2);
        let frame = PublishedFrame::from_grid(
            1,
            0,
            1,
            &grid,
            None,
            None,
            WireHealth {
                depth_present: false,
                primary_color_present: false,
                aux_color_present: false,
                depth_age_ms: None,
                primary_color_age_ms: None,
                aux_color_age_ms: None,
            },
        );
        let encoded = frame.encode().unwrap();
        let decoded = PublishedFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_id, 1);
        assert_eq!(decoded.elevation, vec![INVALID_ELEVATION; 4]);
    }

    #[test]
    fn control_request_parses_recalibrate() {
        let line = r#"{"op_id": 7, "op": "recalibrate", "target": "both"}"#;
        let req = decode_control_request(line).unwrap();
        assert_eq!(req.op_id, 7);
        assert!(matches!(req.op, ControlOp::Recalibrate { target: RecalibrateTarget::Both }));
    }
}
