//! Intel RealSense depth source, gated behind the `realsense` feature.
//!
//! Thin generalization of the teacher's standalone RealSense wrapper into
//! the `DepthSource`/`OpenDepthSource` capability traits: open-by-serial,
//! aligned depth+color capture, and depth-scale-to-millimeter conversion
//! are kept as-is; only the color half of the captured composite is
//! dropped here since this adapter reports depth exclusively (a RealSense
//! rig's color stream is wired up separately via `color_v4l` or a second
//! `depth_realsense` instance's color half, per spec.md §4.1's "any
//! non-empty subset" requirement).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use realsense_rust::{
    config::Config,
    context::Context,
    frame::{CompositeFrame, DepthFrame as RsDepthFrame, FrameEx},
    kind::{Rs2Format, Rs2StreamKind},
    pipeline::{ActivePipeline, InactivePipeline},
};

use super::{DepthSource, OpenDepthSource};
use crate::error::{Error, Result};
use crate::frame::DepthFrame;

pub struct RealSenseDepthOpener {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub serial: Option<String>,
}

impl OpenDepthSource for RealSenseDepthOpener {
    fn open(&self) -> Result<Box<dyn DepthSource>> {
        let context = Context::new()
            .map_err(|e| Error::device_unavailable(format!("realsense context: {e}")))?;
        let pipeline = InactivePipeline::try_from(&context)
            .map_err(|e| Error::device_unavailable(format!("realsense pipeline: {e}")))?;

        let mut config = Config::new();
        if let Some(sn) = &self.serial {
            let cstr = std::ffi::CString::new(sn.as_str())
                .map_err(|e| Error::device_unavailable(e.to_string()))?;
            config
                .enable_device_from_serial(&cstr)
                .map_err(|e| Error::device_unavailable(e.to_string()))?;
        }
        config
            .enable_stream(
                Rs2StreamKind::Depth,
                None,
                self.width as usize,
                self.height as usize,
                Rs2Format::Z16,
                self.fps as usize,
            )
            .map_err(|e| Error::device_unavailable(e.to_string()))?;

        let pipeline: ActivePipeline = pipeline
            .start(Some(config))
            .map_err(|e| Error::device_unavailable(format!("realsense start: {e}")))?;

        let mut depth_scale = 0.001f32;
        for sensor in pipeline.profile().device().sensors() {
            if let Some(val) = sensor.get_option(realsense_rust::kind::Rs2Option::DepthUnits) {
                depth_scale = val;
                break;
            }
        }

        Ok(Box::new(RealSenseDepthSource {
            pipeline,
            width: self.width,
            height: self.height,
            depth_scale,
            sequence: 0,
        }))
    }

    fn name(&self) -> &str {
        "realsense-depth"
    }
}

struct RealSenseDepthSource {
    pipeline: ActivePipeline,
    width: u32,
    height: u32,
    depth_scale: f32,
    sequence: u64,
}

impl DepthSource for RealSenseDepthSource {
    fn next_frame(&mut self, deadline: Duration) -> Result<DepthFrame> {
        let composite: CompositeFrame = self
            .pipeline
            .wait(Some(deadline))
            .map_err(|_| Error::DeviceTimeout(deadline.as_millis() as u64))?;

        let depth_frames: Vec<RsDepthFrame> = composite.frames_of_type();
        let depth_frame = depth_frames
            .first()
            .ok_or_else(|| Error::device_protocol("no depth frame in composite"))?;

        let data_size = depth_frame.get_data_size();
        let scale_to_mm = self.depth_scale * 1000.0;
        let samples: Vec<u16> = unsafe {
            let ptr = depth_frame.get_data() as *const std::ffi::c_void as *const u16;
            let count = data_size / 2;
            std::slice::from_raw_parts(ptr, count)
                .iter()
                .map(|&v| (v as f32 * scale_to_mm) as u16)
                .collect()
        };

        let timestamp_ns = (depth_frame.timestamp() * 1_000_000.0) as u64;
        let wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let ts = if timestamp_ns > 0 { timestamp_ns } else { wall_ns };

        self.sequence += 1;
        Ok(DepthFrame::new(
            self.width,
            self.height,
            samples,
            ts,
            "realsense-depth-0",
            self.sequence,
        ))
    }
}
