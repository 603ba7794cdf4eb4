//! Linux V4L2 color source, gated behind the `v4l` feature.
//!
//! Generalizes the teacher's `Camera` (format negotiation between
//! YUYV/MJPEG/Grey, manual YUYV→RGB BT.601 conversion) into the
//! `ColorSource`/`OpenColorSource` capability traits.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use v4l::buffer::Type;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{ColorSource, OpenColorSource};
use crate::error::{Error, Result};
use crate::frame::ColorFrame;

#[derive(Debug, Clone, Copy, PartialEq)]
enum CaptureFormat {
    Mjpeg,
    Yuyv,
    Grey,
}

pub struct V4lColorOpener {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub source_id: String,
}

impl V4lColorOpener {
    pub fn by_index(index: u32, width: u32, height: u32) -> Self {
        Self {
            device_path: format!("/dev/video{index}"),
            width,
            height,
            source_id: format!("v4l-color-{index}"),
        }
    }
}

impl OpenColorSource for V4lColorOpener {
    fn open(&self) -> Result<Box<dyn ColorSource>> {
        let device = Device::with_path(&self.device_path)
            .map_err(|e| Error::device_unavailable(format!("{}: {e}", self.device_path)))?;

        let (format, capture_format) = negotiate_format(&device, self.width, self.height)
            .map_err(|e| Error::device_unavailable(e.to_string()))?;

        let device = Box::leak(Box::new(device));
        let stream = Stream::with_buffers(device, Type::VideoCapture, 4)
            .map_err(|e| Error::device_unavailable(e.to_string()))?;

        Ok(Box::new(V4lColorSource {
            stream,
            width: format.width,
            height: format.height,
            format: capture_format,
            source_id: self.source_id.clone(),
            sequence: 0,
        }))
    }

    fn name(&self) -> &str {
        &self.source_id
    }
}

fn device_supports_resolution(device: &Device, fourcc: FourCC, width: u32, height: u32) -> bool {
    let framesizes = match device.enum_framesizes(fourcc) {
        Ok(sizes) => sizes,
        Err(_) => return true,
    };
    if framesizes.is_empty() {
        return true;
    }
    for fs in framesizes {
        match fs.size {
            FrameSizeEnum::Discrete(d) => {
                if d.width == width && d.height == height {
                    return true;
                }
            }
            FrameSizeEnum::Stepwise(s) => {
                let w_ok = width >= s.min_width
                    && width <= s.max_width
                    && (s.step_width == 0 || (width - s.min_width) % s.step_width == 0);
                let h_ok = height >= s.min_height
                    && height <= s.max_height
                    && (s.step_height == 0 || (height - s.min_height) % s.step_height == 0);
                if w_ok && h_ok {
                    return true;
                }
            }
        }
    }
    false
}

fn negotiate_format(
    device: &Device,
    width: u32,
    height: u32,
) -> anyhow::Result<(v4l::Format, CaptureFormat)> {
    let mut format = device.format()?;
    format.width = width;
    format.height = height;

    let yuyv = FourCC::new(b"YUYV");
    let mjpg = FourCC::new(b"MJPG");
    let grey = FourCC::new(b"GREY");

    if device_supports_resolution(device, mjpg, width, height) {
        format.fourcc = mjpg;
        if let Ok(f) = device.set_format(&format) {
            if f.fourcc == mjpg {
                return Ok((f, CaptureFormat::Mjpeg));
            }
        }
    }

    if device_supports_resolution(device, yuyv, width, height) {
        format.fourcc = yuyv;
        if let Ok(f) = device.set_format(&format) {
            if f.fourcc == yuyv {
                return Ok((f, CaptureFormat::Yuyv));
            }
        }
    }

    let f = device.format()?;
    let capture_format = if f.fourcc == yuyv {
        CaptureFormat::Yuyv
    } else if f.fourcc == grey {
        CaptureFormat::Grey
    } else {
        CaptureFormat::Mjpeg
    };
    Ok((f, capture_format))
}

struct V4lColorSource {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    format: CaptureFormat,
    source_id: String,
    sequence: u64,
}

unsafe impl Send for V4lColorSource {}

impl ColorSource for V4lColorSource {
    fn next_frame(&mut self, _deadline: Duration) -> Result<ColorFrame> {
        let (data, _meta) = self
            .stream
            .next()
            .map_err(|e| Error::device_protocol(e.to_string()))?;

        let rgb = match self.format {
            CaptureFormat::Yuyv => yuyv_to_rgb(data, self.width, self.height),
            CaptureFormat::Grey => grey_to_rgb(data, self.width, self.height),
            CaptureFormat::Mjpeg => mjpeg_to_rgb(data)
                .map_err(|e| Error::device_protocol(e.to_string()))?,
        };

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        self.sequence += 1;

        Ok(ColorFrame::new(
            self.width,
            self.height,
            rgb,
            ts,
            self.source_id.clone(),
            self.sequence,
        ))
    }
}

fn mjpeg_to_rgb(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    use image::ImageReader;
    use std::io::Cursor;

    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()?
        .to_rgb8();
    Ok(img.into_raw())
}

fn grey_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut rgb = vec![0u8; w * h * 3];
    for i in 0..(w * h) {
        let y = data.get(i).copied().unwrap_or(0);
        rgb[i * 3] = y;
        rgb[i * 3 + 1] = y;
        rgb[i * 3 + 2] = y;
    }
    rgb
}

fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let width = width as usize;
    let height = height as usize;
    let mut rgb = vec![0u8; width * height * 3];

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let yuyv_idx = (y * width + x) * 2;
            let y0 = yuyv.get(yuyv_idx).copied().unwrap_or(0) as f32;
            let u = yuyv.get(yuyv_idx + 1).copied().unwrap_or(128) as f32;
            let y1 = yuyv.get(yuyv_idx + 2).copied().unwrap_or(0) as f32;
            let v = yuyv.get(yuyv_idx + 3).copied().unwrap_or(128) as f32;

            let c0 = y0 - 16.0;
            let c1 = y1 - 16.0;
            let d = u - 128.0;
            let e = v - 128.0;

            let r0 = (1.164 * c0 + 1.596 * e).clamp(0.0, 255.0) as u8;
            let g0 = (1.164 * c0 - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8;
            let b0 = (1.164 * c0 + 2.017 * d).clamp(0.0, 255.0) as u8;

            let r1 = (1.164 * c1 + 1.596 * e).clamp(0.0, 255.0) as u8;
            let g1 = (1.164 * c1 - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8;
            let b1 = (1.164 * c1 + 2.017 * d).clamp(0.0, 255.0) as u8;

            let rgb_idx0 = (y * width + x) * 3;
            let rgb_idx1 = (y * width + x + 1) * 3;

            if rgb_idx1 + 2 < rgb.len() {
                rgb[rgb_idx0] = r0;
                rgb[rgb_idx0 + 1] = g0;
                rgb[rgb_idx0 + 2] = b0;
                rgb[rgb_idx1] = r1;
                rgb[rgb_idx1 + 1] = g1;
                rgb[rgb_idx1 + 2] = b1;
            }
        }
    }

    rgb
}

/// Enumerate `/dev/video*` devices, mirroring the teacher's `list_cameras`.
pub fn list_cameras() -> Result<Vec<(u32, String, PathBuf)>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir("/dev").map_err(|e| Error::Io(e.to_string()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(idx_str) = name.strip_prefix("video") else {
            continue;
        };
        let Ok(index) = idx_str.parse::<u32>() else {
            continue;
        };
        if let Ok(device) = Device::with_path(&path) {
            let name = device
                .query_caps()
                .map(|c| c.card)
                .unwrap_or_else(|_| format!("video{index}"));
            out.push((index, name, path));
        }
    }
    out.sort_by_key(|(idx, _, _)| *idx);
    Ok(out)
}
