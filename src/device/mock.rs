//! Synthetic device sources: a hardware-free depth/color pair used by tests
//! and the `--mock-devices` CLI path. Simulates the wire-visible behavior of
//! a real sensor (timestamps, sequence numbers, occasional invalid samples)
//! without needing a physical rig.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use super::{ColorSource, DepthSource, OpenColorSource, OpenDepthSource};
use crate::error::Result;
use crate::frame::{ColorFrame, DepthFrame};

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Opens a synthetic depth source shaped like a radial bump in the middle
/// of the tray, useful both for manual runs and for deterministic tests.
pub struct MockDepthOpener {
    pub width: u32,
    pub height: u32,
    pub frame_period: Duration,
    pub noise_mm: u16,
}

impl Default for MockDepthOpener {
    fn default() -> Self {
        Self {
            width: 200,
            height: 150,
            frame_period: Duration::from_millis(33),
            noise_mm: 0,
        }
    }
}

impl OpenDepthSource for MockDepthOpener {
    fn open(&self) -> Result<Box<dyn DepthSource>> {
        Ok(Box::new(MockDepthSource {
            width: self.width,
            height: self.height,
            frame_period: self.frame_period,
            noise_mm: self.noise_mm,
            sequence: 0,
            last_emit: None,
        }))
    }

    fn name(&self) -> &str {
        "mock-depth"
    }
}

struct MockDepthSource {
    width: u32,
    height: u32,
    frame_period: Duration,
    noise_mm: u16,
    sequence: u64,
    last_emit: Option<Instant>,
}

impl DepthSource for MockDepthSource {
    fn next_frame(&mut self, deadline: Duration) -> Result<DepthFrame> {
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < self.frame_period {
                std::thread::sleep((self.frame_period - elapsed).min(deadline));
            }
        }
        self.last_emit = Some(Instant::now());
        self.sequence += 1;

        let w = self.width as i64;
        let h = self.height as i64;
        let cx = w as f64 / 2.0;
        let cy = h as f64 / 2.0;
        let max_radius = (cx.min(cy)).max(1.0);
        let mut rng = rand::rng();

        let mut samples = Vec::with_capacity((self.width * self.height) as usize);
        for row in 0..h {
            for col in 0..w {
                let dx = col as f64 - cx;
                let dy = row as f64 - cy;
                let r = (dx * dx + dy * dy).sqrt();
                let t = (r / max_radius).clamp(0.0, 1.0);
                // 1000mm baseline, rising to 800mm (200mm tall bump) at center.
                let base_mm = 1000.0 - 200.0 * (1.0 - t);
                let noise = if self.noise_mm > 0 {
                    rng.random_range(-(self.noise_mm as i32)..=(self.noise_mm as i32)) as f64
                } else {
                    0.0
                };
                samples.push((base_mm + noise).round().clamp(1.0, 65535.0) as u16);
            }
        }

        Ok(DepthFrame::new(
            self.width,
            self.height,
            samples,
            now_ns(),
            "mock-depth-0",
            self.sequence,
        ))
    }
}

/// Opens a synthetic color source: a flat mid-gray field with a soft
/// vignette, just enough texture to exercise the color payload path.
pub struct MockColorOpener {
    pub width: u32,
    pub height: u32,
    pub frame_period: Duration,
    pub source_id: String,
}

impl Default for MockColorOpener {
    fn default() -> Self {
        Self {
            width: 200,
            height: 150,
            frame_period: Duration::from_millis(33),
            source_id: "mock-color-0".to_string(),
        }
    }
}

impl OpenColorSource for MockColorOpener {
    fn open(&self) -> Result<Box<dyn ColorSource>> {
        Ok(Box::new(MockColorSource {
            width: self.width,
            height: self.height,
            frame_period: self.frame_period,
            source_id: self.source_id.clone(),
            sequence: 0,
            last_emit: None,
        }))
    }

    fn name(&self) -> &str {
        &self.source_id
    }
}

struct MockColorSource {
    width: u32,
    height: u32,
    frame_period: Duration,
    source_id: String,
    sequence: u64,
    last_emit: Option<Instant>,
}

impl ColorSource for MockColorSource {
    fn next_frame(&mut self, deadline: Duration) -> Result<ColorFrame> {
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < self.frame_period {
                std::thread::sleep((self.frame_period - elapsed).min(deadline));
            }
        }
        self.last_emit = Some(Instant::now());
        self.sequence += 1;

        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for _ in 0..(self.width * self.height) {
            rgb.extend_from_slice(&[120, 120, 120]);
        }

        Ok(ColorFrame::new(
            self.width,
            self.height,
            rgb,
            now_ns(),
            self.source_id.clone(),
            self.sequence,
        ))
    }
}
