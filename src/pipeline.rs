//! Elevation Pipeline: converts a `SyncedTuple` and the current
//! `Calibration` into one `ElevationGrid` per tick (spec.md §4.4).
//!
//! All intermediate arithmetic uses 32-bit floats; the grid is quantized to
//! signed 16-bit millimeters only at the wire boundary (see `broadcast::wire`).
//! Every step here is a pure function of its inputs so that identical
//! inputs and calibration reproduce a bit-identical grid (spec.md §8).

use crate::calibration::Calibration;
use crate::error::{Error, Result};
use crate::frame::SyncedTuple;

/// Elevation grid in millimeters, row-major, `cols * rows` cells. A cell is
/// invalid when its entry in `valid` is `false`; `cells` is otherwise
/// undefined for that index (callers must consult `valid`).
#[derive(Debug, Clone)]
pub struct ElevationGrid {
    pub cols: u32,
    pub rows: u32,
    pub cells: Vec<f32>,
    pub valid: Vec<bool>,
}

impl ElevationGrid {
    pub fn new_invalid(cols: u32, rows: u32) -> Self {
        let len = (cols as usize) * (rows as usize);
        Self {
            cols,
            rows,
            cells: vec![0.0; len],
            valid: vec![false; len],
        }
    }

    #[inline]
    pub fn index(&self, col: u32, row: u32) -> usize {
        (row as usize) * (self.cols as usize) + (col as usize)
    }

    pub fn get(&self, col: u32, row: u32) -> Option<f32> {
        let idx = self.index(col, row);
        if self.valid[idx] {
            Some(self.cells[idx])
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn all_invalid(cols: u32, rows: u32) -> Self {
        Self::new_invalid(cols, rows)
    }
}

/// Per-cell history the pipeline carries across ticks: the previous
/// temporally-smoothed grid, plus a counter of ticks since depth was last
/// present (for `max_depth_gap_ticks`).
pub struct PipelineState {
    previous: Option<ElevationGrid>,
    ticks_since_depth: u32,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            previous: None,
            ticks_since_depth: 0,
        }
    }
}

pub struct PipelineConfig {
    pub max_depth_gap_ticks: u32,
}

/// Runs one pipeline tick. Returns `NotCalibrated` only if the calibration
/// has never been proposed (callers treat a fresh `default_for_grid`
/// calibration as valid-but-unconfigured and should check a separate
/// "has been calibrated" flag upstream if that distinction matters).
pub fn run_tick(
    tuple: &SyncedTuple,
    calibration: &Calibration,
    state: &mut PipelineState,
    config: &PipelineConfig,
) -> Result<ElevationGrid> {
    calibration.validate()?;

    let cols = calibration.canonical_cols;
    let rows = calibration.canonical_rows;

    let raw = match &tuple.depth {
        Some(depth_frame) => {
            state.ticks_since_depth = 0;
            depth_to_height(depth_frame, calibration)?
        }
        None => {
            state.ticks_since_depth += 1;
            if state.ticks_since_depth > config.max_depth_gap_ticks {
                let grid = ElevationGrid::all_invalid(cols, rows);
                state.previous = Some(grid.clone());
                return Ok(grid);
            }
            match &state.previous {
                Some(prev) => prev.clone(),
                None => ElevationGrid::all_invalid(cols, rows),
            }
        }
    };

    let clipped = clip(raw, calibration.min_elev_mm as f32, calibration.max_elev_mm as f32);
    let smoothed = spatial_smooth(&clipped, calibration.spatial_radius);
    let temporal = temporal_smooth(&smoothed, state.previous.as_ref(), calibration.alpha);
    let filled = fill_small_islands(&temporal);

    state.previous = Some(filled.clone());
    Ok(filled)
}

/// Step 1: depth → height. Projects each depth sample into the canonical
/// grid via the device's calibrated transform and subtracts the per-cell
/// baseline. This implementation assumes the depth frame's own resolution
/// already matches the canonical grid (the common case for a single
/// primary-depth rig); a depth frame at a different resolution is resampled
/// by nearest-neighbor into canonical grid space.
fn depth_to_height(
    depth_frame: &crate::frame::DepthFrame,
    calibration: &Calibration,
) -> Result<ElevationGrid> {
    let cols = calibration.canonical_cols;
    let rows = calibration.canonical_rows;
    let mut grid = ElevationGrid::new_invalid(cols, rows);

    let resampled = resample_depth_to_grid(depth_frame, cols, rows);

    for (dst_idx, sample) in resampled.iter().enumerate() {
        let Some(sample) = sample else { continue };
        let baseline_idx = dst_idx.min(calibration.baseline_mm.len().saturating_sub(1));
        let baseline = calibration.baseline_mm.get(baseline_idx).copied().unwrap_or(0) as f32;
        grid.cells[dst_idx] = baseline - *sample as f32;
        grid.valid[dst_idx] = true;
    }

    Ok(grid)
}

/// Nearest-neighbor resamples a depth frame's samples into canonical grid
/// space, in row-major order. `None` marks an invalid (zero) sample.
/// Shared by depth-to-height conversion and baseline recapture (spec.md
/// §4.1 invariant "0 means invalid/no return").
pub fn resample_depth_to_grid(depth_frame: &crate::frame::DepthFrame, cols: u32, rows: u32) -> Vec<Option<u16>> {
    let src_w = depth_frame.width;
    let src_h = depth_frame.height;
    let mut out = Vec::with_capacity((cols as usize) * (rows as usize));

    for row in 0..rows {
        for col in 0..cols {
            let src_col = ((col as u64 * src_w as u64) / cols as u64).min((src_w - 1) as u64) as u32;
            let src_row = ((row as u64 * src_h as u64) / rows as u64).min((src_h - 1) as u64) as u32;
            let src_idx = (src_row as usize) * (src_w as usize) + (src_col as usize);
            let sample = depth_frame.samples_mm[src_idx];
            if crate::frame::DepthFrame::is_valid_sample(sample) {
                out.push(Some(sample));
            } else {
                out.push(None);
            }
        }
    }
    out
}

/// Step 2: clamp finite elevations into range; values outside are clamped,
/// not discarded.
fn clip(mut grid: ElevationGrid, min_mm: f32, max_mm: f32) -> ElevationGrid {
    for (cell, valid) in grid.cells.iter_mut().zip(grid.valid.iter()) {
        if *valid {
            *cell = cell.clamp(min_mm, max_mm);
        }
    }
    grid
}

/// Step 3: separable gaussian spatial smoothing over valid cells only;
/// invalid cells neither contribute to nor receive smoothed values.
fn spatial_smooth(grid: &ElevationGrid, radius: u32) -> ElevationGrid {
    if radius == 0 {
        return grid.clone();
    }
    let kernel = gaussian_kernel(radius);
    let horizontal = separable_pass(grid, &kernel, Axis::Horizontal);
    separable_pass(&horizontal, &kernel, Axis::Vertical)
}

enum Axis {
    Horizontal,
    Vertical,
}

fn gaussian_kernel(radius: u32) -> Vec<f32> {
    let sigma = (radius as f32).max(1.0) / 2.0;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    for offset in -(radius as i32)..=(radius as i32) {
        let x = offset as f32;
        kernel.push((-x * x / (2.0 * sigma * sigma)).exp());
    }
    kernel
}

fn separable_pass(grid: &ElevationGrid, kernel: &[f32], axis: Axis) -> ElevationGrid {
    let radius = (kernel.len() as u32 - 1) / 2;
    let mut out = grid.clone();
    let cols = grid.cols as i64;
    let rows = grid.rows as i64;

    for row in 0..rows {
        for col in 0..cols {
            let idx = grid.index(col as u32, row as u32);
            if !grid.valid[idx] {
                continue;
            }
            let mut weighted_sum = 0.0f32;
            let mut weight_total = 0.0f32;
            for (k_idx, &weight) in kernel.iter().enumerate() {
                let offset = k_idx as i64 - radius as i64;
                let (sample_col, sample_row) = match axis {
                    Axis::Horizontal => (col + offset, row),
                    Axis::Vertical => (col, row + offset),
                };
                if sample_col < 0 || sample_col >= cols || sample_row < 0 || sample_row >= rows {
                    continue;
                }
                let sample_idx = grid.index(sample_col as u32, sample_row as u32);
                if !grid.valid[sample_idx] {
                    continue;
                }
                weighted_sum += grid.cells[sample_idx] * weight;
                weight_total += weight;
            }
            if weight_total > 0.0 {
                out.cells[idx] = weighted_sum / weight_total;
            }
        }
    }
    out
}

/// Step 4: exponential temporal smoothing; a cell invalid in the previous
/// grid takes the raw value unchanged.
fn temporal_smooth(grid: &ElevationGrid, previous: Option<&ElevationGrid>, alpha: f32) -> ElevationGrid {
    let mut out = grid.clone();
    let Some(previous) = previous else {
        return out;
    };
    if previous.cols != grid.cols || previous.rows != grid.rows {
        return out;
    }
    for idx in 0..out.cells.len() {
        if !out.valid[idx] {
            continue;
        }
        if previous.valid[idx] {
            out.cells[idx] = alpha * grid.cells[idx] + (1.0 - alpha) * previous.cells[idx];
        }
    }
    out
}

/// Step 5: fill invalid islands of at most 4 connected cells with the mean
/// of their valid 8-neighbors.
fn fill_small_islands(grid: &ElevationGrid) -> ElevationGrid {
    const MAX_ISLAND_SIZE: usize = 4;
    let mut out = grid.clone();
    let mut visited = vec![false; grid.cells.len()];
    let cols = grid.cols as i64;
    let rows = grid.rows as i64;

    for start_idx in 0..grid.cells.len() {
        if grid.valid[start_idx] || visited[start_idx] {
            continue;
        }
        let mut island = Vec::new();
        let mut stack = vec![start_idx];
        visited[start_idx] = true;
        while let Some(idx) = stack.pop() {
            island.push(idx);
            if island.len() > MAX_ISLAND_SIZE {
                break;
            }
            let row = (idx / grid.cols as usize) as i64;
            let col = (idx % grid.cols as usize) as i64;
            for (dc, dr) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                let nc = col + dc;
                let nr = row + dr;
                if nc < 0 || nc >= cols || nr < 0 || nr >= rows {
                    continue;
                }
                let nidx = grid.index(nc as u32, nr as u32);
                if !grid.valid[nidx] && !visited[nidx] {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            }
        }

        if island.len() > MAX_ISLAND_SIZE {
            continue;
        }

        for &idx in &island {
            let row = (idx / grid.cols as usize) as i64;
            let col = (idx % grid.cols as usize) as i64;
            let mut sum = 0.0f32;
            let mut count = 0;
            for dr in -1..=1 {
                for dc in -1..=1 {
                    if dc == 0 && dr == 0 {
                        continue;
                    }
                    let nc = col + dc;
                    let nr = row + dr;
                    if nc < 0 || nc >= cols || nr < 0 || nr >= rows {
                        continue;
                    }
                    let nidx = grid.index(nc as u32, nr as u32);
                    if grid.valid[nidx] {
                        sum += grid.cells[nidx];
                        count += 1;
                    }
                }
            }
            if count > 0 {
                out.cells[idx] = sum / count as f32;
                out.valid[idx] = true;
            }
        }
    }

    out
}

/// Returns the sentinel "uncalibrated" grid used when the pipeline
/// short-circuits with `NotCalibrated`.
pub fn uncalibrated_grid(cols: u32, rows: u32) -> ElevationGrid {
    ElevationGrid::all_invalid(cols, rows)
}

pub fn not_calibrated_error() -> Error {
    Error::NotCalibrated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DepthFrame;

    fn flat_depth_frame(w: u32, h: u32, mm: u16) -> DepthFrame {
        DepthFrame::new(w, h, vec![mm; (w * h) as usize], 0, "d0", 1)
    }

    #[test]
    fn flat_scene_converges_to_baseline_zero() {
        let calibration = Calibration::default_for_grid(8, 8);
        let mut tuple = SyncedTuple::default();
        tuple.depth = Some(flat_depth_frame(8, 8, 1000));
        let mut state = PipelineState::default();
        let config = PipelineConfig { max_depth_gap_ticks: 30 };

        let grid = run_tick(&tuple, &calibration, &mut state, &config).unwrap();
        for (cell, valid) in grid.cells.iter().zip(grid.valid.iter()) {
            assert!(*valid);
            assert!(cell.abs() < 1e-3, "expected ~0 elevation, got {cell}");
        }
    }

    #[test]
    fn alpha_one_has_no_history_effect() {
        let mut calibration = Calibration::default_for_grid(4, 4);
        calibration.alpha = 1.0;
        calibration.spatial_radius = 0;
        let mut tuple = SyncedTuple::default();
        tuple.depth = Some(flat_depth_frame(4, 4, 900));
        let mut state = PipelineState::default();
        state.previous = Some(ElevationGrid {
            cols: 4,
            rows: 4,
            cells: vec![999.0; 16],
            valid: vec![true; 16],
        });
        let config = PipelineConfig { max_depth_gap_ticks: 30 };

        let grid = run_tick(&tuple, &calibration, &mut state, &config).unwrap();
        for cell in &grid.cells {
            assert!((cell - 100.0).abs() < 1e-3);
        }
    }

    #[test]
    fn clip_clamps_rather_than_discards() {
        let calibration = Calibration::default_for_grid(4, 4);
        let grid = ElevationGrid {
            cols: 4,
            rows: 4,
            cells: vec![9999.0; 16],
            valid: vec![true; 16],
        };
        let clipped = clip(grid, calibration.min_elev_mm as f32, calibration.max_elev_mm as f32);
        for cell in &clipped.cells {
            assert_eq!(*cell, calibration.max_elev_mm as f32);
        }
    }

    #[test]
    fn small_island_is_filled_from_neighbors() {
        let mut grid = ElevationGrid {
            cols: 3,
            rows: 3,
            cells: vec![10.0; 9],
            valid: vec![true; 9],
        };
        // Invalidate the single center cell (an island of size 1).
        grid.valid[4] = false;
        let filled = fill_small_islands(&grid);
        assert!(filled.valid[4]);
        assert!((filled.cells[4] - 10.0).abs() < 1e-3);
    }

    #[test]
    fn depth_absent_reuses_cached_grid_until_gap_exceeded() {
        let calibration = Calibration::default_for_grid(4, 4);
        let mut state = PipelineState::default();
        state.previous = Some(ElevationGrid {
            cols: 4,
            rows: 4,
            cells: vec![42.0; 16],
            valid: vec![true; 16],
        });
        let config = PipelineConfig { max_depth_gap_ticks: 2 };
        let empty_tuple = SyncedTuple::default();

        let g1 = run_tick(&empty_tuple, &calibration, &mut state, &config).unwrap();
        assert!(g1.valid[0]);
        let g2 = run_tick(&empty_tuple, &calibration, &mut state, &config).unwrap();
        assert!(g2.valid[0]);
        let g3 = run_tick(&empty_tuple, &calibration, &mut state, &config).unwrap();
        assert!(g3.valid.iter().all(|v| !v));
    }
}
