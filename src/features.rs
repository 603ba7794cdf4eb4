//! Feature Extractor: contours, gradient/slope, peaks/pits, roughness, and
//! histogram derived from an `ElevationGrid` (spec.md §4.5).

use crate::calibration::Calibration;
use crate::pipeline::ElevationGrid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub col: f32,
    pub row: f32,
    pub elev_mm: f32,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub slope: Vec<Option<f32>>,
    pub contours: Vec<Vec<GridPoint>>,
    pub peaks: Vec<GridPoint>,
    pub pits: Vec<GridPoint>,
    pub roughness: f32,
    pub histogram: Vec<u32>,
}

pub struct FeatureConfig {
    pub contour_step_mm: i32,
    pub prominence_mm: f32,
    pub histogram_bins: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            contour_step_mm: 10,
            prominence_mm: 5.0,
            histogram_bins: 32,
        }
    }
}

/// Runs every feature-extraction step. Callers that want to save bandwidth
/// skip calling this entirely per spec.md §4.5 ("all features are optional").
pub fn extract(grid: &ElevationGrid, calibration: &Calibration, config: &FeatureConfig) -> FeatureSet {
    FeatureSet {
        slope: gradient_magnitude(grid),
        contours: contours(grid, calibration, config),
        peaks: peaks(grid, config, true),
        pits: peaks(grid, config, false),
        roughness: roughness(grid),
        histogram: histogram(grid, calibration, config.histogram_bins),
    }
}

/// Central-difference gradient magnitude in millimeters per cell; border
/// cells use one-sided differences; invalid cells yield `None`.
fn gradient_magnitude(grid: &ElevationGrid) -> Vec<Option<f32>> {
    let cols = grid.cols as i64;
    let rows = grid.rows as i64;
    let mut out = vec![None; grid.cells.len()];

    for row in 0..rows {
        for col in 0..cols {
            let idx = grid.index(col as u32, row as u32);
            if !grid.valid[idx] {
                continue;
            }
            let dx = partial_diff(grid, col, row, 1, 0);
            let dy = partial_diff(grid, col, row, 0, 1);
            match (dx, dy) {
                (Some(dx), Some(dy)) => out[idx] = Some((dx * dx + dy * dy).sqrt()),
                _ => out[idx] = None,
            }
        }
    }
    out
}

fn partial_diff(grid: &ElevationGrid, col: i64, row: i64, dcol: i64, drow: i64) -> Option<f32> {
    let cols = grid.cols as i64;
    let rows = grid.rows as i64;
    let forward = (col + dcol, row + drow);
    let backward = (col - dcol, row - drow);
    let forward_in = forward.0 >= 0 && forward.0 < cols && forward.1 >= 0 && forward.1 < rows;
    let backward_in = backward.0 >= 0 && backward.0 < cols && backward.1 >= 0 && backward.1 < rows;

    match (forward_in, backward_in) {
        (true, true) => {
            let fv = grid.get(forward.0 as u32, forward.1 as u32)?;
            let bv = grid.get(backward.0 as u32, backward.1 as u32)?;
            Some((fv - bv) / 2.0)
        }
        (true, false) => {
            let fv = grid.get(forward.0 as u32, forward.1 as u32)?;
            let cv = grid.get(col as u32, row as u32)?;
            Some(fv - cv)
        }
        (false, true) => {
            let bv = grid.get(backward.0 as u32, backward.1 as u32)?;
            let cv = grid.get(col as u32, row as u32)?;
            Some(cv - bv)
        }
        (false, false) => None,
    }
}

/// A cell is a peak if it strictly exceeds all valid 8-neighbors by at
/// least `prominence_mm`; pits are symmetric (pass `want_peaks = false`).
fn peaks(grid: &ElevationGrid, config: &FeatureConfig, want_peaks: bool) -> Vec<GridPoint> {
    let cols = grid.cols as i64;
    let rows = grid.rows as i64;
    let mut out = Vec::new();

    for row in 0..rows {
        for col in 0..cols {
            let idx = grid.index(col as u32, row as u32);
            if !grid.valid[idx] {
                continue;
            }
            let center = grid.cells[idx];
            let mut is_extreme = true;
            let mut has_neighbor = false;
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
                    let Some(neighbor) = grid.get(nc as u32, nr as u32) else {
                        continue;
                    };
                    has_neighbor = true;
                    let exceeds = if want_peaks {
                        center - neighbor >= config.prominence_mm
                    } else {
                        neighbor - center >= config.prominence_mm
                    };
                    if !exceeds {
                        is_extreme = false;
                    }
                }
            }
            if has_neighbor && is_extreme {
                out.push(GridPoint { col: col as f32, row: row as f32, elev_mm: center });
            }
        }
    }
    out
}

/// Mean of `|Laplacian|` over valid cells (5-point stencil).
fn roughness(grid: &ElevationGrid) -> f32 {
    let cols = grid.cols as i64;
    let rows = grid.rows as i64;
    let mut sum = 0.0f32;
    let mut count = 0u64;

    for row in 0..rows {
        for col in 0..cols {
            let idx = grid.index(col as u32, row as u32);
            if !grid.valid[idx] {
                continue;
            }
            let center = grid.cells[idx];
            let mut lap = 0.0f32;
            let mut ok = true;
            for (dc, dr) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                let nc = col + dc;
                let nr = row + dr;
                if nc < 0 || nc >= cols || nr < 0 || nr >= rows {
                    ok = false;
                    break;
                }
                match grid.get(nc as u32, nr as u32) {
                    Some(v) => lap += v - center,
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                sum += lap.abs();
                count += 1;
            }
        }
    }

    if count > 0 {
        sum / count as f32
    } else {
        0.0
    }
}

fn histogram(grid: &ElevationGrid, calibration: &Calibration, bins: usize) -> Vec<u32> {
    let mut out = vec![0u32; bins.max(1)];
    let min = calibration.min_elev_mm as f32;
    let max = calibration.max_elev_mm as f32;
    let span = (max - min).max(1.0);

    for (cell, valid) in grid.cells.iter().zip(grid.valid.iter()) {
        if !*valid {
            continue;
        }
        let t = ((*cell - min) / span).clamp(0.0, 0.999_999);
        let bin = (t * bins as f32) as usize;
        out[bin.min(bins.saturating_sub(1))] += 1;
    }
    out
}

/// Marching-squares contour extraction at each threshold between
/// `min_elev_mm` and `max_elev_mm` stepping by `contour_step_mm`. Cells
/// with any invalid corner are skipped, matching spec.md §4.5.
fn contours(grid: &ElevationGrid, calibration: &Calibration, config: &FeatureConfig) -> Vec<Vec<GridPoint>> {
    let mut all = Vec::new();
    let step = config.contour_step_mm.max(1);
    let mut threshold = calibration.min_elev_mm;
    while threshold <= calibration.max_elev_mm {
        all.extend(contour_at_level(grid, threshold as f32));
        threshold += step;
    }
    all
}

/// Marching squares over the dual grid of unit cells; each cell is formed
/// by four adjacent corners. Emits one short segment per crossing cell,
/// then stitches same-level segments sharing an endpoint into the longer
/// polylines (and closed rings) spec.md §4.5/§8 scenario 6 expects.
fn contour_at_level(grid: &ElevationGrid, level: f32) -> Vec<Vec<GridPoint>> {
    let mut segments: Vec<[GridPoint; 2]> = Vec::new();
    if grid.cols < 2 || grid.rows < 2 {
        return Vec::new();
    }

    for row in 0..(grid.rows - 1) {
        for col in 0..(grid.cols - 1) {
            let tl = grid.get(col, row);
            let tr = grid.get(col + 1, row);
            let bl = grid.get(col, row + 1);
            let br = grid.get(col + 1, row + 1);
            let (Some(tl), Some(tr), Some(bl), Some(br)) = (tl, tr, bl, br) else {
                continue;
            };

            let corners = [tl, tr, br, bl];
            let case = corners
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &v)| if v > level { acc | (1 << i) } else { acc });
            if case == 0 || case == 0b1111 {
                continue;
            }

            let top = interp(col as f32, row as f32, col as f32 + 1.0, row as f32, tl, tr, level);
            let right = interp(col as f32 + 1.0, row as f32, col as f32 + 1.0, row as f32 + 1.0, tr, br, level);
            let bottom = interp(col as f32, row as f32 + 1.0, col as f32 + 1.0, row as f32 + 1.0, bl, br, level);
            let left = interp(col as f32, row as f32, col as f32, row as f32 + 1.0, tl, bl, level);

            let edges: Vec<(f32, f32)> = match case {
                0b0001 | 0b1110 => vec![left, top],
                0b0010 => vec![top, right],
                0b1101 => vec![top, right],
                0b0011 | 0b1100 => vec![left, right],
                0b0100 | 0b1011 => vec![right, bottom],
                0b0111 | 0b1000 => vec![left, bottom],
                0b0101 => vec![left, top, right, bottom],
                0b1010 => vec![top, right, left, bottom],
                0b0110 | 0b1001 => vec![top, bottom],
                _ => Vec::new(),
            };

            if edges.len() == 2 {
                segments.push([
                    GridPoint { col: edges[0].0, row: edges[0].1, elev_mm: level },
                    GridPoint { col: edges[1].0, row: edges[1].1, elev_mm: level },
                ]);
            } else if edges.len() == 4 {
                segments.push([
                    GridPoint { col: edges[0].0, row: edges[0].1, elev_mm: level },
                    GridPoint { col: edges[1].0, row: edges[1].1, elev_mm: level },
                ]);
                segments.push([
                    GridPoint { col: edges[2].0, row: edges[2].1, elev_mm: level },
                    GridPoint { col: edges[3].0, row: edges[3].1, elev_mm: level },
                ]);
            }
        }
    }
    stitch_segments(segments)
}

/// Joins per-cell segments at the same level into longer polylines by
/// chaining shared endpoints; a chain that returns to its own start point
/// closes into a ring (`first == last`), which is what a contour around a
/// peak or basin produces. Endpoints are compared on a quantized key
/// rather than exact float equality since they come from `interp` calls
/// that can land a handful of ULPs apart even when mathematically equal.
fn stitch_segments(segments: Vec<[GridPoint; 2]>) -> Vec<Vec<GridPoint>> {
    fn key(p: &GridPoint) -> (i64, i64) {
        ((p.col * 1024.0).round() as i64, (p.row * 1024.0).round() as i64)
    }

    let mut adjacency: std::collections::HashMap<(i64, i64), Vec<usize>> = std::collections::HashMap::new();
    for (idx, seg) in segments.iter().enumerate() {
        adjacency.entry(key(&seg[0])).or_default().push(idx);
        adjacency.entry(key(&seg[1])).or_default().push(idx);
    }

    let mut used = vec![false; segments.len()];
    let mut polylines = Vec::new();

    for start in 0..segments.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let mut chain: Vec<GridPoint> = vec![segments[start][0], segments[start][1]];

        loop {
            let last_key = key(chain.last().unwrap());
            let Some(&next) = adjacency.get(&last_key).and_then(|ids| ids.iter().find(|&&id| !used[id])) else {
                break;
            };
            used[next] = true;
            let seg = &segments[next];
            let appended = if key(&seg[0]) == last_key { seg[1] } else { seg[0] };
            chain.push(appended);
        }

        loop {
            let first_key = key(chain.first().unwrap());
            let Some(&next) = adjacency.get(&first_key).and_then(|ids| ids.iter().find(|&&id| !used[id])) else {
                break;
            };
            used[next] = true;
            let seg = &segments[next];
            let prepended = if key(&seg[0]) == first_key { seg[1] } else { seg[0] };
            chain.insert(0, prepended);
        }

        polylines.push(chain);
    }
    polylines
}

#[allow(clippy::too_many_arguments)]
fn interp(x0: f32, y0: f32, x1: f32, y1: f32, v0: f32, v1: f32, level: f32) -> (f32, f32) {
    if (v1 - v0).abs() < f32::EPSILON {
        return (x0, y0);
    }
    let t = (level - v0) / (v1 - v0);
    (x0 + t * (x1 - x0), y0 + t * (y1 - y0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;

    /// Builds a radial cone from 0mm at the rim to 200mm at the center,
    /// the fixture spec.md §8 scenario 6 specifies for contour determinism.
    fn radial_cone(size: u32) -> ElevationGrid {
        let mut grid = ElevationGrid::new_invalid(size, size);
        let cx = size as f32 / 2.0;
        let cy = size as f32 / 2.0;
        let max_r = cx.min(cy);
        for row in 0..size {
            for col in 0..size {
                let dx = col as f32 - cx;
                let dy = row as f32 - cy;
                let r = (dx * dx + dy * dy).sqrt();
                let t = (1.0 - (r / max_r)).clamp(0.0, 1.0);
                let idx = grid.index(col, row);
                grid.cells[idx] = t * 200.0;
                grid.valid[idx] = true;
            }
        }
        grid
    }

    #[test]
    fn radial_cone_has_single_peak_and_no_pits() {
        let grid = radial_cone(41);
        let config = FeatureConfig { contour_step_mm: 10, prominence_mm: 5.0, histogram_bins: 32 };
        let peak_cells = peaks(&grid, &config, true);
        let pit_cells = peaks(&grid, &config, false);
        assert_eq!(peak_cells.len(), 1);
        assert!(pit_cells.is_empty());
    }

    #[test]
    fn roughness_is_zero_on_a_perfectly_flat_grid() {
        let mut grid = ElevationGrid::new_invalid(5, 5);
        for v in grid.cells.iter_mut() {
            *v = 50.0;
        }
        for v in grid.valid.iter_mut() {
            *v = true;
        }
        assert_eq!(roughness(&grid), 0.0);
    }

    #[test]
    fn histogram_has_nonzero_total_count_on_valid_grid() {
        let calibration = Calibration::default_for_grid(10, 10);
        let grid = radial_cone(10);
        let total: u32 = histogram(&grid, &calibration, 32).iter().sum();
        assert!(total > 0);
    }

    #[test]
    fn contours_are_skipped_across_invalid_corners() {
        // Left half at 0mm, right half at 100mm: a vertical step the
        // 50mm contour should cross in every cell straddling it, except
        // the cells touching the one corner marked invalid. Count total
        // points across all stitched polylines rather than polyline count,
        // since stitching can join what used to be several short segments
        // into one polyline on both sides of this comparison.
        let mut grid = ElevationGrid::new_invalid(4, 4);
        for row in 0..4u32 {
            for col in 0..4u32 {
                let idx = grid.index(col, row);
                grid.cells[idx] = if col < 2 { 0.0 } else { 100.0 };
                grid.valid[idx] = true;
            }
        }
        let point_count = |polylines: &[Vec<GridPoint>]| polylines.iter().map(|p| p.len()).sum::<usize>();

        let with_all_valid = contour_at_level(&grid, 50.0);
        assert!(point_count(&with_all_valid) > 0);

        grid.valid[grid.index(2, 1)] = false;
        let with_one_invalid = contour_at_level(&grid, 50.0);
        assert!(point_count(&with_one_invalid) < point_count(&with_all_valid));
    }

    #[test]
    fn radial_cone_contours_form_closed_rings_with_monotonically_increasing_radius() {
        // spec.md §8 scenario 6: a radial cone from 0 to 200mm, 10mm
        // contour spacing, should produce one closed ring per level with
        // mean radius increasing as elevation (and thus level) decreases
        // toward the rim.
        let grid = radial_cone(81);
        let calibration = Calibration::default_for_grid(81, 81);
        let config = FeatureConfig { contour_step_mm: 10, prominence_mm: 5.0, histogram_bins: 32 };
        let rings = contours(&grid, &calibration, &config);

        assert!(!rings.is_empty());
        let cx = 81.0 / 2.0;
        let cy = 81.0 / 2.0;
        let mean_radius = |ring: &Vec<GridPoint>| {
            let sum: f32 = ring
                .iter()
                .map(|p| ((p.col - cx).powi(2) + (p.row - cy).powi(2)).sqrt())
                .sum();
            sum / ring.len() as f32
        };

        for ring in &rings {
            assert!(ring.len() >= 3, "expected a closed ring, got {} points", ring.len());
            let first = ring.first().unwrap();
            let last = ring.last().unwrap();
            let closed = (first.col - last.col).abs() < 1e-2 && (first.row - last.row).abs() < 1e-2;
            assert!(closed, "ring did not close: {first:?} .. {last:?}");
        }

        // Higher elevation levels (closer to the apex) have smaller mean
        // radius than lower elevation levels (closer to the rim), so mean
        // radius decreases as elevation increases.
        let mut by_elev: Vec<(f32, f32)> = rings.iter().map(|r| (r[0].elev_mm, mean_radius(r))).collect();
        by_elev.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        for pair in by_elev.windows(2) {
            assert!(pair[0].1 >= pair[1].1, "mean radius should shrink as elevation increases: {pair:?}");
        }
    }
}
