//! Color Mapper: applies the calibration's ordered elevation-color bands to
//! each valid cell (spec.md §4.6).

use crate::calibration::{Calibration, NO_DATA_RGB};
use crate::pipeline::ElevationGrid;

/// Row-major packed RGB888 buffer, `cols * rows * 3` bytes.
#[derive(Debug, Clone)]
pub struct ColorBuffer {
    pub cols: u32,
    pub rows: u32,
    pub rgb: Vec<u8>,
}

/// Applies calibration's color bands to every cell. Bands are assumed
/// strictly increasing (enforced by `Calibration::validate`); the band
/// whose threshold is the greatest threshold <= elevation wins.
pub fn apply(grid: &ElevationGrid, calibration: &Calibration) -> ColorBuffer {
    let mut rgb = Vec::with_capacity(grid.cells.len() * 3);
    for (cell, valid) in grid.cells.iter().zip(grid.valid.iter()) {
        let color = if *valid {
            band_for(calibration, *cell as i32)
        } else {
            NO_DATA_RGB
        };
        rgb.extend_from_slice(&color);
    }
    ColorBuffer {
        cols: grid.cols,
        rows: grid.rows,
        rgb,
    }
}

fn band_for(calibration: &Calibration, elevation_mm: i32) -> [u8; 3] {
    let mut chosen = calibration
        .color_map
        .first()
        .map(|b| b.rgb)
        .unwrap_or(NO_DATA_RGB);
    for band in &calibration.color_map {
        if band.threshold_mm <= elevation_mm {
            chosen = band.rgb;
        } else {
            break;
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_idempotent() {
        let calibration = Calibration::default_for_grid(4, 4);
        let mut grid = ElevationGrid::new_invalid(4, 4);
        for (i, v) in grid.cells.iter_mut().enumerate() {
            *v = (i as f32 * 17.0) - 100.0;
        }
        for v in grid.valid.iter_mut() {
            *v = true;
        }
        let first = apply(&grid, &calibration);
        let second = apply(&grid, &calibration);
        assert_eq!(first.rgb, second.rgb);
    }

    #[test]
    fn invalid_cells_get_no_data_color() {
        let calibration = Calibration::default_for_grid(2, 2);
        let grid = ElevationGrid::new_invalid(2, 2);
        let colors = apply(&grid, &calibration);
        for chunk in colors.rgb.chunks(3) {
            assert_eq!(chunk, NO_DATA_RGB);
        }
    }

    #[test]
    fn deep_elevation_maps_to_lowest_band() {
        let calibration = Calibration::default_for_grid(1, 1);
        let mut grid = ElevationGrid::new_invalid(1, 1);
        grid.cells[0] = -500.0;
        grid.valid[0] = true;
        let colors = apply(&grid, &calibration);
        assert_eq!(&colors.rgb[0..3], &calibration.color_map[0].rgb);
    }
}
