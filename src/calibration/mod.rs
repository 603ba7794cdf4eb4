//! Calibration Store: persistent, atomically swappable record of intrinsics,
//! extrinsics, depth baseline, clip planes, color map, and per-sensor
//! transforms (spec.md §4.2).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current on-disk schema version for persisted calibration files.
pub const FORMAT_VERSION: u32 = 1;

/// Rigid transform from a sensor's own frame into the sandbox reference
/// frame: rotation as a row-major 3x3 matrix plus a translation vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Extrinsics {
    pub rotation: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl Default for Extrinsics {
    fn default() -> Self {
        Self {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0, 0.0, 0.0],
        }
    }
}

/// Pinhole-style intrinsics for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub ppx: f32,
    pub ppy: f32,
    pub distortion: Vec<f32>,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            fx: 383.0,
            fy: 383.0,
            ppx: 0.0,
            ppy: 0.0,
            distortion: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceCalibration {
    pub intrinsics: Intrinsics,
    pub extrinsics: Extrinsics,
}

/// Origin, axes, and extent of the sandbox plane, in millimeters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxPlane {
    pub origin_mm: [f32; 3],
    pub x_axis: [f32; 3],
    pub y_axis: [f32; 3],
    pub extent_mm: [f32; 2],
}

impl Default for SandboxPlane {
    fn default() -> Self {
        Self {
            origin_mm: [0.0, 0.0, 0.0],
            x_axis: [1.0, 0.0, 0.0],
            y_axis: [0.0, 1.0, 0.0],
            extent_mm: [1000.0, 750.0],
        }
    }
}

/// One (threshold, rgb) band of the elevation-color palette. Bands are
/// stored in strictly increasing threshold order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ColorBand {
    pub threshold_mm: i32,
    pub rgb: [u8; 3],
}

/// The "Magic Sand" elevation palette, deep-to-high.
pub fn default_color_map() -> Vec<ColorBand> {
    vec![
        ColorBand { threshold_mm: -200, rgb: [0, 0, 128] },    // navy
        ColorBand { threshold_mm: -120, rgb: [30, 60, 220] },  // blue
        ColorBand { threshold_mm: -40, rgb: [70, 130, 200] },  // sand-blue
        ColorBand { threshold_mm: 0, rgb: [210, 190, 140] },   // sand
        ColorBand { threshold_mm: 40, rgb: [230, 140, 40] },   // orange
        ColorBand { threshold_mm: 90, rgb: [60, 160, 60] },    // green
        ColorBand { threshold_mm: 140, rgb: [190, 50, 50] },   // red
        ColorBand { threshold_mm: 180, rgb: [230, 210, 60] },  // yellow
        ColorBand { threshold_mm: 220, rgb: [255, 255, 255] }, // snow
    ]
}

/// RGB used for cells with no data.
pub const NO_DATA_RGB: [u8; 3] = [20, 20, 20];

/// The full calibration record,§3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Calibration {
    pub format_version: u32,
    pub depth: Option<DeviceCalibration>,
    pub primary_color: Option<DeviceCalibration>,
    pub aux_color: Option<DeviceCalibration>,
    pub plane: SandboxPlane,
    pub canonical_cols: u32,
    pub canonical_rows: u32,
    /// Per-cell reference depth, row-major, length = canonical_cols * canonical_rows.
    pub baseline_mm: Vec<i32>,
    pub min_elev_mm: i32,
    pub max_elev_mm: i32,
    pub alpha: f32,
    pub spatial_radius: u32,
    pub color_map: Vec<ColorBand>,
}

impl Calibration {
    /// An uncalibrated default at the given canonical grid size: zero
    /// baseline, default palette, no device transforms.
    pub fn default_for_grid(cols: u32, rows: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            depth: None,
            primary_color: None,
            aux_color: None,
            plane: SandboxPlane::default(),
            canonical_cols: cols,
            canonical_rows: rows,
            baseline_mm: vec![0; (cols as usize) * (rows as usize)],
            min_elev_mm: -200,
            max_elev_mm: 220,
            alpha: 0.3,
            spatial_radius: 1,
            color_map: default_color_map(),
        }
    }

    /// Validates the invariants named in spec.md §4.2.
    pub fn validate(&self) -> Result<()> {
        if self.canonical_cols < 32 || self.canonical_cols > 1024 {
            return Err(Error::calibration_invalid(format!(
                "canonical_cols {} outside [32, 1024]",
                self.canonical_cols
            )));
        }
        if self.canonical_rows < 24 || self.canonical_rows > 768 {
            return Err(Error::calibration_invalid(format!(
                "canonical_rows {} outside [24, 768]",
                self.canonical_rows
            )));
        }
        let expected_len = (self.canonical_cols as usize) * (self.canonical_rows as usize);
        if self.baseline_mm.len() != expected_len {
            return Err(Error::calibration_invalid(format!(
                "baseline length {} does not match grid {}x{}",
                self.baseline_mm.len(),
                self.canonical_cols,
                self.canonical_rows
            )));
        }
        if self.min_elev_mm >= self.max_elev_mm {
            return Err(Error::calibration_invalid("inverted clip planes"));
        }
        if !(0.0..=1.0).contains(&self.alpha) || self.alpha <= 0.0 {
            return Err(Error::calibration_invalid("alpha must be in (0, 1]"));
        }
        if self.color_map.is_empty() {
            return Err(Error::calibration_invalid("color map must have at least one band"));
        }
        let mut last_threshold = i32::MIN;
        for band in &self.color_map {
            if !band.threshold_mm.is_finite_i32() {
                return Err(Error::calibration_invalid("non-finite color band threshold"));
            }
            if band.threshold_mm <= last_threshold {
                return Err(Error::calibration_invalid(
                    "color map thresholds must be strictly increasing",
                ));
            }
            last_threshold = band.threshold_mm;
        }
        for v in self.baseline_mm.iter() {
            if !v.is_finite_i32() {
                return Err(Error::calibration_invalid("non-finite baseline value"));
            }
        }
        Ok(())
    }
}

/// i32 is always finite; this trait exists only so `validate` reads the
/// same whether the underlying representation is later widened to float.
trait FiniteI32 {
    fn is_finite_i32(&self) -> bool;
}

impl FiniteI32 for i32 {
    fn is_finite_i32(&self) -> bool {
        true
    }
}

/// Holds the current calibration as an immutable, reference-counted value
/// plus a monotonically increasing revision id. Readers clone the `Arc`
/// once per tick and are unaffected by a concurrent `propose` (spec.md §3,
/// §5 ordering guarantees).
pub struct CalibrationStore {
    current: ArcSwap<(u32, Calibration)>,
    profile: String,
    storage_dir: PathBuf,
    configured_cols: u32,
    configured_rows: u32,
}

impl CalibrationStore {
    /// Creates a store seeded with an uncalibrated default; call
    /// `load_from_storage` to attempt to recover a persisted profile. `cols`
    /// and `rows` are the canonical grid this run was configured for
    /// (e.g. `--canonical-grid`); a stored profile for a different grid is
    /// rejected rather than silently adopted (spec.md §8 scenario 5).
    pub fn new(profile: impl Into<String>, storage_dir: PathBuf, cols: u32, rows: u32) -> Self {
        let initial = Calibration::default_for_grid(cols, rows);
        Self {
            current: ArcSwap::from_pointee((0, initial)),
            profile: profile.into(),
            storage_dir,
            configured_cols: cols,
            configured_rows: rows,
        }
    }

    /// Returns the current (revision, Calibration) snapshot. Cloning the
    /// `Arc` is the only thing a reader needs to be unaffected by a
    /// concurrent `propose`.
    pub fn current(&self) -> Arc<(u32, Calibration)> {
        self.current.load_full()
    }

    /// Validates and installs a new calibration, bumping the revision.
    pub fn propose(&self, new: Calibration) -> Result<u32> {
        new.validate()?;
        let rev = self.current.load().0 + 1;
        self.current.store(Arc::new((rev, new)));
        Ok(rev)
    }

    fn profile_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}.toml", self.profile))
    }

    /// Writes the current calibration atomically via temp-then-rename.
    pub fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        let (_, calibration) = &*self.current.load_full();
        let text = toml::to_string_pretty(calibration)?;
        let final_path = self.profile_path();
        let tmp_path = final_path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Loads a persisted profile, installing it as the current calibration
    /// with revision 1 if none has been proposed yet this run. Corrupt
    /// files are moved aside with a timestamp suffix and `CalibrationCorrupt`
    /// is surfaced (callers treat that the same as `MissingError`: not
    /// fatal, the session stays in `Calibrating`). A profile whose
    /// canonical grid does not match the grid this store was configured
    /// for is left in place (it may be valid again under a different
    /// `--canonical-grid`) but is rejected with `CalibrationInvalid`
    /// rather than silently adopted (spec.md §8 scenario 5).
    pub fn load_from_storage(&self) -> Result<()> {
        let path = self.profile_path();
        if !path.exists() {
            return Err(Error::CalibrationMissing(self.profile.clone()));
        }
        let text = std::fs::read_to_string(&path)?;
        let parsed: std::result::Result<Calibration, _> = toml::from_str(&text);
        match parsed {
            Ok(calibration) => {
                if let Err(e) = calibration.validate() {
                    self.quarantine(&path);
                    return Err(e);
                }
                if calibration.canonical_cols != self.configured_cols || calibration.canonical_rows != self.configured_rows {
                    return Err(Error::calibration_invalid(format!(
                        "stored calibration grid {}x{} does not match configured grid {}x{}",
                        calibration.canonical_cols, calibration.canonical_rows, self.configured_cols, self.configured_rows
                    )));
                }
                self.current.store(Arc::new((1, calibration)));
                Ok(())
            }
            Err(e) => {
                self.quarantine(&path);
                Err(Error::CalibrationCorrupt(e.to_string()))
            }
        }
    }

    fn quarantine(&self, path: &Path) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let quarantined = path.with_extension(format!("toml.corrupt.{ts}"));
        if let Err(e) = std::fs::rename(path, &quarantined) {
            tracing::warn!("failed to quarantine corrupt calibration file: {e}");
        } else {
            tracing::warn!("quarantined corrupt calibration file as {quarantined:?}");
        }
    }
}

/// Resolves the platform config directory used for calibration profiles,
/// e.g. `~/.config/arsandbox-core/calibration` on Linux.
pub fn default_storage_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("arsandbox-core")
        .join("calibration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new("test-profile", dir.path().to_path_buf(), 64, 48);
        let mut calibration = Calibration::default_for_grid(64, 48);
        calibration.alpha = 0.5;
        store.propose(calibration.clone()).unwrap();
        store.persist().unwrap();

        let reloaded = CalibrationStore::new("test-profile", dir.path().to_path_buf(), 64, 48);
        reloaded.load_from_storage().unwrap();
        let (_, loaded) = &*reloaded.current();
        assert_eq!(loaded, &calibration);
    }

    #[test]
    fn missing_profile_reports_missing_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new("nope", dir.path().to_path_buf(), 64, 48);
        let err = store.load_from_storage().unwrap_err();
        assert!(matches!(err, Error::CalibrationMissing(_)));
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "not valid toml {{{").unwrap();
        let store = CalibrationStore::new("broken", dir.path().to_path_buf(), 64, 48);
        let err = store.load_from_storage().unwrap_err();
        assert!(matches!(err, Error::CalibrationCorrupt(_)));
        assert!(!dir.path().join("broken.toml").exists());
    }

    #[test]
    fn propose_rejects_inverted_clip_planes() {
        let mut calibration = Calibration::default_for_grid(64, 48);
        calibration.min_elev_mm = 100;
        calibration.max_elev_mm = -100;
        assert!(calibration.validate().is_err());
    }

    #[test]
    fn propose_rejects_non_monotonic_color_map() {
        let mut calibration = Calibration::default_for_grid(64, 48);
        calibration.color_map = vec![
            ColorBand { threshold_mm: 0, rgb: [0, 0, 0] },
            ColorBand { threshold_mm: -10, rgb: [1, 1, 1] },
        ];
        assert!(calibration.validate().is_err());
    }

    #[test]
    fn revision_increases_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new("rev-test", dir.path().to_path_buf(), 32, 24);
        let r1 = store.propose(Calibration::default_for_grid(32, 24)).unwrap();
        let r2 = store.propose(Calibration::default_for_grid(32, 24)).unwrap();
        assert!(r2 > r1);
    }

    #[test]
    fn load_rejects_a_stored_profile_whose_grid_does_not_match_the_configured_one() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CalibrationStore::new("grid-mismatch", dir.path().to_path_buf(), 160, 120);
        writer.propose(Calibration::default_for_grid(160, 120)).unwrap();
        writer.persist().unwrap();

        let reader = CalibrationStore::new("grid-mismatch", dir.path().to_path_buf(), 200, 150);
        let err = reader.load_from_storage().unwrap_err();
        assert!(matches!(err, Error::CalibrationInvalid(_)));
        // The file itself is untouched: it may be valid again under the
        // grid it was actually captured for.
        assert!(dir.path().join("grid-mismatch.toml").exists());
    }
}
