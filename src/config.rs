use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::descriptor::{Bounds, DataMode};

/// Shape of every scalar field in the datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GridConfig {
    pub width: u32,
    pub height: u32,
    pub depth_levels: u32,
}

impl GridConfig {
    /// Values in one depth slice.
    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 360,
            height: 180,
            depth_levels: 1,
        }
    }
}

/// Latitudes (degrees) covered by the grid rows, south to north.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LatitudeRange {
    pub min: f32,
    pub max: f32,
}

impl Default for LatitudeRange {
    fn default() -> Self {
        Self {
            min: -90.0,
            max: 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScreensConfig {
    pub rows: u32,
    pub columns: u32,
}

impl Default for ScreensConfig {
    fn default() -> Self {
        Self {
            rows: 1,
            columns: 1,
        }
    }
}

/// What the player does after the last available frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndOfData {
    /// Rewind to the first frame.
    #[default]
    Loop,
    /// Hold the last frame until new frames appear.
    Wait,
}

/// Display defaults for one variable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VariableDefaults {
    pub min: f32,
    pub max: f32,
    /// Bounds used when the slot shows the difference between datasets.
    pub diff_min: f32,
    pub diff_max: f32,
    pub colormap: String,
    pub log_scale: bool,
}

impl VariableDefaults {
    pub fn bounds(&self, mode: DataMode) -> Bounds {
        match mode {
            DataMode::Difference => Bounds::new(self.diff_min, self.diff_max),
            DataMode::Primary | DataMode::Alternate => Bounds::new(self.min, self.max),
        }
    }
}

impl Default for VariableDefaults {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            diff_min: -1.0,
            diff_max: 1.0,
            colormap: "rainbow".to_string(),
            log_scale: false,
        }
    }
}

/// What one screen slot shows. Unset fields come from the variable defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlotConfig {
    pub variable: String,
    #[serde(default)]
    pub mode: DataMode,
    #[serde(default)]
    pub colormap: Option<String>,
    #[serde(default)]
    pub log_scale: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Directory holding the primary simulation output.
    pub primary_dataset: PathBuf,
    /// Optional second run, used by alternate and difference modes.
    pub alternate_dataset: Option<PathBuf>,
    pub grid: GridConfig,
    pub latitude: LatitudeRange,
    /// Marker for cells without data (land, ice).
    pub fill_value: f32,
    /// Directory scanned for `*.ncmap` colormaps.
    pub colormap_dir: Option<PathBuf>,
    /// Persisted per-variable bounds and colormaps.
    pub bounds_cache: Option<PathBuf>,
    pub screens: ScreensConfig,
    /// Workers reading grids from disk.
    pub io_threads: usize,
    /// Workers colorizing grids; 0 means one per available core.
    pub cpu_threads: usize,
    /// Delay between frame advances during playback.
    #[serde(with = "humantime_serde")]
    pub frame_interval: Duration,
    /// Presenter tick.
    #[serde(with = "humantime_serde")]
    pub display_interval: Duration,
    pub end_of_data: EndOfData,
    /// Starting frame; the first available frame when unset.
    pub initial_frame: Option<u32>,
    pub initial_depth: u32,
    pub variables: BTreeMap<String, VariableDefaults>,
    /// One entry per screen, row-major.
    pub slots: Vec<SlotConfig>,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            self.grid.width > 0 && self.grid.height > 0,
            "grid width and height must be greater than zero"
        );
        ensure!(
            self.grid.depth_levels > 0,
            "grid.depth-levels must be greater than zero"
        );
        ensure!(
            self.initial_depth < self.grid.depth_levels,
            "initial-depth {} exceeds grid.depth-levels {}",
            self.initial_depth,
            self.grid.depth_levels
        );
        ensure!(
            (-90.0..=90.0).contains(&self.latitude.min)
                && (-90.0..=90.0).contains(&self.latitude.max)
                && self.latitude.min < self.latitude.max,
            "latitude range must satisfy -90 <= min < max <= 90"
        );
        ensure!(
            self.screens.rows > 0 && self.screens.columns > 0,
            "screens rows and columns must be greater than zero"
        );
        ensure!(self.io_threads > 0, "io-threads must be greater than zero");
        ensure!(
            !self.frame_interval.is_zero(),
            "frame-interval must be positive"
        );
        ensure!(
            !self.display_interval.is_zero(),
            "display-interval must be positive"
        );
        ensure!(
            self.slots.len() == self.slot_count(),
            "expected {} slots for a {}x{} screen grid, found {}",
            self.slot_count(),
            self.screens.rows,
            self.screens.columns,
            self.slots.len()
        );
        for (name, var) in &self.variables {
            ensure!(
                var.min < var.max,
                "variables.{name}: min must be below max"
            );
            ensure!(
                var.diff_min < var.diff_max,
                "variables.{name}: diff-min must be below diff-max"
            );
        }
        for (i, slot) in self.slots.iter().enumerate() {
            ensure!(!slot.variable.is_empty(), "slots[{i}]: variable is empty");
            ensure!(
                slot.mode == DataMode::Primary || self.alternate_dataset.is_some(),
                "slots[{i}]: {} mode requires alternate-dataset",
                slot.mode
            );
        }
        Ok(self)
    }

    pub fn slot_count(&self) -> usize {
        self.screens.rows as usize * self.screens.columns as usize
    }

    /// Effective CPU worker count.
    pub fn cpu_workers(&self) -> usize {
        if self.cpu_threads > 0 {
            return self.cpu_threads;
        }
        thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Defaults for `variable`, falling back to the generic ones.
    pub fn variable(&self, variable: &str) -> VariableDefaults {
        self.variables.get(variable).cloned().unwrap_or_default()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            primary_dataset: PathBuf::new(),
            alternate_dataset: None,
            grid: GridConfig::default(),
            latitude: LatitudeRange::default(),
            fill_value: -1.0e34,
            colormap_dir: None,
            bounds_cache: None,
            screens: ScreensConfig::default(),
            io_threads: 2,
            cpu_threads: 0,
            frame_interval: Duration::from_secs(1),
            display_interval: Duration::from_millis(50),
            end_of_data: EndOfData::default(),
            initial_frame: None,
            initial_depth: 0,
            variables: BTreeMap::new(),
            slots: Vec::new(),
        }
    }
}
