//! Scalar to RGBA8 mapping through named lookup-table colormaps.
//!
//! Colormaps come from a few built-in gradients plus any `.ncmap` files in the
//! configured directory (one `r g b` triple per line). Every map is resampled to
//! a fixed number of entries so lookups are a single index computation.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use image::{Rgba, RgbaImage};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::descriptor::Bounds;
use crate::error::ColormapError;

/// Legend textures are a single column.
pub const LEGEND_WIDTH: u32 = 1;
pub const LEGEND_HEIGHT: u32 = 500;

const LUT_ENTRIES: usize = 500;
const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

/// Contract of the pixel kernel used by image builds.
pub trait Colorizer: Send + Sync {
    /// Map `data` to RGBA8 pixels (`data.len() * 4` bytes). Cells equal to
    /// `fill` (or NaN) become fully transparent.
    fn colorize(
        &self,
        colormap: &str,
        bounds: Bounds,
        data: &[f32],
        fill: f32,
        log_scale: bool,
    ) -> Result<Vec<u8>, ColormapError>;

    /// A `LEGEND_WIDTH x LEGEND_HEIGHT` column, upper bound at the top row.
    fn legend_column(&self, colormap: &str, bounds: Bounds) -> Result<RgbaImage, ColormapError>;
}

#[derive(Debug, Clone)]
pub struct Colormap {
    name: String,
    lut: Vec<[u8; 3]>,
}

impl Colormap {
    /// Linearly resample `stops` to the fixed lookup-table size.
    pub fn from_stops(name: impl Into<String>, stops: &[[u8; 3]]) -> Self {
        let name = name.into();
        if stops.is_empty() {
            return Self {
                name,
                lut: vec![[0, 0, 0]; LUT_ENTRIES],
            };
        }
        let n = stops.len();
        let lut = (0..LUT_ENTRIES)
            .map(|i| {
                let raw = (n - 1) as f32 * (i as f32 / (LUT_ENTRIES - 1) as f32);
                let low = (raw.floor() as usize).min(n - 1);
                let high = (raw.ceil() as usize).min(n - 1);
                let pct = raw - raw.floor();
                let (c0, c1) = (stops[low], stops[high]);
                let mut out = [0u8; 3];
                for c in 0..3 {
                    let v = c0[c] as f32 + pct * (c1[c] as f32 - c0[c] as f32);
                    out[c] = v.round().clamp(0.0, 255.0) as u8;
                }
                out
            })
            .collect();
        Self { name, lut }
    }

    /// Parse the `r g b` per line format.
    pub fn parse(name: impl Into<String>, path: &Path, text: &str) -> Result<Self, ColormapError> {
        let mut stops = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed: Result<Vec<u8>, _> = line.split_whitespace().map(str::parse::<u8>).collect();
            match parsed {
                Ok(rgb) if rgb.len() == 3 => stops.push([rgb[0], rgb[1], rgb[2]]),
                Ok(rgb) => {
                    return Err(ColormapError::Parse {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        reason: format!("expected 3 components, found {}", rgb.len()),
                    });
                }
                Err(err) => {
                    return Err(ColormapError::Parse {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        reason: err.to_string(),
                    });
                }
            }
        }
        if stops.is_empty() {
            return Err(ColormapError::Empty(path.to_path_buf()));
        }
        Ok(Self::from_stops(name, &stops))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Color at normalized position `t` (clamped to `0..=1`).
    pub fn sample(&self, t: f32) -> [u8; 3] {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let idx = ((t * (LUT_ENTRIES - 1) as f32).round() as usize).min(LUT_ENTRIES - 1);
        self.lut[idx]
    }
}

/// Position of `value` inside `bounds`, optionally on a log scale.
pub fn normalize(value: f32, bounds: Bounds, log_scale: bool) -> f32 {
    let span = bounds.span();
    if log_scale {
        let shifted = (value - bounds.lower()).max(0.0);
        (1.0 + shifted).ln() / (1.0 + span).ln()
    } else {
        (value - bounds.lower()) / span
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColormapRegistry {
    maps: BTreeMap<String, Colormap>,
}

impl ColormapRegistry {
    /// Gradients that are always available.
    pub fn builtin() -> Self {
        let mut reg = Self::default();
        reg.insert(Colormap::from_stops(
            "grayscale",
            &[[0, 0, 0], [255, 255, 255]],
        ));
        reg.insert(Colormap::from_stops(
            "rainbow",
            &[
                [48, 18, 59],
                [40, 120, 240],
                [30, 200, 170],
                [170, 240, 60],
                [250, 180, 40],
                [220, 60, 20],
                [122, 4, 3],
            ],
        ));
        reg.insert(Colormap::from_stops(
            "bluewhitered",
            &[[10, 30, 150], [90, 140, 230], [250, 250, 250], [230, 90, 70], [150, 10, 20]],
        ));
        reg.insert(Colormap::from_stops(
            "hotres",
            &[[0, 0, 0], [180, 0, 0], [255, 140, 0], [255, 255, 120], [255, 255, 255]],
        ));
        reg
    }

    /// Built-ins plus every `*.ncmap` file directly inside `dir`. A file named
    /// like a built-in replaces it.
    pub fn load_dir(dir: &Path) -> Result<Self, ColormapError> {
        let mut reg = Self::builtin();
        for entry in WalkDir::new(dir)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if path.extension().and_then(OsStr::to_str) != Some("ncmap") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            let text = fs::read_to_string(path)?;
            let map = Colormap::parse(name, path, &text)?;
            debug!(colormap = name, path = %path.display(), "colormap loaded");
            reg.insert(map);
        }
        info!(count = reg.maps.len(), dir = %dir.display(), "colormaps registered");
        Ok(reg)
    }

    pub fn insert(&mut self, map: Colormap) {
        self.maps.insert(map.name.clone(), map);
    }

    pub fn get(&self, name: &str) -> Option<&Colormap> {
        self.maps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.maps.keys().map(String::as_str)
    }

    fn lookup(&self, name: &str, bounds: Bounds) -> Result<&Colormap, ColormapError> {
        if !bounds.is_valid() {
            return Err(ColormapError::InvalidBounds {
                lower: bounds.lower(),
                upper: bounds.upper(),
            });
        }
        self.get(name)
            .ok_or_else(|| ColormapError::Unknown(name.to_string()))
    }
}

impl Colorizer for ColormapRegistry {
    fn colorize(
        &self,
        colormap: &str,
        bounds: Bounds,
        data: &[f32],
        fill: f32,
        log_scale: bool,
    ) -> Result<Vec<u8>, ColormapError> {
        let map = self.lookup(colormap, bounds)?;
        let mut out = Vec::with_capacity(data.len() * 4);
        for &value in data {
            if value == fill || value.is_nan() {
                out.extend_from_slice(&TRANSPARENT);
                continue;
            }
            let [r, g, b] = map.sample(normalize(value, bounds, log_scale));
            out.extend_from_slice(&[r, g, b, 255]);
        }
        Ok(out)
    }

    fn legend_column(&self, colormap: &str, bounds: Bounds) -> Result<RgbaImage, ColormapError> {
        let map = self.lookup(colormap, bounds)?;
        let last = (LEGEND_HEIGHT - 1) as f32;
        Ok(RgbaImage::from_fn(LEGEND_WIDTH, LEGEND_HEIGHT, |_, row| {
            let [r, g, b] = map.sample((last - row as f32) / last);
            Rgba([r, g, b, 255])
        }))
    }
}
