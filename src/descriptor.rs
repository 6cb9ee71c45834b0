//! Immutable description of one renderable configuration.
//!
//! A [`Descriptor`] is the cache key for every built image pair, so equality
//! and hashing are structural over all fields, float bounds included.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Deserialize;

/// Which dataset(s) a descriptor reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataMode {
    #[default]
    Primary,
    Alternate,
    /// `alternate - primary`, cell by cell.
    Difference,
}

impl DataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Alternate => "alternate",
            Self::Difference => "difference",
        }
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value range mapped onto the colormap.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    lower: f32,
    upper: f32,
}

impl Bounds {
    pub fn new(lower: f32, upper: f32) -> Self {
        // -0.0 and 0.0 compare equal but hash differently
        Self {
            lower: lower + 0.0,
            upper: upper + 0.0,
        }
    }

    pub const fn lower(&self) -> f32 {
        self.lower
    }

    pub const fn upper(&self) -> f32 {
        self.upper
    }

    pub fn span(&self) -> f32 {
        self.upper - self.lower
    }

    /// Finite and strictly increasing.
    pub fn is_valid(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite() && self.lower < self.upper
    }
}

impl PartialEq for Bounds {
    fn eq(&self, other: &Self) -> bool {
        self.lower.to_bits() == other.lower.to_bits()
            && self.upper.to_bits() == other.upper.to_bits()
    }
}

impl Eq for Bounds {}

impl Hash for Bounds {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lower.to_bits().hash(state);
        self.upper.to_bits().hash(state);
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// What a slot wants to show. Never mutated; every `with_*` call returns a
/// new descriptor with a single field altered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    frame: u32,
    depth: u32,
    variable: String,
    colormap: String,
    mode: DataMode,
    log_scale: bool,
    bounds: Bounds,
}

impl Descriptor {
    pub fn new(
        frame: u32,
        depth: u32,
        variable: impl Into<String>,
        colormap: impl Into<String>,
        mode: DataMode,
        log_scale: bool,
        bounds: Bounds,
    ) -> Self {
        Self {
            frame,
            depth,
            variable: variable.into(),
            colormap: colormap.into(),
            mode,
            log_scale,
            bounds,
        }
    }

    pub const fn frame(&self) -> u32 {
        self.frame
    }

    pub const fn depth(&self) -> u32 {
        self.depth
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn colormap(&self) -> &str {
        &self.colormap
    }

    pub const fn mode(&self) -> DataMode {
        self.mode
    }

    pub const fn log_scale(&self) -> bool {
        self.log_scale
    }

    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Whether the descriptor can be built as-is.
    pub fn is_consistent(&self) -> bool {
        self.bounds.is_valid() && !self.variable.is_empty() && !self.colormap.is_empty()
    }

    #[must_use]
    pub fn with_frame(&self, frame: u32) -> Self {
        Self {
            frame,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_variable(&self, variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_colormap(&self, colormap: impl Into<String>) -> Self {
        Self {
            colormap: colormap.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_mode(&self, mode: DataMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_log_scale(&self, log_scale: bool) -> Self {
        Self {
            log_scale,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_bounds(&self, bounds: Bounds) -> Self {
        Self {
            bounds,
            ..self.clone()
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/d{} {} {}{} {}",
            self.variable,
            self.frame,
            self.depth,
            self.mode,
            self.colormap,
            if self.log_scale { " log" } else { "" },
            self.bounds
        )
    }
}
