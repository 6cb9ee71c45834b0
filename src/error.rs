use std::path::PathBuf;

use thiserror::Error;

/// Failure to obtain a scalar grid from a dataset.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The frame or variable is not (yet) present on disk.
    #[error("variable {variable} not available for frame {frame}")]
    NotFound { variable: String, frame: u32 },

    /// Requested depth level beyond what the variable stores.
    #[error("depth {depth} out of range for {variable} (levels: {levels})")]
    DepthOutOfRange {
        variable: String,
        depth: u32,
        levels: u32,
    },

    /// File exists but its size does not match the configured grid.
    #[error("{} has {len} bytes, not a multiple of one {slice_len}-byte depth slice", .path.display())]
    Corrupt {
        path: PathBuf,
        len: u64,
        slice_len: u64,
    },

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure while turning a descriptor into an image pair.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Difference mode needs both datasets.
    #[error("difference mode requested but no alternate dataset is configured")]
    MissingAlternate,

    /// Primary and alternate grids disagree in shape.
    #[error("grid shape mismatch: primary {primary:?}, alternate {alternate:?}")]
    ShapeMismatch {
        primary: (u32, u32),
        alternate: (u32, u32),
    },

    /// Grid does not fit the surface layout the cache expects.
    #[error("grid {grid:?} does not match surface layout {layout:?}")]
    LayoutMismatch { grid: (u32, u32), layout: (u32, u32) },

    #[error(transparent)]
    Colormap(#[from] ColormapError),
}

/// Colormap lookup and parsing failures.
#[derive(Debug, Error)]
pub enum ColormapError {
    #[error("unknown colormap: {0}")]
    Unknown(String),

    #[error("invalid bounds {lower}..{upper}")]
    InvalidBounds { lower: f32, upper: f32 },

    #[error("{}:{line}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{} defines no colors", .0.display())]
    Empty(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures reading or writing the bounds cache file.
#[derive(Debug, Error)]
pub enum BoundsCacheError {
    #[error("{}:{line}: expected `name kind value`", .path.display())]
    Malformed { path: PathBuf, line: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
