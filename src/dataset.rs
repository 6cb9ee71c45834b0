//! Access to the scalar grids of a simulation run.
//!
//! On disk a dataset is a directory with one sub-directory per frame (the
//! directory name is the frame number, zero-padded or not) holding one `<variable>.f32` file per
//! variable. Each file is the raw native-endian `f32` grid, depth levels
//! stored one after another.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::GridConfig;
use crate::error::ReadError;

/// Extension of variable files.
pub const VARIABLE_EXT: &str = "f32";

/// One horizontal slice of a variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarGrid {
    pub width: u32,
    pub height: u32,
    /// Row-major, `width * height` values, southernmost row first.
    pub values: Vec<f32>,
    pub fill_value: f32,
}

impl ScalarGrid {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_fill(&self, value: f32) -> bool {
        value == self.fill_value || value.is_nan()
    }
}

/// Source of scalar grids for one dataset.
pub trait ArrayReader: Send + Sync {
    fn read_scalar_grid(&self, variable: &str, frame: u32, depth: u32)
    -> Result<ScalarGrid, ReadError>;

    /// Frame numbers currently available, ascending.
    fn available_frames(&self) -> Vec<u32>;

    /// Variable names found in the dataset, sorted.
    fn variables(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
struct FrameIndex {
    /// Frame number to the directory it was found in.
    frames: BTreeMap<u32, PathBuf>,
    variables: BTreeSet<String>,
}

/// Directory-backed dataset.
#[derive(Debug)]
pub struct RawFrameStore {
    root: PathBuf,
    grid: GridConfig,
    fill_value: f32,
    index: RwLock<FrameIndex>,
}

impl RawFrameStore {
    /// Open `root` and index the frames it already holds.
    pub fn open(root: impl Into<PathBuf>, grid: GridConfig, fill_value: f32) -> Result<Self, ReadError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ReadError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("dataset directory {} does not exist", root.display()),
            )));
        }
        let index = scan(&root);
        info!(
            root = %root.display(),
            frames = index.frames.len(),
            variables = ?index.variables,
            "dataset opened"
        );
        Ok(Self {
            root,
            grid,
            fill_value,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the directory. Returns how many frames were added.
    pub fn refresh(&self) -> usize {
        let fresh = scan(&self.root);
        let mut index = self.index.write();
        let added = fresh
            .frames
            .keys()
            .filter(|f| !index.frames.contains_key(f))
            .count();
        if added > 0 {
            debug!(root = %self.root.display(), added, "new frames indexed");
        }
        *index = fresh;
        added
    }

    /// Indexed frames read from the directory they were found in; frames not
    /// indexed yet are looked up under the canonical padded name.
    fn variable_path(&self, variable: &str, frame: u32) -> PathBuf {
        let dir = self
            .index
            .read()
            .frames
            .get(&frame)
            .cloned()
            .unwrap_or_else(|| frame_dir(&self.root, frame));
        dir.join(format!("{variable}.{VARIABLE_EXT}"))
    }

    fn slice_len(&self) -> u64 {
        self.grid.width as u64 * self.grid.height as u64 * std::mem::size_of::<f32>() as u64
    }
}

impl ArrayReader for RawFrameStore {
    fn read_scalar_grid(
        &self,
        variable: &str,
        frame: u32,
        depth: u32,
    ) -> Result<ScalarGrid, ReadError> {
        let path = self.variable_path(variable, frame);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ReadError::NotFound {
                    variable: variable.to_string(),
                    frame,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata()?.len();
        let slice_len = self.slice_len();
        if slice_len == 0 || len % slice_len != 0 {
            return Err(ReadError::Corrupt {
                path,
                len,
                slice_len,
            });
        }
        let levels = (len / slice_len) as u32;
        if depth >= levels {
            return Err(ReadError::DepthOutOfRange {
                variable: variable.to_string(),
                depth,
                levels,
            });
        }

        file.seek(SeekFrom::Start(depth as u64 * slice_len))?;
        let mut bytes = vec![0u8; slice_len as usize];
        file.read_exact(&mut bytes)?;
        Ok(ScalarGrid {
            width: self.grid.width,
            height: self.grid.height,
            values: bytemuck::pod_collect_to_vec(bytes.as_slice()),
            fill_value: self.fill_value,
        })
    }

    fn available_frames(&self) -> Vec<u32> {
        self.index.read().frames.keys().copied().collect()
    }

    fn variables(&self) -> Vec<String> {
        self.index.read().variables.iter().cloned().collect()
    }
}

fn frame_dir(root: &Path, frame: u32) -> PathBuf {
    root.join(format!("{frame:05}"))
}

fn scan(root: &Path) -> FrameIndex {
    let mut index = FrameIndex::default();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if path.extension().and_then(OsStr::to_str) != Some(VARIABLE_EXT) {
            continue;
        }
        let Some(dir) = path.parent() else {
            continue;
        };
        let frame = dir
            .file_name()
            .and_then(OsStr::to_str)
            .and_then(|name| name.parse::<u32>().ok());
        let variable = path.file_stem().and_then(OsStr::to_str);
        let (Some(frame), Some(variable)) = (frame, variable) else {
            continue;
        };
        // sorted walk: "00007" is seen before "7"
        match index.frames.get(&frame) {
            Some(known) if known.as_path() != dir => {
                warn!(frame, kept = %known.display(), ignored = %dir.display(), "duplicate frame directory");
                continue;
            }
            Some(_) => {}
            None => {
                index.frames.insert(frame, dir.to_path_buf());
            }
        }
        index.variables.insert(variable.to_string());
    }
    index
}

/// Write one variable of one frame in the layout [`RawFrameStore`] reads.
/// `levels` holds one row-major grid per depth level.
pub fn write_variable(root: &Path, frame: u32, variable: &str, levels: &[Vec<f32>]) -> io::Result<PathBuf> {
    let dir = frame_dir(root, frame);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{variable}.{VARIABLE_EXT}"));
    let mut bytes = Vec::new();
    for level in levels {
        bytes.extend_from_slice(bytemuck::cast_slice(level.as_slice()));
    }
    fs::write(&path, bytes)?;
    Ok(path)
}

/// The primary run and, optionally, the alternate run it is compared with.
#[derive(Clone)]
pub struct Datasets {
    primary: Arc<dyn ArrayReader>,
    alternate: Option<Arc<dyn ArrayReader>>,
}

impl Datasets {
    pub fn new(primary: Arc<dyn ArrayReader>, alternate: Option<Arc<dyn ArrayReader>>) -> Self {
        Self { primary, alternate }
    }

    pub fn primary(&self) -> &dyn ArrayReader {
        self.primary.as_ref()
    }

    pub fn alternate(&self) -> Option<&dyn ArrayReader> {
        self.alternate.as_deref()
    }

    pub fn has_alternate(&self) -> bool {
        self.alternate.is_some()
    }

    /// Frames present in every configured dataset.
    pub fn frames(&self) -> Vec<u32> {
        let primary = self.primary.available_frames();
        match &self.alternate {
            None => primary,
            Some(alt) => {
                let alt: BTreeSet<u32> = alt.available_frames().into_iter().collect();
                primary.into_iter().filter(|f| alt.contains(f)).collect()
            }
        }
    }

    /// Variables present in every configured dataset.
    pub fn variables(&self) -> Vec<String> {
        let primary = self.primary.variables();
        match &self.alternate {
            None => primary,
            Some(alt) => {
                let alt: BTreeSet<String> = alt.variables().into_iter().collect();
                let shared: Vec<String> = primary.into_iter().filter(|v| alt.contains(v)).collect();
                if shared.is_empty() {
                    warn!("primary and alternate datasets share no variables");
                }
                shared
            }
        }
    }

    pub fn first_frame(&self) -> Option<u32> {
        self.frames().first().copied()
    }

    pub fn next_frame(&self, frame: u32) -> Option<u32> {
        self.frames().into_iter().find(|f| *f > frame)
    }

    pub fn previous_frame(&self, frame: u32) -> Option<u32> {
        self.frames().into_iter().rev().find(|f| *f < frame)
    }
}
