//! Persisted per-variable display settings.
//!
//! The file holds one `name kind value` record per line, for example
//! `TEMP min -2.5` or `SALT colormap hotres`. Later records win. Writes
//! replace a record in place and keep the rest of the file as it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::VariableDefaults;
use crate::error::BoundsCacheError;

pub const MIN: &str = "min";
pub const MAX: &str = "max";
pub const DIFF_MIN: &str = "diff-min";
pub const DIFF_MAX: &str = "diff-max";
pub const COLORMAP: &str = "colormap";

#[derive(Debug, Clone, PartialEq)]
struct Record {
    name: String,
    kind: String,
    value: String,
}

#[derive(Debug, Clone)]
pub struct BoundsCache {
    path: PathBuf,
    records: Vec<Record>,
}

impl BoundsCache {
    /// Load `path`; a missing file is an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BoundsCacheError> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no bounds cache yet");
                String::new()
            }
            Err(err) => return Err(err.into()),
        };
        let records = parse(&path, &text)?;
        debug!(path = %path.display(), records = records.len(), "bounds cache loaded");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_string(&self, name: &str, kind: &str) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .find(|r| r.name == name && r.kind == kind)
            .map(|r| r.value.as_str())
    }

    /// Unparseable numbers are treated as absent.
    pub fn read_float(&self, name: &str, kind: &str) -> Option<f32> {
        let raw = self.read_string(name, kind)?;
        match raw.parse::<f32>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                warn!(name, kind, value = raw, "ignoring non-numeric bounds cache value");
                None
            }
        }
    }

    pub fn write_string(&mut self, name: &str, kind: &str, value: &str) -> Result<(), BoundsCacheError> {
        match self
            .records
            .iter_mut()
            .find(|r| r.name == name && r.kind == kind)
        {
            Some(record) => record.value = value.to_string(),
            None => self.records.push(Record {
                name: name.to_string(),
                kind: kind.to_string(),
                value: value.to_string(),
            }),
        }
        self.persist()
    }

    pub fn write_float(&mut self, name: &str, kind: &str, value: f32) -> Result<(), BoundsCacheError> {
        self.write_string(name, kind, &value.to_string())
    }

    /// Overlay cached values for `variable` on `defaults`.
    pub fn apply(&self, variable: &str, defaults: &mut VariableDefaults) {
        let pick = |kind: &str, current: f32| self.read_float(variable, kind).unwrap_or(current);
        let (min, max) = (pick(MIN, defaults.min), pick(MAX, defaults.max));
        if min < max {
            defaults.min = min;
            defaults.max = max;
        } else {
            warn!(variable, min, max, "cached bounds are inverted; keeping configured ones");
        }
        let (diff_min, diff_max) = (pick(DIFF_MIN, defaults.diff_min), pick(DIFF_MAX, defaults.diff_max));
        if diff_min < diff_max {
            defaults.diff_min = diff_min;
            defaults.diff_max = diff_max;
        }
        if let Some(colormap) = self.read_string(variable, COLORMAP) {
            defaults.colormap = colormap.to_string();
        }
    }

    /// Save every field of `defaults` for `variable`.
    pub fn record(&mut self, variable: &str, defaults: &VariableDefaults) -> Result<(), BoundsCacheError> {
        self.write_float(variable, MIN, defaults.min)?;
        self.write_float(variable, MAX, defaults.max)?;
        self.write_float(variable, DIFF_MIN, defaults.diff_min)?;
        self.write_float(variable, DIFF_MAX, defaults.diff_max)?;
        self.write_string(variable, COLORMAP, &defaults.colormap)
    }

    fn persist(&self) -> Result<(), BoundsCacheError> {
        let mut out = String::new();
        for r in &self.records {
            out.push_str(&format!("{} {} {}\n", r.name, r.kind, r.value));
        }
        fs::write(&self.path, out)?;
        Ok(())
    }
}

fn parse(path: &Path, text: &str) -> Result<Vec<Record>, BoundsCacheError> {
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => continue,
            [name, kind, value] => records.push(Record {
                name: name.to_string(),
                kind: kind.to_string(),
                value: value.to_string(),
            }),
            _ => {
                return Err(BoundsCacheError::Malformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                });
            }
        }
    }
    Ok(records)
}
