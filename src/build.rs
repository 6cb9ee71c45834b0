//! Turning descriptors into surface and legend images.
//!
//! Builds run in two stages on separate pools: an I/O stage that reads the
//! scalar grid(s) a descriptor needs, and a CPU stage that colorizes them into
//! the surface layout and renders the legend. Results go back to the cache
//! through [`ImageSink`]; nothing here knows whether the slot still wants them.

use std::io;
use std::sync::{Arc, Weak};

use anyhow::{Context, bail};
use image::RgbaImage;
use tracing::{debug, error, trace, warn};

use crate::cache::{BuildQueue, ImageSink, TextureCache};
use crate::colormap::Colorizer;
use crate::config::{GridConfig, LatitudeRange};
use crate::dataset::{Datasets, ScalarGrid};
use crate::descriptor::{DataMode, Descriptor};
use crate::error::BuildError;
use crate::pool::{self, Intake, Submitter, WorkerPool};

/// `secondary - primary` per cell. Cells where either side holds no data keep
/// the primary value, so masked cells stay masked.
pub fn difference(primary: &[f32], secondary: &[f32], fill: f32) -> Vec<f32> {
    debug_assert_eq!(primary.len(), secondary.len());
    let missing = |v: f32| v == fill || v.is_nan();
    primary
        .iter()
        .zip(secondary)
        .map(|(&p, &s)| if missing(p) || missing(s) { p } else { s - p })
        .collect()
}

/// Read the grid `desc` shows, combining datasets as its mode requires.
pub fn read_input(datasets: &Datasets, desc: &Descriptor) -> Result<ScalarGrid, BuildError> {
    let (variable, frame, depth) = (desc.variable(), desc.frame(), desc.depth());
    match desc.mode() {
        DataMode::Primary => Ok(datasets.primary().read_scalar_grid(variable, frame, depth)?),
        DataMode::Alternate => match datasets.alternate() {
            Some(alt) => Ok(alt.read_scalar_grid(variable, frame, depth)?),
            None => {
                warn!(%desc, "no alternate dataset configured; showing primary");
                Ok(datasets.primary().read_scalar_grid(variable, frame, depth)?)
            }
        },
        DataMode::Difference => {
            let alt = datasets.alternate().ok_or(BuildError::MissingAlternate)?;
            let primary = datasets.primary().read_scalar_grid(variable, frame, depth)?;
            let secondary = alt.read_scalar_grid(variable, frame, depth)?;
            if primary.dimensions() != secondary.dimensions() {
                return Err(BuildError::ShapeMismatch {
                    primary: primary.dimensions(),
                    alternate: secondary.dimensions(),
                });
            }
            let values = difference(&primary.values, &secondary.values, primary.fill_value);
            Ok(ScalarGrid { values, ..primary })
        }
    }
}

/// Placement of a grid inside the full-globe surface image.
///
/// The surface spans 90S..90N at the grid's row resolution; latitudes the
/// grid does not cover are transparent rows. Row 0 of the image is north.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLayout {
    width: u32,
    grid_height: u32,
    blank_north: u32,
    blank_south: u32,
}

impl SurfaceLayout {
    pub fn new(grid: GridConfig, latitude: LatitudeRange) -> Self {
        let rows_per_degree = grid.height as f32 / (latitude.max - latitude.min);
        let pad = |degrees: f32| (degrees * rows_per_degree).round().max(0.0) as u32;
        Self {
            width: grid.width,
            grid_height: grid.height,
            blank_north: pad(90.0 - latitude.max),
            blank_south: pad(latitude.min + 90.0),
        }
    }

    /// `(width, height)` of every surface image.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.image_height())
    }

    pub fn image_height(&self) -> u32 {
        self.grid_height + self.blank_north + self.blank_south
    }

    pub fn grid_dimensions(&self) -> (u32, u32) {
        (self.width, self.grid_height)
    }

    /// Lay out RGBA rows (southernmost first) north-up with padding.
    pub fn place(&self, grid_pixels: &[u8]) -> Result<RgbaImage, BuildError> {
        let row_len = self.width as usize * 4;
        if grid_pixels.len() != row_len * self.grid_height as usize {
            return Err(BuildError::LayoutMismatch {
                grid: (self.width, (grid_pixels.len() / row_len.max(1)) as u32),
                layout: self.grid_dimensions(),
            });
        }
        let mut out = vec![0u8; row_len * self.image_height() as usize];
        for (r, row) in grid_pixels.chunks_exact(row_len).enumerate() {
            let target = self.blank_north as usize + (self.grid_height as usize - 1 - r);
            out[target * row_len..(target + 1) * row_len].copy_from_slice(row);
        }
        let (width, height) = self.dimensions();
        RgbaImage::from_raw(width, height, out).ok_or(BuildError::LayoutMismatch {
            grid: self.grid_dimensions(),
            layout: (width, height),
        })
    }
}

/// Colorize `grid` for `desc`; returns `(surface, legend)`.
pub fn render_images(
    colorizer: &dyn Colorizer,
    layout: &SurfaceLayout,
    desc: &Descriptor,
    grid: &ScalarGrid,
) -> Result<(RgbaImage, RgbaImage), BuildError> {
    if grid.dimensions() != layout.grid_dimensions() {
        return Err(BuildError::LayoutMismatch {
            grid: grid.dimensions(),
            layout: layout.grid_dimensions(),
        });
    }
    let pixels = colorizer.colorize(
        desc.colormap(),
        desc.bounds(),
        &grid.values,
        grid.fill_value,
        desc.log_scale(),
    )?;
    let surface = layout.place(&pixels)?;
    let legend = colorizer.legend_column(desc.colormap(), desc.bounds())?;
    Ok((surface, legend))
}

impl BuildQueue for Submitter<Descriptor> {
    fn submit(&self, desc: Descriptor) {
        let shown = desc.to_string();
        if !Submitter::submit(self, desc) {
            error!(desc = %shown, "build queue closed; request dropped");
        }
    }
}

struct ColorJob {
    desc: Descriptor,
    grid: ScalarGrid,
}

/// Worker counts for the two build stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildWorkers {
    pub io: usize,
    pub cpu: usize,
}

pub struct BuildPipeline {
    io: WorkerPool<Descriptor>,
    cpu: WorkerPool<ColorJob>,
}

impl BuildPipeline {
    /// Serve `requests` with I/O workers that feed a CPU pool.
    pub fn spawn(
        workers: BuildWorkers,
        requests: Intake<Descriptor>,
        datasets: Datasets,
        colorizer: Arc<dyn Colorizer>,
        layout: SurfaceLayout,
        sink: Weak<dyn ImageSink>,
    ) -> io::Result<Self> {
        let cpu = WorkerPool::spawn("build-cpu", workers.cpu, {
            let sink = sink.clone();
            move |job: ColorJob| {
                let Some(sink) = sink.upgrade() else {
                    trace!(desc = %job.desc, "cache gone; dropping build");
                    return Ok(());
                };
                match render_images(colorizer.as_ref(), &layout, &job.desc, &job.grid) {
                    Ok((surface, legend)) => {
                        let kept = sink.store(job.desc, surface, legend);
                        trace!(kept, "images stored");
                        Ok(())
                    }
                    Err(err) => {
                        sink.abandon(&job.desc, &err.to_string());
                        Err(err).with_context(|| format!("colorizing {}", job.desc))
                    }
                }
            }
        })?;

        let to_cpu = cpu.submitter();
        let io = WorkerPool::serve("build-io", workers.io, requests, move |desc: Descriptor| {
            let grid = match read_input(&datasets, &desc) {
                Ok(grid) => grid,
                Err(err) => {
                    if let Some(sink) = sink.upgrade() {
                        sink.abandon(&desc, &err.to_string());
                    }
                    return Err(err).with_context(|| format!("reading {desc}"));
                }
            };
            debug!(%desc, "grid read");
            if let Err(job) = to_cpu.try_submit(ColorJob { desc, grid }) {
                if let Some(sink) = sink.upgrade() {
                    sink.abandon(&job.desc, "colorize queue closed");
                }
                bail!("colorize queue closed for {}", job.desc);
            }
            Ok(())
        })?;

        Ok(Self { io, cpu })
    }

    /// Builds waiting for the I/O and CPU stages.
    pub fn queued(&self) -> (usize, usize) {
        (self.io.queued(), self.cpu.queued())
    }

    /// Finish queued builds and stop the workers.
    ///
    /// The I/O queue only closes once the cache holding its submitter is
    /// dropped; drop every cache handle before calling this.
    pub fn shutdown(self) {
        self.io.shutdown();
        self.cpu.shutdown();
    }
}

/// A cache whose misses are built by a fresh pipeline.
pub fn start(
    slots: usize,
    workers: BuildWorkers,
    datasets: Datasets,
    colorizer: Arc<dyn Colorizer>,
    layout: SurfaceLayout,
) -> io::Result<(Arc<TextureCache>, BuildPipeline)> {
    let (requests, intake) = pool::queue::<Descriptor>();
    let cache = Arc::new(TextureCache::new(slots, layout.dimensions(), Box::new(requests)));
    let sink: Weak<dyn ImageSink> = Arc::downgrade(&cache) as Weak<dyn ImageSink>;
    let pipeline = BuildPipeline::spawn(workers, intake, datasets, colorizer, layout, sink)?;
    Ok((cache, pipeline))
}
