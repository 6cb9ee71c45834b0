//! Binary entrypoint for oceanview.

use std::io::{self, BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser};
use humantime::format_duration;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use oceanview::bounds_cache::BoundsCache;
use oceanview::build::{self, BuildWorkers, SurfaceLayout};
use oceanview::colormap::{Colorizer, ColormapRegistry};
use oceanview::config::Configuration;
use oceanview::dataset::{ArrayReader, Datasets, RawFrameStore};
use oceanview::events::{Evicted, FramesChanged, PlayerCommand};
use oceanview::settings::Settings;
use oceanview::tasks::{player, presenter, watch};

#[derive(Debug, Parser)]
#[command(name = "oceanview", version, about = "Ocean simulation frame visualizer")]
struct Cli {
    /// Path to YAML config
    #[arg(value_name = "CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Stop after advancing this many frames
    #[arg(long, value_name = "N")]
    max_frames: Option<u64>,

    /// Start with playback stopped
    #[arg(long)]
    paused: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    // map -v to log level
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("oceanview={level}").parse()?)
        .add_directive("notify=warn".parse()?);
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

/// Open the configured datasets; the stores are returned for the watcher.
fn open_datasets(cfg: &Configuration) -> Result<(Datasets, Vec<Arc<RawFrameStore>>)> {
    let primary = Arc::new(
        RawFrameStore::open(&cfg.primary_dataset, cfg.grid, cfg.fill_value)
            .with_context(|| format!("opening primary dataset {}", cfg.primary_dataset.display()))?,
    );
    let mut stores = vec![Arc::clone(&primary)];
    let alternate = match &cfg.alternate_dataset {
        Some(root) => {
            let store = Arc::new(
                RawFrameStore::open(root, cfg.grid, cfg.fill_value)
                    .with_context(|| format!("opening alternate dataset {}", root.display()))?,
            );
            stores.push(Arc::clone(&store));
            Some(store as Arc<dyn ArrayReader>)
        }
        None => None,
    };
    Ok((Datasets::new(primary, alternate), stores))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let cfg = Configuration::from_yaml_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?
        .validated()
        .context("invalid configuration values")?;
    debug!("Loaded configuration from {}:\n{:#?}", cli.config.display(), cfg);

    let (datasets, stores) = open_datasets(&cfg)?;
    let frame = cfg
        .initial_frame
        .or_else(|| datasets.first_frame())
        .ok_or_else(|| anyhow!("no frames found in {}", cfg.primary_dataset.display()))?;
    let variables = datasets.variables();
    for slot in &cfg.slots {
        if !variables.contains(&slot.variable) {
            warn!(variable = %slot.variable, "slot variable not present in dataset yet");
        }
    }

    let colormaps = match &cfg.colormap_dir {
        Some(dir) => ColormapRegistry::load_dir(dir)
            .with_context(|| format!("loading colormaps from {}", dir.display()))?,
        None => ColormapRegistry::builtin(),
    };
    for slot in cfg.slots.iter().filter_map(|s| s.colormap.as_deref()) {
        if !colormaps.contains(slot) {
            warn!(colormap = slot, "unknown colormap; slot will stay blank");
        }
    }
    let bounds_cache = cfg
        .bounds_cache
        .as_ref()
        .map(BoundsCache::open)
        .transpose()
        .context("reading bounds cache")?;

    let layout = SurfaceLayout::new(cfg.grid, cfg.latitude);
    let workers = BuildWorkers {
        io: cfg.io_threads,
        cpu: cfg.cpu_workers(),
    };
    let colorizer: Arc<dyn Colorizer> = Arc::new(colormaps);
    let (cache, pipeline) = build::start(cfg.slot_count(), workers, datasets.clone(), colorizer, layout)
        .context("starting build workers")?;
    let settings = Arc::new(Mutex::new(Settings::from_config(&cfg, frame, bounds_cache)));
    info!(
        slots = cfg.slot_count(),
        frame,
        io = workers.io,
        cpu = workers.cpu,
        frame_interval = %format_duration(cfg.frame_interval),
        "oceanview started"
    );

    // Channels (small/bounded)
    let (command_tx, command_rx) = mpsc::channel::<PlayerCommand>(16); // stdin/signals -> Player
    let (frames_tx, frames_rx) = mpsc::channel::<FramesChanged>(8); // Watcher -> Player
    let (evicted_tx, evicted_rx) = mpsc::channel::<Evicted>(16); // Player -> Presenter

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    // Playback control words on stdin; EOF shuts down
    if io::stdin().is_terminal() {
        let cancel = cancel.clone();
        let commands = command_tx.clone();
        // detached: a blocked read must not hold up runtime shutdown
        let reader = std::thread::Builder::new().name("stdin-commands".into()).spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("stdin watcher failed: {err}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<PlayerCommand>() {
                    Ok(cmd) => {
                        if commands.blocking_send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("{err}"),
                }
            }
            info!("stdin closed; initiating shutdown");
            cancel.cancel();
        });
        if let Err(err) = reader {
            warn!("failed to start stdin command reader: {err}");
        }
    } else {
        debug!("stdin is not a terminal; skipping command reader");
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        let control = command_tx.clone();
        let mut playing = !cli.paused;
        tokio::spawn(async move {
            match signal(SignalKind::user_defined1()) {
                Ok(mut sigusr1) => {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            received = sigusr1.recv() => {
                                if received.is_none() {
                                    break;
                                }
                                playing = !playing;
                                let cmd = if playing { PlayerCommand::Play } else { PlayerCommand::Stop };
                                info!(%cmd, "SIGUSR1 received; toggling playback");
                                if control.send(cmd).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => warn!("failed to register SIGUSR1 handler: {err}"),
            }
        });
    }
    drop(command_tx);

    let mut tasks = JoinSet::new();

    // Player
    tasks.spawn({
        let settings = Arc::clone(&settings);
        let cache = Arc::clone(&cache);
        let opts = player::PlayerOptions {
            frame_interval: cfg.frame_interval,
            end_of_data: cfg.end_of_data,
            start_playing: !cli.paused,
            max_frames: cli.max_frames,
        };
        let cancel = cancel.clone();
        async move {
            player::run(settings, datasets, cache, command_rx, frames_rx, evicted_tx, opts, cancel)
                .await
                .context("player task failed")
        }
    });

    // Presenter
    tasks.spawn({
        let cache = Arc::clone(&cache);
        let interval = cfg.display_interval;
        let cancel = cancel.clone();
        async move {
            presenter::run(cache, evicted_rx, None, interval, cancel)
                .await
                .context("presenter task failed")
        }
    });

    // Watcher
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            watch::run(stores, frames_tx, cancel)
                .await
                .context("watch task failed")
        }
    });

    // Drain JoinSet (wait for other tasks to complete)
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("task error: {e:?}");
                cancel.cancel();
            }
            Err(e) => error!("join error: {e}"),
        }
    }

    let released = cache.drain().len();
    debug!(released, "cache drained");
    drop(cache);
    tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("stopping build workers")?;
    Ok(())
}
