use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::TextureCache;
use crate::config::EndOfData;
use crate::dataset::Datasets;
use crate::events::{Evicted, FramesChanged, PlayerCommand};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    /// Past the last frame, holding until more frames appear.
    Waiting,
}

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub frame_interval: Duration,
    pub end_of_data: EndOfData,
    pub start_playing: bool,
    /// Cancel everything after this many frame advances.
    pub max_frames: Option<u64>,
}

struct Player {
    settings: Arc<Mutex<Settings>>,
    datasets: Datasets,
    cache: Arc<TextureCache>,
    evicted: Sender<Evicted>,
    end_of_data: EndOfData,
    state: PlayState,
    advanced: u64,
}

impl Player {
    fn frame(&self) -> Option<u32> {
        self.settings.lock().frame()
    }

    fn set_frame(&self, frame: u32) {
        self.settings.lock().set_frame(frame);
    }

    /// Push changed descriptors into the cache and forward the evictions.
    async fn sync(&self) {
        let evicted = {
            let mut settings = self.settings.lock();
            if !settings.take_changed() {
                return;
            }
            settings.request_all(&self.cache)
        };
        if evicted.is_empty() {
            return;
        }
        if self.evicted.send(Evicted(evicted)).await.is_err() {
            warn!("presenter gone; evicted images dropped");
        }
    }

    /// Next frame, honoring the end-of-data policy. Returns whether the frame moved.
    fn advance(&mut self) -> bool {
        let Some(frame) = self.frame() else {
            return false;
        };
        let next = match self.datasets.next_frame(frame) {
            Some(next) => next,
            None => match self.end_of_data {
                EndOfData::Loop => match self.datasets.first_frame() {
                    Some(first) if first != frame => {
                        debug!(frame = first, "end of data; looping");
                        first
                    }
                    _ => return false,
                },
                EndOfData::Wait => {
                    if self.state == PlayState::Playing {
                        info!(frame, "end of data; waiting for new frames");
                        self.state = PlayState::Waiting;
                    }
                    return false;
                }
            },
        };
        self.set_frame(next);
        self.advanced += 1;
        true
    }

    fn handle(&mut self, cmd: PlayerCommand) {
        debug!(%cmd, state = ?self.state, "player command");
        match cmd {
            PlayerCommand::Play => self.state = PlayState::Playing,
            PlayerCommand::Stop => self.state = PlayState::Stopped,
            PlayerCommand::Next => {
                self.state = PlayState::Stopped;
                if let Some(next) = self.frame().and_then(|f| self.datasets.next_frame(f)) {
                    self.set_frame(next);
                }
            }
            PlayerCommand::Previous => {
                self.state = PlayState::Stopped;
                if let Some(prev) = self.frame().and_then(|f| self.datasets.previous_frame(f)) {
                    self.set_frame(prev);
                }
            }
            PlayerCommand::Rewind => {
                if self.state == PlayState::Waiting {
                    self.state = PlayState::Playing;
                }
                if let Some(first) = self.datasets.first_frame() {
                    self.set_frame(first);
                }
            }
            PlayerCommand::SetFrame(frame) => {
                if self.datasets.frames().contains(&frame) {
                    self.set_frame(frame);
                } else {
                    warn!(frame, "frame not available");
                }
            }
            PlayerCommand::Redraw => {
                let retried = self.cache.retry_failed();
                if !retried.is_empty() {
                    debug!(retried = retried.len(), "rebuilding failed images");
                }
                self.settings.lock().touch();
            }
        }
    }
}

/// Timed playback.
///
/// Frames advance on `frame_interval` ticks, but only once every slot's
/// newest request has settled, so a slow build holds the show instead of
/// piling up requests.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(interval = ?opts.frame_interval))]
pub async fn run(
    settings: Arc<Mutex<Settings>>,
    datasets: Datasets,
    cache: Arc<TextureCache>,
    mut commands: Receiver<PlayerCommand>,
    mut frames: Receiver<FramesChanged>,
    evicted: Sender<Evicted>,
    opts: PlayerOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let mut player = Player {
        settings,
        datasets,
        cache,
        evicted,
        end_of_data: opts.end_of_data,
        state: if opts.start_playing {
            PlayState::Playing
        } else {
            PlayState::Stopped
        },
        advanced: 0,
    };
    let mut ticker = time::interval(opts.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(state = ?player.state, frame = ?player.frame(), "player started");

    loop {
        player.sync().await;
        if opts.max_frames.is_some_and(|max| player.advanced >= max) {
            info!(advanced = player.advanced, "frame limit reached; shutting down");
            cancel.cancel();
            break;
        }

        select! {
            _ = cancel.cancelled() => break,

            Some(cmd) = commands.recv() => player.handle(cmd),

            Some(FramesChanged { added }) = frames.recv() => {
                debug!(added, "dataset files changed");
                let retried = player.cache.retry_failed();
                if !retried.is_empty() {
                    debug!(retried = retried.len(), "rebuilding failed images");
                }
                if added > 0 && player.state == PlayState::Waiting {
                    player.state = PlayState::Playing;
                }
            }

            _ = ticker.tick(), if player.state == PlayState::Playing => {
                if player.cache.settled() {
                    player.advance();
                } else {
                    debug!(frame = ?player.frame(), "previous frame still building");
                }
            }
        }
    }

    Ok(())
}
