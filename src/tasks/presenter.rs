use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::select;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::cache::{ImagePair, TextureCache};
use crate::events::{Evicted, Presented};

#[derive(Debug)]
struct Texture {
    handle: u64,
    // held so the address key stays unique while the handle is live
    pair: Arc<ImagePair>,
}

/// Texture handles for uploaded pairs, keyed by pair identity.
///
/// A descriptor that is evicted and rebuilt comes back as a new pair and gets
/// a new handle; releasing the old pair never touches it.
#[derive(Debug, Default)]
pub struct TextureTable {
    next_handle: u64,
    live: HashMap<usize, Texture>,
    uploaded_bytes: usize,
}

fn key(pair: &Arc<ImagePair>) -> usize {
    Arc::as_ptr(pair) as usize
}

fn byte_len(pair: &ImagePair) -> usize {
    pair.surface().as_raw().len() + pair.legend().as_raw().len()
}

impl TextureTable {
    /// Handle for `pair`, uploading it on first sight. The placeholder has no handle.
    pub fn upload(&mut self, pair: &Arc<ImagePair>) -> Option<u64> {
        let desc = pair.descriptor()?;
        if let Some(texture) = self.live.get(&key(pair)) {
            return Some(texture.handle);
        }
        self.next_handle += 1;
        let handle = self.next_handle;
        let bytes = byte_len(pair);
        self.uploaded_bytes += bytes;
        trace!(%desc, handle, bytes, "uploaded textures");
        self.live.insert(
            key(pair),
            Texture {
                handle,
                pair: Arc::clone(pair),
            },
        );
        Some(handle)
    }

    /// Drop the handle for `pair`. Returns whether one was live.
    pub fn release(&mut self, pair: &Arc<ImagePair>) -> bool {
        if pair.is_placeholder() {
            error!("placeholder handed in for release");
            return false;
        }
        match self.live.remove(&key(pair)) {
            Some(texture) => {
                self.uploaded_bytes = self.uploaded_bytes.saturating_sub(byte_len(&texture.pair));
                trace!(desc = ?pair.descriptor().map(ToString::to_string), handle = texture.handle, "released textures");
                true
            }
            None => false,
        }
    }

    pub fn live(&self) -> usize {
        self.live.len()
    }

    pub fn uploaded_bytes(&self) -> usize {
        self.uploaded_bytes
    }
}

/// Headless stand-in for the render loop: polls every slot once per display
/// tick, uploads pairs it has not seen and releases evicted ones.
#[instrument(skip_all, fields(slots = cache.slot_count()))]
pub async fn run(
    cache: Arc<TextureCache>,
    mut evicted: Receiver<Evicted>,
    presented: Option<Sender<Presented>>,
    display_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut textures = TextureTable::default();
    let mut shown: Vec<Option<Arc<ImagePair>>> = vec![None; cache.slot_count()];
    let mut ticker = time::interval(display_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            _ = cancel.cancelled() => break,

            Some(Evicted(pairs)) = evicted.recv() => {
                let released = pairs.iter().filter(|p| textures.release(p)).count();
                debug!(evicted = pairs.len(), released, live = textures.live(), "released evicted images");
            }

            _ = ticker.tick() => {
                for (slot, current) in shown.iter_mut().enumerate() {
                    let pair = cache.get_images(slot);
                    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &pair)) {
                        continue;
                    }
                    let handle = textures.upload(&pair);
                    debug!(slot, handle, desc = ?pair.descriptor().map(ToString::to_string), "slot updated");
                    if let Some(tx) = &presented {
                        let event = Presented {
                            slot,
                            descriptor: pair.descriptor().cloned(),
                        };
                        if tx.send(event).await.is_err() {
                            trace!("presentation listener gone");
                        }
                    }
                    *current = Some(pair);
                }
            }
        }
    }

    // Late evictions still need releasing.
    evicted.close();
    while let Ok(Evicted(pairs)) = evicted.try_recv() {
        for pair in &pairs {
            textures.release(pair);
        }
    }
    info!(live = textures.live(), bytes = textures.uploaded_bytes(), "presenter stopped");
    Ok(())
}
