use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::dataset::{RawFrameStore, VARIABLE_EXT};
use crate::events::FramesChanged;

/// Fallback rescan for filesystems (or races) that miss notifications.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Watch the dataset roots of a running simulation and rescan them when
/// variable files are written.
///
/// Every burst of variable-file writes is announced, even when it only adds
/// a variable to a known frame, so failed builds get another chance. The
/// periodic rescan only announces new frames.
#[instrument(skip_all, fields(stores = stores.len()))]
pub async fn run(
    stores: Vec<Arc<RawFrameStore>>,
    to_player: Sender<FramesChanged>,
    cancel: CancellationToken,
) -> Result<()> {
    // Bridge notify callback -> async channel
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(128);
    let mut watcher = recommended_watcher(move |res| {
        let _ = watch_tx.blocking_send(res);
    })?;
    for store in &stores {
        watcher.watch(store.root(), RecursiveMode::Recursive)?;
        info!(watching = %store.root().display(), "notify watcher initialized (recursive)");
    }

    let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
    rescan.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancel received; exiting watch task");
                break;
            }

            Some(res) = watch_rx.recv() => {
                let mut relevant = is_relevant(&res);
                // coalesce a burst of writes into one rescan
                while let Ok(more) = watch_rx.try_recv() {
                    relevant |= is_relevant(&more);
                }
                if relevant && !announce(&stores, &to_player, true).await {
                    break;
                }
            }

            _ = rescan.tick() => {
                if !announce(&stores, &to_player, false).await {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Rescan every store; returns `false` once the player is gone.
async fn announce(stores: &[Arc<RawFrameStore>], to_player: &Sender<FramesChanged>, written: bool) -> bool {
    let added: usize = stores.iter().map(|s| s.refresh()).sum();
    if added == 0 && !written {
        return true;
    }
    if added > 0 {
        info!(added, "new frames discovered");
    } else {
        debug!("variable files updated");
    }
    if to_player.send(FramesChanged { added }).await.is_err() {
        debug!("player gone; stopping watcher");
        return false;
    }
    true
}

fn is_relevant(res: &notify::Result<Event>) -> bool {
    match res {
        Ok(event) => {
            debug!(kind = ?event.kind, paths = ?event.paths, "notify event");
            matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event
                .paths
                .iter()
                .any(|p| p.extension().and_then(OsStr::to_str) == Some(VARIABLE_EXT))
        }
        Err(err) => {
            error!("watch error: {err}");
            false
        }
    }
}
