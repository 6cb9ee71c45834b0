//! Slot-aware cache of built image pairs.
//!
//! Each slot keeps a two-generation window (`previous`, `current`) of the
//! descriptors it asked for. Everything cached must be referenced by some
//! window; anything else is evicted and handed back to the caller, who owns
//! the release of the matching GPU resources. Builds are submitted through a
//! [`BuildQueue`] and come back through [`ImageSink`], possibly long after the
//! slot has moved on.
//!
//! All state sits behind one short-held lock. Nothing in here blocks on I/O,
//! pixel work or the render thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::colormap::{LEGEND_HEIGHT, LEGEND_WIDTH};
use crate::descriptor::Descriptor;

/// Where the cache sends descriptors that need building.
pub trait BuildQueue: Send + Sync {
    /// Enqueue a build. Must not block.
    fn submit(&self, desc: Descriptor);
}

/// Where finished (or failed) builds report back.
pub trait ImageSink: Send + Sync {
    /// Hand over the pixels built for `desc`. Returns whether they were kept.
    fn store(&self, desc: Descriptor, surface: RgbaImage, legend: RgbaImage) -> bool;

    /// The build for `desc` gave up.
    fn abandon(&self, desc: &Descriptor, reason: &str);
}

/// Surface and legend pixels built for one descriptor.
#[derive(Debug)]
pub struct ImagePair {
    descriptor: Option<Descriptor>,
    surface: RgbaImage,
    legend: RgbaImage,
}

impl ImagePair {
    fn placeholder(width: u32, height: u32) -> Self {
        Self {
            descriptor: None,
            surface: RgbaImage::new(width, height),
            legend: RgbaImage::new(LEGEND_WIDTH, LEGEND_HEIGHT),
        }
    }

    /// `None` for the blank placeholder.
    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    pub fn legend(&self) -> &RgbaImage {
        &self.legend
    }

    pub fn is_placeholder(&self) -> bool {
        self.descriptor.is_none()
    }
}

/// Where a descriptor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unrequested,
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotWindow {
    pub previous: Option<Descriptor>,
    pub current: Option<Descriptor>,
}

impl SlotWindow {
    fn references(&self, desc: &Descriptor) -> bool {
        self.previous.as_ref() == Some(desc) || self.current.as_ref() == Some(desc)
    }
}

/// Point-in-time copy of the cache bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub slots: Vec<SlotWindow>,
    pub ready: Vec<Descriptor>,
    pub pending: Vec<Descriptor>,
    pub failed: Vec<Descriptor>,
}

impl CacheSnapshot {
    /// Cached descriptors no slot references. Always empty after a request.
    pub fn orphans(&self) -> Vec<&Descriptor> {
        self.ready
            .iter()
            .filter(|d| !self.slots.iter().any(|s| s.references(d)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    slots: Vec<SlotWindow>,
    ready: HashMap<Descriptor, Arc<ImagePair>>,
    pending: HashSet<Descriptor>,
    failed: HashSet<Descriptor>,
}

impl CacheState {
    fn is_used(&self, desc: &Descriptor) -> bool {
        self.slots.iter().any(|s| s.references(desc))
    }

    fn used_set(&self) -> HashSet<Descriptor> {
        self.slots
            .iter()
            .flat_map(|s| s.previous.iter().chain(s.current.iter()))
            .cloned()
            .collect()
    }

    fn entry_state(&self, desc: &Descriptor) -> EntryState {
        if self.ready.contains_key(desc) {
            EntryState::Ready
        } else if self.pending.contains(desc) {
            EntryState::Pending
        } else if self.failed.contains(desc) {
            EntryState::Failed
        } else {
            EntryState::Unrequested
        }
    }

    /// Drop everything outside the used set; returns the evicted pairs.
    fn evict_unused(&mut self) -> Vec<Arc<ImagePair>> {
        let used = self.used_set();
        let stale: Vec<Descriptor> = self
            .ready
            .keys()
            .filter(|d| !used.contains(*d))
            .cloned()
            .collect();
        self.failed.retain(|d| used.contains(d));
        stale
            .iter()
            .filter_map(|d| self.ready.remove(d))
            .collect()
    }
}

pub struct TextureCache {
    state: Mutex<CacheState>,
    surface_size: (u32, u32),
    placeholder: Arc<ImagePair>,
    queue: Box<dyn BuildQueue>,
}

impl TextureCache {
    /// `surface_size` is the `(width, height)` every stored surface must have.
    pub fn new(slots: usize, surface_size: (u32, u32), queue: Box<dyn BuildQueue>) -> Self {
        let (width, height) = surface_size;
        debug!(slots, width, height, "texture cache initialized");
        Self {
            state: Mutex::new(CacheState {
                slots: vec![SlotWindow::default(); slots],
                ..CacheState::default()
            }),
            surface_size,
            placeholder: Arc::new(ImagePair::placeholder(width, height)),
            queue,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    /// Blank pair returned while nothing is ready.
    pub fn placeholder(&self) -> Arc<ImagePair> {
        Arc::clone(&self.placeholder)
    }

    /// Make `desc` the newest wanted configuration for `slot`.
    ///
    /// Returns the pairs that no slot references anymore; the caller must
    /// release each of them exactly once. Asking again for a descriptor whose
    /// build failed resubmits it.
    pub fn request_new_configuration(&self, slot: usize, desc: Descriptor) -> Vec<Arc<ImagePair>> {
        if !desc.is_consistent() {
            error!(slot, %desc, "configuration request with inconsistent descriptor");
        }

        let (evicted, submit) = {
            let mut state = self.state.lock();
            let slot_count = state.slots.len();
            let Some(window) = state.slots.get_mut(slot) else {
                error!(slot, slots = slot_count, "configuration request for slot out of range");
                return Vec::new();
            };
            let evicted = if window.current.as_ref() == Some(&desc) {
                trace!(slot, %desc, "repeat request");
                Vec::new()
            } else {
                window.previous = window.current.take();
                window.current = Some(desc.clone());
                state.evict_unused()
            };

            let submit = match state.entry_state(&desc) {
                EntryState::Unrequested => true,
                EntryState::Failed => {
                    debug!(slot, %desc, "retrying failed build");
                    state.failed.remove(&desc);
                    true
                }
                EntryState::Pending | EntryState::Ready => false,
            };
            if submit {
                state.pending.insert(desc.clone());
            }
            (evicted, submit)
        };

        if !evicted.is_empty() {
            debug!(slot, evicted = evicted.len(), "released unreferenced image pairs");
        }
        if submit {
            debug!(slot, %desc, "submitting build");
            self.queue.submit(desc);
        }
        evicted
    }

    /// Resubmit every slot's current descriptor whose build failed, e.g. after
    /// new data arrived. Returns the resubmitted descriptors.
    pub fn retry_failed(&self) -> Vec<Descriptor> {
        let retry: Vec<Descriptor> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let retry: Vec<Descriptor> = state
                .failed
                .iter()
                .filter(|d| state.slots.iter().any(|s| s.current.as_ref() == Some(*d)))
                .cloned()
                .collect();
            for desc in &retry {
                state.failed.remove(desc);
                state.pending.insert(desc.clone());
            }
            retry
        };
        for desc in &retry {
            debug!(%desc, "retrying failed build");
            self.queue.submit(desc.clone());
        }
        retry
    }

    /// Best displayable pair for `slot`: current, else previous, else blank.
    pub fn get_images(&self, slot: usize) -> Arc<ImagePair> {
        let state = self.state.lock();
        let Some(window) = state.slots.get(slot) else {
            error!(slot, slots = state.slots.len(), "image request for slot out of range");
            return self.placeholder();
        };
        window
            .current
            .iter()
            .chain(window.previous.iter())
            .find_map(|d| state.ready.get(d))
            .cloned()
            .unwrap_or_else(|| self.placeholder())
    }

    /// Whether `desc` is some slot's newest request.
    pub fn is_requested(&self, desc: &Descriptor) -> bool {
        self.state
            .lock()
            .slots
            .iter()
            .any(|s| s.current.as_ref() == Some(desc))
    }

    /// Every slot's newest request has its images ready.
    pub fn done_with_last_request(&self) -> bool {
        let state = self.state.lock();
        state.slots.iter().all(|s| {
            s.current
                .as_ref()
                .is_some_and(|d| state.ready.contains_key(d))
        })
    }

    /// Every slot's newest request is ready or has failed; nothing is still
    /// being built for the current generation.
    pub fn settled(&self) -> bool {
        let state = self.state.lock();
        state.slots.iter().all(|s| {
            s.current.as_ref().is_some_and(|d| {
                matches!(state.entry_state(d), EntryState::Ready | EntryState::Failed)
            })
        })
    }

    pub fn entry_state(&self, desc: &Descriptor) -> EntryState {
        self.state.lock().entry_state(desc)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.state.lock();
        CacheSnapshot {
            slots: state.slots.clone(),
            ready: state.ready.keys().cloned().collect(),
            pending: state.pending.iter().cloned().collect(),
            failed: state.failed.iter().cloned().collect(),
        }
    }

    /// Remove every cached pair, e.g. at shutdown, so each can be released.
    pub fn drain(&self) -> Vec<Arc<ImagePair>> {
        let mut state = self.state.lock();
        state.failed.clear();
        state.ready.drain().map(|(_, pair)| pair).collect()
    }
}

impl ImageSink for TextureCache {
    fn store(&self, desc: Descriptor, surface: RgbaImage, legend: RgbaImage) -> bool {
        if surface.dimensions() != self.surface_size
            || legend.dimensions() != (LEGEND_WIDTH, LEGEND_HEIGHT)
        {
            error!(
                %desc,
                surface = ?surface.dimensions(),
                legend = ?legend.dimensions(),
                expected = ?self.surface_size,
                "rejecting image pair with unexpected dimensions"
            );
            let mut state = self.state.lock();
            state.pending.remove(&desc);
            if state.is_used(&desc) {
                state.failed.insert(desc);
            }
            return false;
        }

        let mut state = self.state.lock();
        state.pending.remove(&desc);
        if !state.is_used(&desc) {
            debug!(%desc, "discarding images for superseded configuration");
            return false;
        }
        if state.ready.contains_key(&desc) {
            warn!(%desc, "images already cached; keeping existing pair");
            return false;
        }
        state.failed.remove(&desc);
        let pair = ImagePair {
            descriptor: Some(desc.clone()),
            surface,
            legend,
        };
        state.ready.insert(desc, Arc::new(pair));
        true
    }

    fn abandon(&self, desc: &Descriptor, reason: &str) {
        let mut state = self.state.lock();
        state.pending.remove(desc);
        if state.is_used(desc) {
            warn!(%desc, reason, "build abandoned; slot keeps its last images");
            state.failed.insert(desc.clone());
        } else {
            debug!(%desc, reason, "build abandoned for superseded configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Bounds, DataMode};

    const SIZE: (u32, u32) = (4, 2);

    #[derive(Clone, Default)]
    struct RecordingQueue(Arc<Mutex<Vec<Descriptor>>>);

    impl RecordingQueue {
        fn submitted(&self) -> Vec<Descriptor> {
            self.0.lock().clone()
        }

        fn count(&self, desc: &Descriptor) -> usize {
            self.0.lock().iter().filter(|d| *d == desc).count()
        }
    }

    impl BuildQueue for RecordingQueue {
        fn submit(&self, desc: Descriptor) {
            self.0.lock().push(desc);
        }
    }

    fn cache(slots: usize) -> (TextureCache, RecordingQueue) {
        let queue = RecordingQueue::default();
        (TextureCache::new(slots, SIZE, Box::new(queue.clone())), queue)
    }

    fn temp(frame: u32) -> Descriptor {
        Descriptor::new(
            frame,
            0,
            "TEMP",
            "rainbow",
            DataMode::Primary,
            false,
            Bounds::new(-2.0, 30.0),
        )
    }

    fn build(cache: &TextureCache, desc: &Descriptor) -> bool {
        cache.store(
            desc.clone(),
            RgbaImage::from_pixel(SIZE.0, SIZE.1, image::Rgba([desc.frame() as u8, 0, 0, 255])),
            RgbaImage::new(LEGEND_WIDTH, LEGEND_HEIGHT),
        )
    }

    fn frames(pairs: &[Arc<ImagePair>]) -> Vec<u32> {
        let mut out: Vec<u32> = pairs
            .iter()
            .filter_map(|p| p.descriptor().map(Descriptor::frame))
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn equal_descriptors_are_built_once() {
        let (cache, queue) = cache(2);
        let a = temp(10);
        cache.request_new_configuration(0, a.clone());
        cache.request_new_configuration(1, temp(10));
        cache.request_new_configuration(0, temp(11));
        cache.request_new_configuration(0, temp(10));
        assert_eq!(queue.count(&a), 1);

        assert!(build(&cache, &a));
        cache.request_new_configuration(1, temp(12));
        cache.request_new_configuration(1, temp(10));
        assert_eq!(queue.count(&a), 1, "cached descriptors are not rebuilt");
    }

    #[test]
    fn repeat_request_is_a_no_op() {
        let (cache, queue) = cache(1);
        let x = temp(1);
        let a = temp(2);
        cache.request_new_configuration(0, x.clone());
        build(&cache, &x);

        assert!(cache.request_new_configuration(0, a.clone()).is_empty());
        assert!(cache.request_new_configuration(0, a.clone()).is_empty());
        assert_eq!(queue.submitted(), vec![x.clone(), a]);
        assert_eq!(cache.entry_state(&x), EntryState::Ready, "previous stays cached");
    }

    #[test]
    fn placeholder_until_something_is_ready() {
        let (cache, _) = cache(2);
        let blank = cache.get_images(0);
        assert!(blank.is_placeholder());
        assert_eq!(blank.surface().dimensions(), SIZE);
        assert_eq!(blank.legend().dimensions(), (LEGEND_WIDTH, LEGEND_HEIGHT));
        assert!(blank.surface().as_raw().iter().all(|b| *b == 0));

        cache.request_new_configuration(0, temp(1));
        assert!(cache.get_images(0).is_placeholder());
        assert!(cache.get_images(7).is_placeholder(), "out of range slot");
    }

    #[test]
    fn falls_back_to_previous_while_current_builds() {
        let (cache, _) = cache(1);
        let a = temp(1);
        let b = temp(2);
        cache.request_new_configuration(0, a.clone());
        build(&cache, &a);
        cache.request_new_configuration(0, b.clone());

        assert_eq!(cache.get_images(0).descriptor(), Some(&a));
        build(&cache, &b);
        assert_eq!(cache.get_images(0).descriptor(), Some(&b));
    }

    #[test]
    fn superseded_build_result_lands_as_previous() {
        // slot 0: A requested, then B before A completes, then C
        let (cache, queue) = cache(1);
        let a = temp(10);
        let b = temp(11);
        let c = temp(12);

        assert!(cache.request_new_configuration(0, a.clone()).is_empty());
        assert!(cache.request_new_configuration(0, b.clone()).is_empty());
        assert!(build(&cache, &a));
        assert!(build(&cache, &b));
        assert_eq!(queue.submitted(), vec![a.clone(), b.clone()]);
        assert_eq!(cache.get_images(0).descriptor(), Some(&b));

        let evicted = cache.request_new_configuration(0, c.clone());
        assert_eq!(frames(&evicted), vec![10]);
        assert_eq!(cache.get_images(0).descriptor(), Some(&b));
    }

    #[test]
    fn store_discards_unreferenced_results() {
        let (cache, _) = cache(1);
        let a = temp(1);
        cache.request_new_configuration(0, a.clone());
        cache.request_new_configuration(0, temp(2));
        cache.request_new_configuration(0, temp(3));

        assert!(!build(&cache, &a));
        let snap = cache.snapshot();
        assert!(!snap.ready.contains(&a));
        assert!(!snap.pending.contains(&a));
    }

    #[test]
    fn store_rejects_wrong_dimensions() {
        let (cache, _) = cache(1);
        let a = temp(1);
        cache.request_new_configuration(0, a.clone());
        let kept = cache.store(
            a.clone(),
            RgbaImage::new(SIZE.0 + 1, SIZE.1),
            RgbaImage::new(LEGEND_WIDTH, LEGEND_HEIGHT),
        );
        assert!(!kept);
        assert!(cache.get_images(0).is_placeholder());
        assert_eq!(cache.entry_state(&a), EntryState::Failed);
    }

    #[test]
    fn done_only_when_every_current_is_ready() {
        let (cache, _) = cache(2);
        assert!(!cache.done_with_last_request(), "unrequested slots are not done");

        let a = temp(1);
        let b = temp(2).with_variable("SALT");
        cache.request_new_configuration(0, a.clone());
        cache.request_new_configuration(1, b.clone());
        assert!(!cache.done_with_last_request());

        build(&cache, &a);
        assert!(!cache.done_with_last_request());
        build(&cache, &b);
        assert!(cache.done_with_last_request());

        cache.request_new_configuration(1, temp(3));
        assert!(!cache.done_with_last_request());
    }

    #[test]
    fn is_requested_only_matches_current() {
        let (cache, _) = cache(1);
        cache.request_new_configuration(0, temp(1));
        cache.request_new_configuration(0, temp(2));
        assert!(cache.is_requested(&temp(2)));
        assert!(!cache.is_requested(&temp(1)));
    }

    #[test]
    fn failed_builds_wait_for_an_explicit_request() {
        let (cache, queue) = cache(1);
        let a = temp(1);
        cache.request_new_configuration(0, a.clone());
        cache.abandon(&a, "missing frame");

        assert_eq!(cache.entry_state(&a), EntryState::Failed);
        assert!(!cache.done_with_last_request());
        assert!(cache.settled());
        assert_eq!(queue.count(&a), 1, "no automatic retry");

        // asking again for the current descriptor rebuilds it, once
        assert!(cache.request_new_configuration(0, a.clone()).is_empty());
        assert_eq!(queue.count(&a), 2);
        assert_eq!(cache.entry_state(&a), EntryState::Pending);
        assert!(!cache.settled());
        cache.request_new_configuration(0, a.clone());
        assert_eq!(queue.count(&a), 2, "still in flight");

        assert!(build(&cache, &a));
        assert!(cache.done_with_last_request());
        assert_eq!(cache.snapshot().slots[0].previous, None, "window unchanged");
    }

    #[test]
    fn failed_previous_is_rebuilt_when_requested_again() {
        let (cache, queue) = cache(1);
        let a = temp(1);
        cache.request_new_configuration(0, a.clone());
        cache.abandon(&a, "missing frame");
        cache.request_new_configuration(0, temp(2));
        assert_eq!(cache.entry_state(&a), EntryState::Failed, "still referenced as previous");

        cache.request_new_configuration(0, a.clone());
        assert_eq!(queue.count(&a), 2);
        assert_eq!(cache.entry_state(&a), EntryState::Pending);
    }

    #[test]
    fn retry_failed_resubmits_current_failures_only() {
        let (cache, queue) = cache(3);
        let a = temp(1);
        let b = temp(2);
        let old = temp(3);
        cache.request_new_configuration(0, a.clone());
        cache.request_new_configuration(1, a.clone());
        cache.request_new_configuration(2, old.clone());
        cache.abandon(&a, "missing frame");
        cache.abandon(&old, "missing frame");
        cache.request_new_configuration(2, b.clone());
        build(&cache, &b);

        assert_eq!(cache.retry_failed(), vec![a.clone()]);
        assert_eq!(queue.count(&a), 2, "shared by two slots, submitted once");
        assert_eq!(queue.count(&old), 1, "only referenced as previous");
        assert_eq!(cache.entry_state(&old), EntryState::Failed);

        assert!(cache.retry_failed().is_empty(), "nothing failed anymore");
        assert_eq!(queue.count(&a), 2);
        assert!(build(&cache, &a));
        assert!(cache.done_with_last_request());
    }

    #[test]
    fn pending_build_is_not_duplicated_after_cycling_out() {
        let (cache, queue) = cache(1);
        let a = temp(1);
        cache.request_new_configuration(0, a.clone());
        cache.request_new_configuration(0, temp(2));
        cache.request_new_configuration(0, temp(3));
        cache.request_new_configuration(0, a.clone());
        assert_eq!(queue.count(&a), 1, "first build is still in flight");
        assert!(build(&cache, &a));
        assert_eq!(cache.get_images(0).descriptor(), Some(&a));
    }

    #[test]
    fn out_of_range_request_changes_nothing() {
        let (cache, queue) = cache(1);
        assert!(cache.request_new_configuration(3, temp(1)).is_empty());
        assert!(queue.submitted().is_empty());
        assert_eq!(cache.snapshot().slots, vec![SlotWindow::default()]);
    }

    #[test]
    fn every_stored_pair_is_evicted_exactly_once_or_still_referenced() {
        let (cache, queue) = cache(3);
        let mut stored = 0usize;
        let mut released: Vec<Arc<ImagePair>> = Vec::new();

        for step in 0..60u32 {
            let slot = (step % 3) as usize;
            let desc = temp(step % 7).with_depth(step % 2);
            released.extend(cache.request_new_configuration(slot, desc));

            // complete every other outstanding build
            for pending in queue.submitted().iter().skip(step as usize % 2) {
                if cache.entry_state(pending) == EntryState::Pending && build(&cache, pending) {
                    stored += 1;
                }
            }

            let snap = cache.snapshot();
            assert!(snap.orphans().is_empty(), "orphans after step {step}");
            assert_eq!(snap.ready.len() + released.len(), stored);
        }

        let mut seen = HashSet::new();
        for pair in &released {
            assert!(seen.insert(Arc::as_ptr(pair)), "pair released twice");
        }
        let rest = cache.drain();
        assert_eq!(rest.len() + released.len(), stored);
        assert!(cache.snapshot().ready.is_empty());
    }
}
