//! What every screen slot is asked to show.
//!
//! Each slot holds its current [`Descriptor`]; setters derive a new one with a
//! single field changed and flag the settings as changed, so the player knows
//! to push fresh requests into the cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bounds_cache::BoundsCache;
use crate::cache::{ImagePair, TextureCache};
use crate::config::{Configuration, VariableDefaults};
use crate::descriptor::{Bounds, DataMode, Descriptor};

#[derive(Debug)]
pub struct Settings {
    slots: Vec<Descriptor>,
    variables: BTreeMap<String, VariableDefaults>,
    depth_levels: u32,
    bounds_cache: Option<BoundsCache>,
    changed: bool,
}

impl Settings {
    /// Slot descriptors at `frame`, with per-variable defaults taken from the
    /// configuration and overlaid with `bounds_cache`.
    pub fn from_config(cfg: &Configuration, frame: u32, bounds_cache: Option<BoundsCache>) -> Self {
        let mut variables = BTreeMap::new();
        let mut slots = Vec::with_capacity(cfg.slots.len());
        for slot in &cfg.slots {
            let defaults = variables.entry(slot.variable.clone()).or_insert_with(|| {
                let mut defaults = cfg.variable(&slot.variable);
                if let Some(cache) = &bounds_cache {
                    cache.apply(&slot.variable, &mut defaults);
                }
                defaults
            });
            slots.push(Descriptor::new(
                frame,
                cfg.initial_depth,
                slot.variable.clone(),
                slot.colormap.clone().unwrap_or_else(|| defaults.colormap.clone()),
                slot.mode,
                slot.log_scale.unwrap_or(defaults.log_scale),
                defaults.bounds(slot.mode),
            ));
        }
        Self {
            slots,
            variables,
            depth_levels: cfg.grid.depth_levels,
            bounds_cache,
            changed: true,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn descriptor(&self, slot: usize) -> Option<&Descriptor> {
        self.slots.get(slot)
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.slots
    }

    /// Frame shown by the first slot; all slots share it.
    pub fn frame(&self) -> Option<u32> {
        self.slots.first().map(Descriptor::frame)
    }

    pub fn depth(&self) -> Option<u32> {
        self.slots.first().map(Descriptor::depth)
    }

    pub fn variable_defaults(&self, variable: &str) -> VariableDefaults {
        self.variables.get(variable).cloned().unwrap_or_default()
    }

    /// Whether anything changed since the last call.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Mark the settings changed without altering them.
    pub fn touch(&mut self) {
        self.changed = true;
    }

    pub fn set_frame(&mut self, frame: u32) {
        for slot in 0..self.slots.len() {
            self.update(slot, |d| d.with_frame(frame));
        }
    }

    pub fn set_depth(&mut self, depth: u32) -> bool {
        if depth >= self.depth_levels {
            warn!(depth, levels = self.depth_levels, "depth out of range");
            return false;
        }
        for slot in 0..self.slots.len() {
            self.update(slot, |d| d.with_depth(depth));
        }
        true
    }

    /// Switch a slot to `variable`, picking up that variable's defaults.
    pub fn set_variable(&mut self, slot: usize, variable: &str) -> bool {
        let defaults = self.variable_defaults(variable);
        self.update(slot, |d| {
            d.with_variable(variable)
                .with_colormap(defaults.colormap.clone())
                .with_log_scale(defaults.log_scale)
                .with_bounds(defaults.bounds(d.mode()))
        })
    }

    pub fn set_mode(&mut self, slot: usize, mode: DataMode) -> bool {
        let Some(variable) = self.slots.get(slot).map(|d| d.variable().to_string()) else {
            return self.update(slot, |d| d.clone());
        };
        let bounds = self.variable_defaults(&variable).bounds(mode);
        self.update(slot, |d| d.with_mode(mode).with_bounds(bounds))
    }

    /// Also becomes the variable's default colormap and is persisted.
    pub fn set_colormap(&mut self, slot: usize, colormap: &str) -> bool {
        if !self.update(slot, |d| d.with_colormap(colormap)) {
            return false;
        }
        if let Some(variable) = self.slots.get(slot).map(|d| d.variable().to_string()) {
            self.variables
                .entry(variable.clone())
                .or_default()
                .colormap = colormap.to_string();
            self.persist(&variable);
        }
        true
    }

    pub fn set_log_scale(&mut self, slot: usize, log_scale: bool) -> bool {
        self.update(slot, |d| d.with_log_scale(log_scale))
    }

    /// New bounds for the slot's variable in the slot's bounds class (value or
    /// difference). Every slot showing the same variable and class follows.
    pub fn set_bounds(&mut self, slot: usize, bounds: Bounds) -> bool {
        if !bounds.is_valid() {
            warn!(slot, %bounds, "ignoring invalid bounds");
            return false;
        }
        let Some((variable, diff)) = self
            .slots
            .get(slot)
            .map(|d| (d.variable().to_string(), d.mode() == DataMode::Difference))
        else {
            return self.update(slot, |d| d.clone());
        };

        let defaults = self.variables.entry(variable.clone()).or_default();
        if diff {
            defaults.diff_min = bounds.lower();
            defaults.diff_max = bounds.upper();
        } else {
            defaults.min = bounds.lower();
            defaults.max = bounds.upper();
        }
        for i in 0..self.slots.len() {
            let d = &self.slots[i];
            if d.variable() == variable && (d.mode() == DataMode::Difference) == diff {
                self.update(i, |d| d.with_bounds(bounds));
            }
        }
        self.persist(&variable);
        true
    }

    /// Request every slot's descriptor from `cache`; returns the pairs to release.
    pub fn request_all(&self, cache: &TextureCache) -> Vec<Arc<ImagePair>> {
        self.slots
            .iter()
            .enumerate()
            .flat_map(|(slot, desc)| cache.request_new_configuration(slot, desc.clone()))
            .collect()
    }

    fn update(&mut self, slot: usize, derive: impl FnOnce(&Descriptor) -> Descriptor) -> bool {
        let Some(current) = self.slots.get_mut(slot) else {
            warn!(slot, slots = self.slots.len(), "settings change for slot out of range");
            return false;
        };
        let next = derive(current);
        if next != *current {
            debug!(slot, from = %current, to = %next, "slot reconfigured");
            *current = next;
            self.changed = true;
        }
        true
    }

    fn persist(&mut self, variable: &str) {
        let Some(cache) = self.bounds_cache.as_mut() else {
            return;
        };
        let defaults = self.variables.get(variable).cloned().unwrap_or_default();
        if let Err(err) = cache.record(variable, &defaults) {
            warn!(variable, path = %cache.path().display(), "failed to persist bounds: {err}");
        }
    }
}
