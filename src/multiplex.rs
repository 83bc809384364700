//! Slot assignment for one display.
//!
//! A `DisplayMultiplexer` decides which source occupies which slot. Two
//! topologies:
//!
//! - `Single`: one slot showing `sources[index]`; rotation advances the index.
//! - `Grid`: a fixed number of slots showing one page (a contiguous window of
//!   the ordered source list); rotation advances the page and rebuilds every
//!   slot from it.
//!
//! Each multiplexer owns an assigned set. It always equals the set of
//! non-empty slot sources, so no source ever occupies two slots of the same
//! display. Other displays keep their own sets.
//!
//! When a slot's source has no healthy frame at render time, the slot is
//! reassigned to the first source not already on screen. Replacements are not
//! health-checked; a bad replacement simply fails again on a later tick.

use anyhow::{anyhow, Result};
use std::collections::HashSet;

use crate::frame::Frame;
use crate::registry::{FrameLookup, FrameProvider, SourceId};

pub const DEFAULT_GRID_SIZE: usize = 4;
pub const DEFAULT_MAX_GRID_SOURCES: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Single,
    Grid { slots: usize },
}

impl Topology {
    pub fn grid() -> Self {
        Topology::Grid {
            slots: DEFAULT_GRID_SIZE,
        }
    }

    pub fn slot_count(&self) -> usize {
        match self {
            Topology::Single => 1,
            Topology::Grid { slots } => *slots,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Topology::Single => "single",
            Topology::Grid { .. } => "grid",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Assigned,
    /// Page has no source for this position.
    Empty,
    /// Reassignment found no free source.
    Unavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub source: Option<SourceId>,
    pub state: SlotState,
}

impl Slot {
    fn empty(index: usize) -> Self {
        Self {
            index,
            source: None,
            state: SlotState::Empty,
        }
    }

    fn assigned(index: usize, source: SourceId) -> Self {
        Self {
            index,
            source: Some(source),
            state: SlotState::Assigned,
        }
    }
}

/// What a slot shows instead of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    /// Display has no sources at all.
    NoSources,
    /// Grid position beyond the end of the page.
    Empty,
    /// Freshly reassigned; shown from the next tick.
    Loading,
    /// No free source to reassign to.
    Unavailable,
    /// No supervisor exists for the source.
    NotFound,
}

#[derive(Clone, Debug)]
pub enum SlotContent {
    Frame(Frame),
    Placeholder(Placeholder),
}

/// One slot's content for one render tick.
#[derive(Clone, Debug)]
pub struct SlotFrame {
    pub slot: usize,
    pub source: Option<SourceId>,
    pub content: SlotContent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reassignment {
    Reassigned(SourceId),
    Unavailable,
}

pub struct DisplayMultiplexer {
    topology: Topology,
    sources: Vec<SourceId>,
    max_grid_sources: usize,
    slots: Vec<Slot>,
    assigned: HashSet<SourceId>,
    index: usize,
    page: usize,
}

impl DisplayMultiplexer {
    pub fn new(topology: Topology, sources: Vec<SourceId>, max_grid_sources: usize) -> Result<Self> {
        if topology.slot_count() == 0 {
            return Err(anyhow!("grid topology needs at least one slot"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = sources.iter().find(|id| !seen.insert(**id)) {
            return Err(anyhow!("source {} listed twice", dup));
        }
        if matches!(topology, Topology::Grid { .. }) && sources.len() > max_grid_sources {
            return Err(anyhow!(
                "grid accepts at most {} sources, got {}",
                max_grid_sources,
                sources.len()
            ));
        }

        let mut multiplexer = Self {
            topology,
            sources,
            max_grid_sources,
            slots: (0..topology.slot_count()).map(Slot::empty).collect(),
            assigned: HashSet::new(),
            index: 0,
            page: 0,
        };
        multiplexer.relayout();
        Ok(multiplexer)
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    /// Current slot to source mapping, in slot order.
    pub fn render_plan(&self) -> &[Slot] {
        &self.slots
    }

    pub fn assigned(&self) -> &HashSet<SourceId> {
        &self.assigned
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn page(&self) -> usize {
        self.page
    }

    /// `ceil(sources / slots)`; 1 in single mode with any sources.
    pub fn total_pages(&self) -> usize {
        match self.topology {
            Topology::Single => usize::from(!self.sources.is_empty()),
            Topology::Grid { slots } => self.sources.len().div_ceil(slots),
        }
    }

    /// Advance by one index (single) or one page (grid), then rebuild slots.
    pub fn rotate(&mut self) {
        if self.sources.is_empty() {
            return;
        }
        match self.topology {
            Topology::Single => self.index = (self.index + 1) % self.sources.len(),
            Topology::Grid { .. } => self.page = (self.page + 1) % self.total_pages(),
        }
        self.relayout();
        log::debug!(
            "{} display rotated: index {} page {}",
            self.topology.name(),
            self.index,
            self.page
        );
    }

    /// Rebuild every slot from the current index or page.
    pub fn relayout(&mut self) {
        self.assigned.clear();
        match self.topology {
            Topology::Single => {
                self.slots[0] = match self.sources.get(self.index) {
                    Some(&id) => {
                        self.assigned.insert(id);
                        Slot::assigned(0, id)
                    }
                    None => Slot::empty(0),
                };
            }
            Topology::Grid { slots } => {
                let start = self.page * slots;
                for position in 0..slots {
                    self.slots[position] = match self.sources.get(start + position) {
                        Some(&id) => {
                            self.assigned.insert(id);
                            Slot::assigned(position, id)
                        }
                        None => Slot::empty(position),
                    };
                }
            }
        }
    }

    /// Append a source. In grid mode it joins the current page if that page
    /// has room.
    pub fn add_source(&mut self, id: SourceId) -> Result<()> {
        if self.sources.contains(&id) {
            return Err(anyhow!("source {} already on this display", id));
        }
        if let Topology::Grid { slots } = self.topology {
            if self.sources.len() >= self.max_grid_sources {
                return Err(anyhow!(
                    "grid accepts at most {} sources",
                    self.max_grid_sources
                ));
            }
            let position = self.sources.len();
            self.sources.push(id);
            if position / slots == self.page && self.slots[position % slots].state == SlotState::Empty {
                self.slots[position % slots] = Slot::assigned(position % slots, id);
                self.assigned.insert(id);
            }
            return Ok(());
        }
        self.sources.push(id);
        if self.sources.len() == 1 {
            self.relayout();
        }
        Ok(())
    }

    /// Drop a source from the list and relayout. Returns false if it was not
    /// on this display.
    pub fn remove_source(&mut self, id: SourceId) -> bool {
        let Some(position) = self.sources.iter().position(|s| *s == id) else {
            return false;
        };
        self.sources.remove(position);

        match self.topology {
            Topology::Single => {
                if position < self.index {
                    self.index -= 1;
                }
                if self.index >= self.sources.len() {
                    self.index = 0;
                }
            }
            Topology::Grid { .. } => {
                let pages = self.total_pages();
                if self.page >= pages {
                    self.page = pages.saturating_sub(1);
                }
            }
        }
        self.relayout();
        true
    }

    /// Replace the failed source in `slot`.
    ///
    /// Single mode scans forward from the current index, wrapping; grid mode
    /// scans the whole list from the start. Either way the first source that is
    /// neither on screen nor the failed one wins.
    pub fn handle_failure(&mut self, slot: usize) -> Reassignment {
        let Some(failed) = self.slots.get(slot).and_then(|s| s.source) else {
            return Reassignment::Unavailable;
        };
        self.assigned.remove(&failed);

        let count = self.sources.len();
        let candidate = match self.topology {
            Topology::Single => (0..count)
                .map(|k| (self.index + 1 + k) % count)
                .find(|&i| self.is_free(self.sources[i], failed)),
            Topology::Grid { .. } => (0..count).find(|&i| self.is_free(self.sources[i], failed)),
        };

        match candidate {
            Some(position) => {
                let replacement = self.sources[position];
                if self.topology == Topology::Single {
                    self.index = position;
                }
                self.slots[slot] = Slot::assigned(slot, replacement);
                self.assigned.insert(replacement);
                log::info!(
                    "slot {}: source {} failed, reassigned to {}",
                    slot,
                    failed,
                    replacement
                );
                Reassignment::Reassigned(replacement)
            }
            None => {
                match self.topology {
                    // The single slot keeps retrying the same source.
                    Topology::Single => {
                        self.assigned.insert(failed);
                        self.slots[slot].state = SlotState::Unavailable;
                    }
                    Topology::Grid { .. } => {
                        self.slots[slot] = Slot {
                            index: slot,
                            source: None,
                            state: SlotState::Unavailable,
                        };
                    }
                }
                log::warn!("slot {}: source {} failed, no free source to show", slot, failed);
                Reassignment::Unavailable
            }
        }
    }

    fn is_free(&self, candidate: SourceId, failed: SourceId) -> bool {
        candidate != failed && !self.assigned.contains(&candidate)
    }

    /// Grid slot left unavailable earlier: take the first free source, if any.
    fn refill(&mut self, slot: usize) -> Option<SourceId> {
        let id = self
            .sources
            .iter()
            .copied()
            .find(|id| !self.assigned.contains(id))?;
        self.slots[slot] = Slot::assigned(slot, id);
        self.assigned.insert(id);
        log::info!("slot {}: refilled with source {}", slot, id);
        Some(id)
    }

    /// One render pass: fetch every slot's frame, reassigning failed slots.
    pub fn render(&mut self, provider: &impl FrameProvider) -> Vec<SlotFrame> {
        if self.sources.is_empty() {
            return (0..self.slots.len())
                .map(|slot| SlotFrame {
                    slot,
                    source: None,
                    content: SlotContent::Placeholder(Placeholder::NoSources),
                })
                .collect();
        }

        let mut out = Vec::with_capacity(self.slots.len());
        for slot in 0..self.slots.len() {
            let current = self.slots[slot];
            let source = match (current.state, current.source) {
                (SlotState::Empty, _) => None,
                (SlotState::Unavailable, None) => self.refill(slot),
                (_, source) => source,
            };
            let Some(source) = source else {
                let placeholder = if current.state == SlotState::Empty {
                    Placeholder::Empty
                } else {
                    Placeholder::Unavailable
                };
                out.push(SlotFrame {
                    slot,
                    source: None,
                    content: SlotContent::Placeholder(placeholder),
                });
                continue;
            };

            let frame = match provider.lookup(source) {
                FrameLookup::Ready(frame) => {
                    self.slots[slot].state = SlotState::Assigned;
                    SlotFrame {
                        slot,
                        source: Some(source),
                        content: SlotContent::Frame(frame),
                    }
                }
                FrameLookup::Unknown => SlotFrame {
                    slot,
                    source: Some(source),
                    content: SlotContent::Placeholder(Placeholder::NotFound),
                },
                FrameLookup::NotReady => match self.handle_failure(slot) {
                    Reassignment::Reassigned(replacement) => SlotFrame {
                        slot,
                        source: Some(replacement),
                        content: SlotContent::Placeholder(Placeholder::Loading),
                    },
                    Reassignment::Unavailable => SlotFrame {
                        slot,
                        source: self.slots[slot].source,
                        content: SlotContent::Placeholder(Placeholder::Unavailable),
                    },
                },
            };
            out.push(frame);
        }
        out
    }
}
