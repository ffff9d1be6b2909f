//! Appointment trigger detection.
//!
//! An appointment becomes a response duty when its triggering event is
//! observed in a canonical block inside `[start_block, end_block]`.
//! Appointments without event topics are unconditional duties from their
//! start block. Triggering is absorbing; an appointment still watching
//! after its window closes has expired and is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::appointments::AppointmentRegistry;
use crate::cache::BlockCache;
use crate::reducer::{AnchorStateReducer, Component};
use crate::types::{Appointment, AppointmentId, Block, LogContainer};

use super::ResponderAction;

/// Trigger progress of one appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchState {
    Watching,
    Triggered { block_observed: u64 },
}

/// Aggregate anchor state of the watcher at one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherAnchorState {
    pub block_number: u64,
    pub items: BTreeMap<AppointmentId, WatchState>,
}

pub struct WatcherComponent {
    registry: Arc<AppointmentRegistry>,
}

impl WatcherComponent {
    pub fn new(registry: Arc<AppointmentRegistry>) -> Self {
        Self { registry }
    }

    /// Whether this single block triggers the appointment.
    fn triggered_in_block(appointment: &Appointment, block: &Block) -> Option<WatchState> {
        if block.number < appointment.start_block || block.number > appointment.end_block {
            return None;
        }
        match &appointment.event_topics {
            // unconditional duty: live as soon as the window opens
            None => Some(WatchState::Triggered { block_observed: appointment.start_block }),
            Some(topics) => block
                .logs()
                .iter()
                .any(|log| log.matches_topics(topics))
                .then_some(WatchState::Triggered { block_observed: block.number }),
        }
    }

    /// Scans the ancestry of `block` (down to `start_block`) for a trigger
    /// already on chain. Used when an appointment is first observed.
    fn scan_ancestry(
        appointment: &Appointment,
        block: &Block,
        cache: &BlockCache<Block>,
    ) -> WatchState {
        for ancestor in cache.ancestry(&block.hash) {
            if ancestor.number < appointment.start_block {
                break;
            }
            if let Some(triggered) = Self::triggered_in_block(appointment, ancestor.as_ref()) {
                return triggered;
            }
        }
        WatchState::Watching
    }
}

impl AnchorStateReducer<Block> for WatcherComponent {
    type State = WatcherAnchorState;

    fn initial(&self, block: &Block, cache: &BlockCache<Block>) -> Self::State {
        let mut items = BTreeMap::new();
        for appointment in self.registry.all() {
            items.insert(appointment.id, Self::scan_ancestry(&appointment, block, cache));
        }
        WatcherAnchorState { block_number: block.number, items }
    }

    fn reduce(
        &self,
        prev: &Self::State,
        block: &Block,
        cache: &BlockCache<Block>,
    ) -> Self::State {
        let mut items = BTreeMap::new();
        for appointment in self.registry.all() {
            let state = match prev.items.get(&appointment.id) {
                Some(triggered @ WatchState::Triggered { .. }) => triggered.clone(),
                Some(WatchState::Watching) => Self::triggered_in_block(&appointment, block)
                    .unwrap_or(WatchState::Watching),
                None => Self::scan_ancestry(&appointment, block, cache),
            };
            items.insert(appointment.id, state);
        }
        WatcherAnchorState { block_number: block.number, items }
    }
}

impl Component<Block> for WatcherComponent {
    type Action = ResponderAction;

    fn name(&self) -> &'static str {
        "watcher"
    }

    fn detect_changes(&self, prev: &Self::State, next: &Self::State) -> Vec<ResponderAction> {
        let mut actions = Vec::new();
        for (id, state) in &next.items {
            match state {
                WatchState::Triggered { .. } => {
                    let newly =
                        !matches!(prev.items.get(id), Some(WatchState::Triggered { .. }));
                    if newly {
                        actions.push(ResponderAction::StartResponse(*id));
                    }
                }
                WatchState::Watching => {
                    // window closed without a trigger: the duty lapses
                    if let Some(appointment) = self.registry.get(id) {
                        if next.block_number > appointment.end_block {
                            actions.push(ResponderAction::EndResponse(*id));
                        }
                    }
                }
            }
        }
        actions
    }
}
