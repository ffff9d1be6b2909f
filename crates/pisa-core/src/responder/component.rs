//! Per-appointment mined-transaction tracking.
//!
//! The responder component watches for its own transactions: an
//! appointment is `Pending` until a canonical block contains a transaction
//! that matches its identifier *and* was sent from the responder's
//! address, then `Mined` until it has sat under enough confirmations.
//! Everything here is a pure fold; the emitted actions are what make the
//! [`super::MultiResponder`] move.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::appointments::AppointmentRegistry;
use crate::cache::BlockCache;
use crate::reducer::{AnchorStateReducer, Component};
use crate::types::{
    Address, Appointment, AppointmentId, Block, ResponseIdentifier, TransactionContainer,
};

use super::ResponderAction;

/// Response progress of one appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentState {
    Pending { identifier: ResponseIdentifier },
    Mined { identifier: ResponseIdentifier, block_mined: u64, nonce: u64 },
}

/// Aggregate anchor state: every tracked appointment at one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderAnchorState {
    pub block_number: u64,
    pub items: BTreeMap<AppointmentId, AppointmentState>,
}

pub struct ResponderComponent {
    registry: Arc<AppointmentRegistry>,
    responder_address: Address,
}

impl ResponderComponent {
    pub fn new(registry: Arc<AppointmentRegistry>, responder_address: Address) -> Self {
        Self { registry, responder_address }
    }

    /// A matching transaction in this single block, if any.
    fn mined_in_block(&self, appointment: &Appointment, block: &Block) -> Option<AppointmentState> {
        block
            .transactions()
            .iter()
            .find(|tx| tx.from == self.responder_address && appointment.identifier.matches(tx))
            .map(|tx| AppointmentState::Mined {
                identifier: appointment.identifier.clone(),
                block_mined: block.number,
                nonce: tx.nonce,
            })
    }

    /// Scans the ancestry of `block` (no deeper than the appointment's
    /// start block) for an already-mined response. Used when an
    /// appointment is first observed.
    fn scan_ancestry(
        &self,
        appointment: &Appointment,
        block: &Block,
        cache: &BlockCache<Block>,
    ) -> AppointmentState {
        for ancestor in cache.ancestry(&block.hash) {
            if ancestor.number < appointment.start_block {
                break;
            }
            if let Some(mined) = self.mined_in_block(appointment, ancestor.as_ref()) {
                return mined;
            }
        }
        AppointmentState::Pending { identifier: appointment.identifier.clone() }
    }
}

impl AnchorStateReducer<Block> for ResponderComponent {
    type State = ResponderAnchorState;

    fn initial(&self, block: &Block, cache: &BlockCache<Block>) -> Self::State {
        let mut items = BTreeMap::new();
        for appointment in self.registry.all() {
            items.insert(appointment.id, self.scan_ancestry(&appointment, block, cache));
        }
        ResponderAnchorState { block_number: block.number, items }
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
                // Mined is absorbing
                Some(mined @ AppointmentState::Mined { .. }) => mined.clone(),
                Some(pending @ AppointmentState::Pending { .. }) => {
                    self.mined_in_block(&appointment, block).unwrap_or_else(|| pending.clone())
                }
                // appointment registered since the previous block
                None => self.scan_ancestry(&appointment, block, cache),
            };
            items.insert(appointment.id, state);
        }
        ResponderAnchorState { block_number: block.number, items }
    }
}

impl Component<Block> for ResponderComponent {
    type Action = ResponderAction;

    fn name(&self) -> &'static str {
        "responder"
    }

    fn detect_changes(&self, prev: &Self::State, next: &Self::State) -> Vec<ResponderAction> {
        let mut actions = Vec::new();
        let mut missing: Vec<AppointmentId> = Vec::new();

        // BTreeMap iteration gives the stable appointment-id order the
        // dispatch contract requires.
        for (id, state) in &next.items {
            match state {
                AppointmentState::Pending { .. } => missing.push(*id),
                AppointmentState::Mined { identifier, block_mined, nonce } => {
                    let newly_mined =
                        !matches!(prev.items.get(id), Some(AppointmentState::Mined { .. }));
                    if newly_mined {
                        actions.push(ResponderAction::TxMined {
                            identifier: identifier.clone(),
                            nonce: *nonce,
                        });
                        actions.push(ResponderAction::CheckResponderBalance);
                    }
                    if let Some(appointment) = self.registry.get(id) {
                        let confirmations = next.block_number.saturating_sub(*block_mined);
                        if confirmations >= u64::from(appointment.confirmations_required) {
                            actions.push(ResponderAction::EndResponse(*id));
                        }
                    }
                }
            }
        }

        if !missing.is_empty() {
            actions.insert(0, ResponderAction::ReEnqueueMissingItems(missing));
        }
        actions
    }
}
