//! Nonce-contiguous queue of intended in-flight transactions.
//!
//! One queue per signing address. Broadcasting the queue front-to-back
//! yields a gapless nonce stream from `base_nonce`, and no two items ever
//! share a [`ResponseIdentifier`]. The queue is a persistent value: every
//! operation returns a new queue and leaves the receiver untouched, so a
//! failed operation can never corrupt the caller's copy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AppointmentId, ResponseIdentifier};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GasQueueError {
    #[error("an item with this identifier is already queued")]
    DuplicateIdentifier,

    #[error("nonce {nonce} is outside the queue range [{base}, {end})")]
    NonceOutOfRange { nonce: u64, base: u64, end: u64 },

    #[error("identifier is not queued")]
    UnknownIdentifier,

    #[error("bump to {new} does not exceed current gas price {current}")]
    GasPriceNotIncreased { current: u128, new: u128 },

    #[error("replacement items would break nonce contiguity")]
    NonContiguousReplacement,
}

/// What the responder has committed to get mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub appointment_id: AppointmentId,
    pub deadline_block: u64,
    pub identifier: ResponseIdentifier,
}

/// A request pinned to a nonce and a gas price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasQueueItem {
    pub request: ResponseRequest,
    pub nonce: u64,
    pub gas_price: u128,
}

impl GasQueueItem {
    #[must_use]
    pub fn identifier(&self) -> &ResponseIdentifier {
        &self.request.identifier
    }
}

/// Ordered set of in-flight intents over a single signing address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasQueue {
    base_nonce: u64,
    floor_gas_price: u128,
    /// Sorted by nonce ascending; nonces are contiguous from `base_nonce`.
    items: Vec<GasQueueItem>,
}

impl GasQueue {
    #[must_use]
    pub fn new(base_nonce: u64, floor_gas_price: u128) -> Self {
        Self { base_nonce, floor_gas_price, items: Vec::new() }
    }

    #[must_use]
    pub fn base_nonce(&self) -> u64 {
        self.base_nonce
    }

    /// Nonce the next appended item will take.
    #[must_use]
    pub fn next_nonce(&self) -> u64 {
        self.base_nonce + self.items.len() as u64
    }

    #[must_use]
    pub fn items(&self) -> &[GasQueueItem] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn contains_identifier(&self, identifier: &ResponseIdentifier) -> bool {
        self.items.iter().any(|item| item.identifier() == identifier)
    }

    #[must_use]
    pub fn item_for(&self, identifier: &ResponseIdentifier) -> Option<&GasQueueItem> {
        self.items.iter().find(|item| item.identifier() == identifier)
    }

    /// Appends a new intent at the next nonce. The gas price is the higher
    /// of `current_gas_price` and the queue's floor.
    pub fn add(
        &self,
        request: ResponseRequest,
        current_gas_price: u128,
    ) -> Result<Self, GasQueueError> {
        if self.contains_identifier(&request.identifier) {
            return Err(GasQueueError::DuplicateIdentifier);
        }
        let mut next = self.clone();
        let gas_price = current_gas_price.max(self.floor_gas_price);
        next.items.push(GasQueueItem { request, nonce: self.next_nonce(), gas_price });
        Ok(next)
    }

    /// Confirms that the item at `nonce` has been mined: it and everything
    /// below it leave the queue and `base_nonce` moves past it.
    pub fn consume(&self, nonce: u64) -> Result<Self, GasQueueError> {
        if nonce < self.base_nonce || nonce >= self.next_nonce() {
            return Err(GasQueueError::NonceOutOfRange {
                nonce,
                base: self.base_nonce,
                end: self.next_nonce(),
            });
        }
        let mut next = self.clone();
        next.items.retain(|item| item.nonce > nonce);
        next.base_nonce = nonce + 1;
        Ok(next)
    }

    /// Raises the gas price of one item; its nonce and every other item
    /// are untouched.
    pub fn bump(
        &self,
        identifier: &ResponseIdentifier,
        new_gas_price: u128,
    ) -> Result<Self, GasQueueError> {
        let index = self
            .items
            .iter()
            .position(|item| item.identifier() == identifier)
            .ok_or(GasQueueError::UnknownIdentifier)?;
        let current = self.items[index].gas_price;
        if new_gas_price <= current {
            return Err(GasQueueError::GasPriceNotIncreased { current, new: new_gas_price });
        }
        let mut next = self.clone();
        next.items[index].gas_price = new_gas_price;
        Ok(next)
    }

    /// Replaces the prefix of the queue whose nonce range matches
    /// `replacements`; the suffix above the range is kept. Used when the
    /// chain turns out to hold different transactions at our leading
    /// nonces (external replacement, reorg).
    pub fn replace_from(&self, replacements: Vec<GasQueueItem>) -> Result<Self, GasQueueError> {
        if replacements.is_empty() {
            return Ok(self.clone());
        }
        let start = replacements[0].nonce;
        if start != self.base_nonce {
            return Err(GasQueueError::NonContiguousReplacement);
        }
        for (i, item) in replacements.iter().enumerate() {
            if item.nonce != start + i as u64 {
                return Err(GasQueueError::NonContiguousReplacement);
            }
        }
        let end = start + replacements.len() as u64;

        let suffix: Vec<GasQueueItem> =
            self.items.iter().filter(|item| item.nonce >= end).cloned().collect();
        if let Some(first_kept) = suffix.first() {
            if first_kept.nonce != end {
                return Err(GasQueueError::NonContiguousReplacement);
            }
        }

        let mut items = replacements;
        for kept in &items {
            if suffix.iter().any(|s| s.identifier() == kept.identifier()) {
                return Err(GasQueueError::DuplicateIdentifier);
            }
        }
        items.extend(suffix);

        Ok(Self { base_nonce: self.base_nonce, floor_gas_price: self.floor_gas_price, items })
    }

    /// Items present here but absent (or changed) in `older`, in queue
    /// order. This is exactly the set the responder must (re)broadcast
    /// after a mutation.
    #[must_use]
    pub fn difference(&self, older: &Self) -> Vec<GasQueueItem> {
        self.items
            .iter()
            .filter(|item| !older.items.contains(item))
            .cloned()
            .collect()
    }

    /// Contiguity check used by tests and recovery paths.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.items
            .iter()
            .enumerate()
            .all(|(i, item)| item.nonce == self.base_nonce + i as u64)
    }
}
