//! The response pipeline: from "this appointment needs a transaction" to
//! "that transaction is confirmed".
//!
//! Watching components emit [`ResponderAction`]s from their anchor-state
//! diffs; the [`MultiResponder`] is the single consumer, the single holder
//! of the signing key, and the single writer of the gas queue.

mod component;
mod gas_queue;
mod multi_responder;
mod watcher;

pub use component::{AppointmentState, ResponderAnchorState, ResponderComponent};
pub use gas_queue::{GasQueue, GasQueueError, GasQueueItem, ResponseRequest};
pub use multi_responder::{GasPolicy, MultiResponder, ResponderError, ResponderStatus};
pub use watcher::{WatchState, WatcherAnchorState, WatcherComponent};

use thiserror::Error;

use crate::types::{Address, AppointmentId, ResponseIdentifier, TransactionRequest};

/// Everything a watching component can ask the responder to do.
///
/// Actions are dispatched in the order the emitting component produced
/// them; the responder deduplicates by identifier, so re-emission across
/// heads is harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponderAction {
    /// An appointment's triggering condition fired: enqueue its response.
    StartResponse(AppointmentId),

    /// These appointments are pending but their items may be missing from
    /// the queue (restart, reorg below mined depth): reinsert any absentees.
    ReEnqueueMissingItems(Vec<AppointmentId>),

    /// A transaction carrying this intent is now in a canonical block.
    TxMined { identifier: ResponseIdentifier, nonce: u64 },

    /// Best-effort probe of the signing address balance.
    CheckResponderBalance,

    /// Final confirmation depth reached (or the appointment expired):
    /// drop all tracking for it.
    EndResponse(AppointmentId),
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// Holder of the responder's signing key. Owned exclusively by the
/// [`MultiResponder`]; no other component signs.
pub trait TransactionSigner: Send + Sync + 'static {
    fn address(&self) -> Address;

    /// Produces the raw signed transaction bytes for broadcast.
    fn sign(&self, tx: &TransactionRequest) -> Result<Vec<u8>, SignerError>;
}
