//! Core chain and appointment data types.
//!
//! Blocks come in two shapes: a [`BlockStub`] carrying only the linkage
//! fields (`hash`, `number`, `parent_hash`) and a full [`Block`] that adds
//! transactions and logs. Components that only follow chain structure are
//! generic over [`BlockIdentity`] so they never force a full-block fetch;
//! components that inspect transactions or logs require the richer bounds
//! ([`TransactionContainer`], [`LogContainer`]).
//!
//! [`ResponseIdentifier`] is the idempotency key of the response pipeline:
//! two transactions with equal identifier are the same logical intent, and
//! the gas queue enforces identifier uniqueness.

use serde::{Deserialize, Serialize};

/// 32-byte block or transaction hash.
pub type Hash256 = [u8; 32];

/// 20-byte account address.
pub type Address = [u8; 20];

/// Unique appointment identifier assigned by the inspector.
pub type AppointmentId = [u8; 32];

/// Minimal block shape: enough to maintain the chain DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStub {
    pub hash: Hash256,
    pub number: u64,
    pub parent_hash: Hash256,
}

/// A mined transaction as observed in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub chain_id: u64,
    pub data: Vec<u8>,
    pub value: u128,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub block_number: u64,
}

/// An event log emitted in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: [Option<Hash256>; 4],
    pub data: Vec<u8>,
    pub transaction_hash: Hash256,
}

impl Log {
    /// Positional topic match: every topic the filter specifies must be
    /// present at the same position in this log.
    #[must_use]
    pub fn matches_topics(&self, filter: &[Option<Hash256>; 4]) -> bool {
        filter.iter().enumerate().all(|(i, wanted)| match wanted {
            Some(topic) => self.topics[i].as_ref() == Some(topic),
            None => true,
        })
    }
}

/// Full block: linkage fields plus transactions and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: Hash256,
    pub number: u64,
    pub parent_hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub logs: Vec<Log>,
}

impl Block {
    /// Returns the linkage-only view of this block.
    #[must_use]
    pub fn stub(&self) -> BlockStub {
        BlockStub { hash: self.hash, number: self.number, parent_hash: self.parent_hash }
    }
}

/// Access to the linkage fields every block shape carries.
pub trait BlockIdentity: Clone + Send + Sync + 'static {
    fn hash(&self) -> &Hash256;
    fn number(&self) -> u64;
    fn parent_hash(&self) -> &Hash256;
}

impl BlockIdentity for BlockStub {
    fn hash(&self) -> &Hash256 {
        &self.hash
    }
    fn number(&self) -> u64 {
        self.number
    }
    fn parent_hash(&self) -> &Hash256 {
        &self.parent_hash
    }
}

impl BlockIdentity for Block {
    fn hash(&self) -> &Hash256 {
        &self.hash
    }
    fn number(&self) -> u64 {
        self.number
    }
    fn parent_hash(&self) -> &Hash256 {
        &self.parent_hash
    }
}

/// Block shapes that carry their transactions.
pub trait TransactionContainer: BlockIdentity {
    fn transactions(&self) -> &[Transaction];

    fn contains_transaction(&self, hash: &Hash256) -> bool {
        self.transactions().iter().any(|tx| &tx.hash == hash)
    }
}

impl TransactionContainer for Block {
    fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }
}

/// Block shapes that carry their event logs.
pub trait LogContainer: BlockIdentity {
    fn logs(&self) -> &[Log];
}

impl LogContainer for Block {
    fn logs(&self) -> &[Log] {
        &self.logs
    }
}

/// The tuple that makes two response transactions interchangeable.
///
/// Queued transactions with equal identifiers are the same logical intent;
/// the queue rejects a second insert and the responder treats a mined
/// transaction with a matching identifier as its own even if it was
/// broadcast by an earlier incarnation of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseIdentifier {
    pub chain_id: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub gas_limit: u64,
}

impl ResponseIdentifier {
    /// Whether a mined transaction carries this intent.
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        tx.chain_id == self.chain_id &&
            tx.to.as_ref() == Some(&self.to) &&
            tx.value == self.value &&
            tx.data == self.data &&
            tx.gas_limit == self.gas_limit
    }
}

/// An appointment accepted by the inspector.
///
/// The inspector has already validated signatures, bytecode, dispute period
/// and round; the core trusts these fields as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub customer_address: Address,
    pub identifier: ResponseIdentifier,
    pub start_block: u64,
    pub end_block: u64,
    pub confirmations_required: u32,
    /// Positional topics of the triggering event. `None` means the
    /// appointment is an unconditional response duty from `start_block`.
    pub event_topics: Option<[Option<Hash256>; 4]>,
    pub payment_proof: Vec<u8>,
}

/// Outcome of a mined transaction as reported by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: Hash256,
    pub block_hash: Hash256,
    pub block_number: u64,
    pub gas_used: u64,
    pub status: bool,
}

/// A transaction the responder intends to sign and broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub nonce: u64,
    pub chain_id: u64,
}
