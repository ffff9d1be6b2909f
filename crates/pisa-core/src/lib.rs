//! # Pisa Core
//!
//! Core library for the PISA watchtower: an accountable third party that
//! commits, per appointment, to submitting a response transaction on a
//! customer's behalf if a triggering condition appears on chain within a
//! block window.
//!
//! This crate is the chain-following response pipeline:
//!
//! - **[`cache`]**: reorg-aware DAG of recent blocks with a bounded depth
//!   window, plus the durable per-block item side-table used for crash
//!   recovery.
//!
//! - **[`processor`]**: ingests new-tip notifications, backfills ancestors,
//!   promotes heads and runs every head turn under one serial lock.
//!
//! - **[`reducer`]**: anchor-state framework: per-component state as a
//!   memoized pure fold over ancestry, so the state observed at any block
//!   is a deterministic function of that block.
//!
//! - **[`responder`]**: the gas queue (nonce-contiguous, identifier-unique),
//!   the per-appointment watching components, and the multi-responder that
//!   owns the signing key and broadcasts.
//!
//! - **[`observer`]**: promise-style "wait for N confirmations" with reorg
//!   and block-threshold rejection.
//!
//! - **[`provider`]**: the consumed chain interface, a JSON-RPC
//!   implementation, and the fixed-delay adapter.
//!
//! - **[`store`]** / **[`appointments`]** / **[`config`]** /
//!   **[`runtime`]**: persistence, the appointment registry, layered
//!   configuration, and service wiring.
//!
//! ## Data flow
//!
//! ```text
//!  chain ──► BlockProcessor ──► BlockCache (+ item store)
//!                 │ new-head (serial turn)
//!                 ▼
//!          ComponentSet: reduce(prev, block) per component
//!                 │ detect_changes → actions
//!                 ▼
//!          MultiResponder ──► GasQueue ──► sign ──► broadcast
//!                 │
//!                 └──► ConfirmationObserver (settle / reorg / timeout)
//! ```
//!
//! The HTTP surface, appointment inspection (signatures, bytecode checks),
//! and the accountability contract live outside this crate; they interact
//! with it only through [`types::Appointment`], the provider trait and the
//! signer trait.

pub mod appointments;
pub mod cache;
pub mod config;
pub mod observer;
pub mod processor;
pub mod provider;
pub mod reducer;
pub mod responder;
pub mod runtime;
pub mod store;
pub mod types;
