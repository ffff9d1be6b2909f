//! Integration tests for the watchtower pipeline.
//!
//! The mock infrastructure is ordinary library code so scenario tests (and
//! downstream experiments) can script chains; the tests themselves live in
//! `#[cfg(test)]` modules.

pub mod mock_infrastructure;

#[cfg(test)]
mod harness;

#[cfg(test)]
mod recovery_tests;

#[cfg(test)]
mod scenario_tests;
