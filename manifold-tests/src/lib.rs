//! Manifold Tests - cross-crate scenario and property tests.
//!
//! Unit tests live inline in each crate under `#[cfg(test)]`; this crate
//! covers behavior that spans crates: a whole [`manifold_fetch::FetchPool`]
//! driven through scripted transport and codec fakes.
//!
//! ## Test Organization
//!
//! - `harness`: scripted [`Transport`](manifold_fetch::Transport) and
//!   [`FetchCodec`](manifold_fetch::FetchCodec) fakes plus response
//!   builders, reusable by every test module
//! - `scenario_tests`: end-to-end pool scenarios (shared fetches,
//!   connection budgets, out-of-range recovery, forced detach)
//! - `property_tests`: proptest properties over cursors, dispatch
//!   routing, and backoff
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_<component>_<scenario>`
//! - Property tests: `prop_<law>`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod harness;

#[cfg(test)]
mod property_tests;
#[cfg(test)]
mod scenario_tests;
