//! # CinderDB Configuration Module
//!
//! This module centralizes all configuration constants for the engine core.
//! Constants are grouped by their functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Several values here depend on each other: the worker identifier layout
//! caps the worker count, the TID bit budget caps the epoch range, and the
//! log buffer capacity must cover the largest record a commit can emit. By
//! co-locating these constants and adding compile-time checks, a change that
//! would silently break a dependent value fails the build instead.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
