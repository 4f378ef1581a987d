//! Frequency-domain Rowhammer pattern fuzzer.
//!
//! This crate generates, maps, compiles and executes hammering patterns:
//!
//! 1. [`params::FuzzingParameterSet`] draws the randomized knobs of one
//!    fuzzing iteration.
//! 2. [`builder::PatternBuilder`] composes an abstract
//!    [`pattern::HammeringPattern`] of aggressor IDs by aliasing periodic
//!    access patterns of power-of-two periods into a refresh-window
//!    schedule.
//! 3. [`mapper::PatternAddressMapper`] binds aggressor IDs to DRAM rows in
//!    a chosen bank and lowers the pattern to virtual addresses.
//! 4. [`jitter::CodeJitter`] emits a refresh-synchronized x86-64 hammer
//!    function over the address sequence; [`hammerer::PatternHammerer`]
//!    executes and length-tunes it.
//! 5. [`mapper::PatternAddressMapper::scan_victims`] checks the rows
//!    adjacent to the aggressors for bit flips.
//!
//! Completed patterns round-trip through [`pattern::FuzzReport`] for later
//! replay.
//!
//! # References
//!
//! Based on: Jattke et al., "Blacksmith: Scalable Rowhammering in the
//! Frequency Domain", IEEE S&P 2022.

#![warn(missing_docs)]

pub mod analyzer;
pub mod builder;
pub mod hammerer;
pub mod jitter;
pub mod mapper;
pub mod params;
pub mod pattern;

pub use analyzer::DramAnalyzer;
pub use builder::PatternBuilder;
pub use hammerer::PatternHammerer;
pub use jitter::{CodeJitter, Program};
pub use mapper::PatternAddressMapper;
pub use params::FuzzingParameterSet;
pub use pattern::{Aggressor, AggressorAccessPattern, FuzzReport, HammeringPattern};
