//! Resumable, adaptive repair-plan orchestrator.
//!
//! A plan is resolved from a manifest for the target machine, then executed
//! step by step. Every attempt is recorded in a per-run event log, the resume
//! index survives reboots, and outcomes are aggregated across runs into a
//! knowledge store that shapes later plan adaptation.

pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod plan;
pub mod process;
pub mod run;
pub mod store;

pub use error::{Error, Result};
