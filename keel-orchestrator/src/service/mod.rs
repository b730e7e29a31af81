//! Service Module
//!
//! The orchestration engine and the pieces it drives Runs with.

pub mod backoff;
pub mod engine;
pub mod lease;
mod rollback;
mod stages;
mod worker;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Adapters, Engine, EngineError, RunEvent};
