//! Core domain types
//!
//! This module contains the core domain structures used across Keel services.
//! These types are shared between the orchestrator (which persists and drives
//! them) and the client/CLI (which display them).

pub mod deployment;
pub mod infra;
pub mod lease;
pub mod run;
pub mod secret;
pub mod stage;
pub mod trigger;
