//! Keel Core
//!
//! Core types and abstractions for the Keel deployment orchestrator.
//!
//! This crate contains:
//! - Domain types: Runs, stage records, secret bundles, snapshots, leases
//! - DTOs: Data transfer objects shared by the orchestrator, client and CLI
//! - Digest helpers used to derive content hashes and idempotency keys

pub mod digest;
pub mod domain;
pub mod dto;
