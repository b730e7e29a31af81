//! Data Transfer Objects for the orchestrator API
//!
//! Request and response bodies shared by the orchestrator, the client
//! library and the CLI.

pub mod environment;
pub mod run;
pub mod webhook;
