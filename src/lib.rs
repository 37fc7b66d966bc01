//! Public interface to the CoPilot client library, which drives the
//! dual-pilot (CoPilot) replication protocol of a quorum-replicated
//! key-value store from the client side.

#[macro_use]
mod utils;

mod client;

// Helper utilities
pub use crate::utils::{logger_init, CopilotError, Timer, ME};

// Client-side session, wire messages, and collaborator traits
pub use crate::client::*;
