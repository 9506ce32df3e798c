//! Shared domain types for the Palaver gateway.
//!
//! Everything the other crates agree on lives here: the error taxonomy,
//! the layered configuration tree, chat message / tool-call types, the
//! provider stream events, the closed gateway event enumeration, and the
//! client-facing stream frames.

pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod stream;

pub use error::{Error, Result};
