//! The Palaver gateway — the in-process orchestrator.
//!
//! Composition over globals: [`state::AppState`] is built once at
//! startup and threaded into every handler. The runtime submodules hold
//! the scheduler (per-session serialization + worker pool), the turn
//! engine (streamed LLM + tool interleave + confirmation suspension),
//! and the stores they coordinate.

pub mod api;
pub mod cli;
pub mod config_service;
pub mod connections;
pub mod rate_limit;
pub mod runtime;
pub mod state;
