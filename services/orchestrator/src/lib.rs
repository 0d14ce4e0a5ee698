//! kiln orchestrator library.
//!
//! This crate primarily ships an `orchestrator` binary, but we expose a
//! small library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod labels;
pub mod queue;
pub mod reconciler;
pub mod selector;
pub mod state;
pub mod store;
pub mod sweep;
