//! chatfolders library crate.
//!
//! User-defined groups layered over a conversation list the host keeps
//! re-rendering. The crate provides:
//! - The group model and its coalesced, failure-tolerant persistence
//! - An index from session paths to the elements currently showing them
//! - Reconciliation of titles and deletions against the host list
//! - Active-session tracking and the new-chat handshake
//! - A watchdog that rebuilds the UI when it drifts from the model

pub mod config;
pub mod creation;
pub mod engine;
pub mod error;
pub mod groups;
pub mod host;
pub mod live_index;
pub mod logging;
pub mod reconcile;
pub mod store;
pub mod tracker;

pub use engine::{Engine, Lifecycle};
pub use error::EngineError;
