//! Shared building blocks for the postloop crates.
//!
//! Holds the error taxonomy every crate reports through, the YAML settings
//! file and the small SQLite helpers the persistent stores are built on.

pub mod config;
pub mod db;
pub mod error;

pub use config::{load_settings, Settings};
pub use error::{PostloopError, Result};
