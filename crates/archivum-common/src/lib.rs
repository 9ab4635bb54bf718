//! Archivum Common - Shared types and utilities
//!
//! This crate provides the data model, error taxonomy, configuration and
//! small utilities used across all Archivum components.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Sha256Calculator, sha256_hex};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
