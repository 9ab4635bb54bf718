//! Archivum Placement - capacity directory and node selection
//!
//! Nodes publish [`StorageNodeDescriptor`](archivum_common::StorageNodeDescriptor)s
//! to a [`CapacityDirectory`] by heartbeat. The [`StorageSelector`] reads a
//! snapshot of that directory and places files with Sequential Fill.
//!
//! # Directory implementations
//!
//! - [`MemoryDirectory`]: in-process, authoritative
//! - [`HttpDirectory`]: client for a peer daemon's directory routes
//! - [`FallbackDirectory`]: live, then cached, then static sourcing with a health signal

pub mod directory;
pub mod fallback;
pub mod http;
pub mod selector;
pub mod service;
pub mod thresholds;

pub use directory::{
    CapacityDirectory, DirectorySnapshot, DirectoryTier, HeartbeatAck, MemoryDirectory,
    Reservation,
};
pub use fallback::{DirectoryHealth, FallbackDirectory};
pub use http::HttpDirectory;
pub use selector::{Placement, StorageSelector, select_from};
pub use service::router;
pub use thresholds::CapacityThresholds;
