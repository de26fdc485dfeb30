#![forbid(unsafe_code)]
//! Error types for snapstore.
//!
//! Defines `SnapError` and a `Result<T>` alias used throughout the
//! workspace. The server maps these onto message-level error responses;
//! only format and journal corruption are fatal.

use snapstore_types::ParseError;
use thiserror::Error;

/// Unified error type for all snapstore operations.
#[derive(Debug, Error)]
pub enum SnapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(#[from] ParseError),

    #[error("corrupt metadata at sector {sector:#x}: {detail}")]
    Corruption { sector: u64, detail: String },

    #[error("journal recovery failed, {0}")]
    JournalRecovery(&'static str),

    /// Chunk space exhausted after pressure eviction found nothing to evict.
    #[error("no space left in {space} store")]
    NoSpace { space: &'static str },

    /// Leaf has no room for the insert; the caller splits and retries.
    #[error("leaf full")]
    LeafFull,

    #[error("snapshot tag {0} is not valid")]
    InvalidSnapshot(u32),

    #[error("snapshot tag {0} already exists")]
    SnapshotExists(u32),

    /// All 64 snapshot bits are taken.
    #[error("snapshot limit reached")]
    SnapshotLimit,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result alias using `SnapError`.
pub type Result<T> = std::result::Result<T, SnapError>;
