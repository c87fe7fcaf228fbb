//! Unified error type for wind-harvest.

use thiserror::Error;

use crate::grid::SnapshotKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Snapshot {0} already exists")]
    AlreadyExists(SnapshotKey),

    #[error("Snapshot {0} not found")]
    NotFound(SnapshotKey),

    #[error("No data within searchLimit of {limit_days} day(s)")]
    SearchExhausted { limit_days: u32 },

    #[error("No snapshot has been harvested yet")]
    NotFoundYet,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures a harvest walk recovers from by stepping to an
    /// older interval.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
