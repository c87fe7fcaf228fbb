//! Shared types, config, and error definitions for wind-harvest.

pub mod config;
pub mod error;
pub mod grid;
pub mod source;

pub use config::AppConfig;
pub use error::Error;
pub use grid::{Cadence, Interval, SnapshotKey, TimeGrid};
pub use source::{Converter, FetchOutcome, RawStream, SnapshotSource};

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
