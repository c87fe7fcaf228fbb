//! Collaborator contracts used by the harvester.
//!
//! The upstream provider and the GRIB converter live in other crates (or in
//! test fakes); the harvester only sees these traits.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::grid::{Interval, SnapshotKey};
use crate::Result;

/// Raw GRIB bytes as they arrive from upstream.
pub type RawStream = BoxStream<'static, Result<Bytes>>;

/// What upstream had for a candidate interval.
pub enum FetchOutcome {
    /// Upstream answered 200; the body is still unread.
    Found(RawStream),
    /// Upstream answered with a non-success status, usually because the
    /// cycle has not been published yet.
    NotPublished { status: u16 },
}

impl fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOutcome::Found(_) => f.write_str("Found(..)"),
            FetchOutcome::NotPublished { status } => {
                f.debug_struct("NotPublished").field("status", status).finish()
            }
        }
    }
}

/// Source of raw snapshots, addressed by interval.
///
/// Network failures are returned as [`crate::Error::Transport`].
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, interval: &Interval) -> Result<FetchOutcome>;
}

/// Turns a staged raw file into the served payload.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, key: &SnapshotKey, raw: &Path) -> Result<Vec<u8>>;
}
