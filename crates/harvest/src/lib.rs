//! Harvest-and-lookup engine.
//!
//! Keeps a rolling cache of GFS snapshots up to date and answers time
//! queries against it.

pub mod harvester;
pub mod resolver;
pub mod scheduler;
pub mod store;

pub use harvester::{HarvestOutcome, HarvestReport, HarvestSettings, Harvester};
pub use resolver::{parse_instant, Resolved, Resolver, ResolverSettings};
pub use scheduler::{Scheduler, TickOutcome};
pub use store::{FsSnapshotStore, MemorySnapshotStore, SnapshotStore};
