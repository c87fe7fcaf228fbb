//! Snapshot acquisition.
//!
//! A harvest walks backward from a starting instant one cadence period at a
//! time. Unpublished cycles and network failures both just move the walk to
//! the next older cycle. The first cycle upstream can serve is downloaded,
//! converted and committed, after which the walk continues into the
//! preceding cycle until it meets one that is already cached. That way gaps
//! heal over successive scheduled runs without a separate backfill job.
//!
//! A run always ends in one of the [`HarvestOutcome`] states:
//!
//! | Outcome | Cause |
//! |---|---|
//! | `HorizonReached` | next candidate is older than `now - horizon` |
//! | `AlreadyPresent` | upstream has the candidate but the store already does too |
//! | `PreviousPresent` | a commit succeeded and the cycle before it is cached |
//! | `ConversionFailed` | the converter rejected a download (not retried) |
//! | `Failed` | local storage fault |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{
    Converter, Error, FetchOutcome, Interval, RawStream, Result, SnapshotKey, SnapshotSource,
    TimeGrid,
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::store::SnapshotStore;

/// Tunables for a [`Harvester`].
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    /// Oldest cycle a run may attempt, relative to `now`.
    pub horizon: Duration,
    /// Staging directory for raw downloads.
    pub raw_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestOutcome {
    HorizonReached,
    AlreadyPresent(SnapshotKey),
    PreviousPresent(SnapshotKey),
    ConversionFailed { key: SnapshotKey, reason: String },
    Failed { key: SnapshotKey, reason: String },
}

impl HarvestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            HarvestOutcome::HorizonReached => "horizon_reached",
            HarvestOutcome::AlreadyPresent(_) => "already_present",
            HarvestOutcome::PreviousPresent(_) => "previous_present",
            HarvestOutcome::ConversionFailed { .. } => "conversion_failed",
            HarvestOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            HarvestOutcome::ConversionFailed { .. } | HarvestOutcome::Failed { .. }
        )
    }
}

/// Result of one harvest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestReport {
    /// First candidate of the walk.
    pub started_at: SnapshotKey,
    /// Upstream requests issued.
    pub attempts: u32,
    /// Snapshots written during this run, newest first.
    pub committed: Vec<SnapshotKey>,
    pub outcome: HarvestOutcome,
}

pub struct Harvester {
    grid: TimeGrid,
    settings: HarvestSettings,
    source: Arc<dyn SnapshotSource>,
    converter: Arc<dyn Converter>,
    store: Arc<dyn SnapshotStore>,
}

enum Step {
    /// Try the next older cycle.
    Back,
    /// Stop the run.
    Stop(HarvestOutcome),
    /// Committed; continue with this cycle unless it is cached.
    Committed(SnapshotKey),
}

impl Harvester {
    pub fn new(
        grid: TimeGrid,
        settings: HarvestSettings,
        source: Arc<dyn SnapshotSource>,
        converter: Arc<dyn Converter>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            grid,
            settings,
            source,
            converter,
            store,
        }
    }

    pub fn grid(&self) -> TimeGrid {
        self.grid
    }

    /// Upper bound on candidates a single run may visit.
    fn max_attempts(&self) -> u32 {
        let cadence_secs = self.grid.cadence().duration().num_seconds().max(1);
        let steps = self.settings.horizon.num_seconds().max(0) / cadence_secs;
        u32::try_from(steps).unwrap_or(u32::MAX).saturating_add(2)
    }

    /// Run one harvest walking back from `start`, bounded relative to `now`.
    pub async fn harvest(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> HarvestReport {
        let mut candidate = self.grid.round_down(start);
        let mut report = HarvestReport {
            started_at: candidate.key(),
            attempts: 0,
            committed: Vec::new(),
            outcome: HarvestOutcome::HorizonReached,
        };

        for _ in 0..self.max_attempts() {
            if now - candidate.start() > self.settings.horizon {
                info!(
                    "Hit harvest horizon at {}; harvest complete or there is a big gap in data",
                    candidate.key()
                );
                return report;
            }

            report.attempts = report.attempts.saturating_add(1);

            match self.attempt(candidate).await {
                Step::Back => {
                    candidate = self.grid.previous(candidate);
                }
                Step::Stop(outcome) => {
                    report.outcome = outcome;
                    return report;
                }
                Step::Committed(key) => {
                    report.committed.push(key);
                    let previous = self.grid.previous(candidate);
                    let previous_key = previous.key();
                    match self.store.exists(&previous_key).await {
                        Ok(true) => {
                            info!("Got {previous_key} already, no need to harvest further");
                            report.outcome = HarvestOutcome::PreviousPresent(previous_key);
                            return report;
                        }
                        Ok(false) => {
                            info!("Attempting to harvest older data {previous_key}");
                            candidate = previous;
                        }
                        Err(e) => {
                            error!("Store check for {previous_key} failed: {e}");
                            report.outcome = HarvestOutcome::Failed {
                                key: previous_key,
                                reason: e.to_string(),
                            };
                            return report;
                        }
                    }
                }
            }
        }

        warn!(
            "Harvest from {} stopped after {} attempts",
            report.started_at, report.attempts
        );
        report
    }

    async fn attempt(&self, candidate: Interval) -> Step {
        let key = candidate.key();

        let stream = match self.source.fetch(&candidate).await {
            Ok(FetchOutcome::Found(stream)) => stream,
            Ok(FetchOutcome::NotPublished { status }) => {
                debug!("{key} not available upstream (status {status}), trying previous interval");
                return Step::Back;
            }
            Err(e) => {
                warn!("Fetch for {key} failed: {e}; trying previous interval");
                return Step::Back;
            }
        };

        match self.store.exists(&key).await {
            Ok(true) => {
                info!("Already have {key}, not looking further");
                return Step::Stop(HarvestOutcome::AlreadyPresent(key));
            }
            Ok(false) => {}
            Err(e) => {
                error!("Store check for {key} failed: {e}");
                return Step::Stop(HarvestOutcome::Failed {
                    key,
                    reason: e.to_string(),
                });
            }
        }

        info!("Downloading {key}");
        let raw_path = match self.stage(&key, stream).await {
            Ok(path) => path,
            Err(e) if e.is_transient() => {
                warn!("Download of {key} failed: {e}; trying previous interval");
                return Step::Back;
            }
            Err(e) => {
                error!("Could not stage {key}: {e}");
                return Step::Stop(HarvestOutcome::Failed {
                    key,
                    reason: e.to_string(),
                });
            }
        };

        let converted = self.converter.convert(&key, &raw_path).await;
        discard(&raw_path).await;

        let payload = match converted {
            Ok(payload) => payload,
            Err(e) => {
                error!("Conversion of {key} failed: {e}");
                return Step::Stop(HarvestOutcome::ConversionFailed {
                    key,
                    reason: e.to_string(),
                });
            }
        };

        match self.store.write(&key, &payload).await {
            Ok(()) => {
                info!("Converted and stored {key} ({} bytes)", payload.len());
                Step::Committed(key)
            }
            Err(Error::AlreadyExists(_)) => {
                info!("{key} was stored concurrently, not looking further");
                Step::Stop(HarvestOutcome::AlreadyPresent(key))
            }
            Err(e) => {
                error!("Writing {key} failed: {e}");
                Step::Stop(HarvestOutcome::Failed {
                    key,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stream the raw payload into `<raw_dir>/<key>.f000`.
    ///
    /// On any error the partial file is removed.
    async fn stage(&self, key: &SnapshotKey, mut stream: RawStream) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.settings.raw_dir).await?;
        let path = self.settings.raw_dir.join(format!("{key}.f000"));

        let written = async {
            let mut file = tokio::fs::File::create(&path).await?;
            let mut total: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                total = total.saturating_add(chunk.len() as u64);
            }
            file.flush().await?;
            Ok::<u64, Error>(total)
        }
        .await;

        match written {
            Ok(total) => {
                debug!("Staged {} ({} bytes)", path.display(), total);
                Ok(path)
            }
            Err(e) => {
                discard(&path).await;
                Err(e)
            }
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove raw file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemorySnapshotStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Clone)]
    pub(crate) enum Upstream {
        Publish(&'static str),
        Status(u16),
        Unreachable,
        BrokenStream,
    }

    /// Upstream fake keyed by snapshot key; unknown keys answer 404.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        cycles: HashMap<String, Upstream>,
        publish_all: Option<&'static str>,
        requested: Mutex<Vec<SnapshotKey>>,
    }

    impl FakeSource {
        pub(crate) fn with(mut self, key: &str, upstream: Upstream) -> Self {
            self.cycles.insert(key.to_string(), upstream);
            self
        }

        pub(crate) fn publishing_everything(payload: &'static str) -> Self {
            Self {
                publish_all: Some(payload),
                ..Self::default()
            }
        }

        pub(crate) fn requested(&self) -> Vec<SnapshotKey> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn fetch(&self, interval: &Interval) -> Result<FetchOutcome> {
            let key = interval.key();
            self.requested.lock().unwrap().push(key.clone());

            let behaviour = self
                .cycles
                .get(key.as_str())
                .cloned()
                .or_else(|| self.publish_all.map(Upstream::Publish))
                .unwrap_or(Upstream::Status(404));

            match behaviour {
                Upstream::Publish(body) => {
                    let chunks = vec![Ok(Bytes::from_static(b"GRIB:")), Ok(Bytes::from(body))];
                    Ok(FetchOutcome::Found(futures_util::stream::iter(chunks).boxed()))
                }
                Upstream::Status(status) => Ok(FetchOutcome::NotPublished { status }),
                Upstream::Unreachable => Err(Error::Transport("connection refused".into())),
                Upstream::BrokenStream => {
                    let chunks = vec![
                        Ok(Bytes::from_static(b"GRIB:")),
                        Err(Error::Transport("connection reset".into())),
                    ];
                    Ok(FetchOutcome::Found(futures_util::stream::iter(chunks).boxed()))
                }
            }
        }
    }

    /// Reads the staged file and wraps it; fails for listed keys.
    #[derive(Default)]
    pub(crate) struct FakeConverter {
        failing: HashSet<String>,
    }

    impl FakeConverter {
        pub(crate) fn failing_on(key: &str) -> Self {
            Self {
                failing: HashSet::from([key.to_string()]),
            }
        }
    }

    #[async_trait]
    impl Converter for FakeConverter {
        async fn convert(&self, key: &SnapshotKey, raw: &Path) -> Result<Vec<u8>> {
            if self.failing.contains(key.as_str()) {
                return Err(Error::Conversion(format!("bad GRIB for {key}")));
            }
            let raw = tokio::fs::read(raw).await?;
            Ok(format!("{{\"raw\":\"{}\"}}", String::from_utf8_lossy(&raw)).into_bytes())
        }
    }

    pub(crate) fn key(raw: &str) -> SnapshotKey {
        SnapshotKey::parse(raw).unwrap()
    }

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap()
    }

    pub(crate) fn harvester(
        source: Arc<FakeSource>,
        converter: FakeConverter,
        store: MemorySnapshotStore,
        raw_dir: &Path,
    ) -> Harvester {
        Harvester::new(
            TimeGrid::default(),
            HarvestSettings {
                horizon: Duration::days(30),
                raw_dir: raw_dir.to_path_buf(),
            },
            source,
            Arc::new(converter),
            Arc::new(store),
        )
    }

    fn raw_dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_steps_back_then_backfills_until_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        store.write(&key("2024010912"), b"old").await.unwrap();

        let source = Arc::new(
            FakeSource::default()
                .with("2024011006", Upstream::Status(404))
                .with("2024011000", Upstream::Publish("a"))
                .with("2024010918", Upstream::Publish("b")),
        );
        let h = harvester(source.clone(), FakeConverter::default(), store.clone(), dir.path());

        let report = h.harvest(now(), now()).await;

        assert_eq!(report.started_at, key("2024011006"));
        assert_eq!(report.committed, vec![key("2024011000"), key("2024010918")]);
        assert_eq!(report.outcome, HarvestOutcome::PreviousPresent(key("2024010912")));
        assert_eq!(report.attempts, 3);
        assert_eq!(store.read(&key("2024011000")).await.unwrap(), b"{\"raw\":\"GRIB:a\"}");
        assert!(raw_dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_transport_failure_steps_back_like_unpublished() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        store.write(&key("2024010918"), b"old").await.unwrap();

        let source = Arc::new(
            FakeSource::default()
                .with("2024011006", Upstream::Unreachable)
                .with("2024011000", Upstream::Status(503))
                .with("2024010918", Upstream::Publish("x")),
        );
        let h = harvester(source.clone(), FakeConverter::default(), store.clone(), dir.path());

        let report = h.harvest(now(), now()).await;

        assert!(report.committed.is_empty());
        assert_eq!(report.outcome, HarvestOutcome::AlreadyPresent(key("2024010918")));
        assert_eq!(
            source.requested(),
            vec![key("2024011006"), key("2024011000"), key("2024010918")]
        );
        assert_eq!(store.read(&key("2024010918")).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        store.write(&key("2024010918"), b"old").await.unwrap();

        let source = Arc::new(FakeSource::default().with("2024011000", Upstream::Publish("a")));
        let h = harvester(source.clone(), FakeConverter::default(), store.clone(), dir.path());

        let first = h.harvest(now(), now()).await;
        assert_eq!(first.committed, vec![key("2024011000")]);
        assert_eq!(first.outcome, HarvestOutcome::PreviousPresent(key("2024010918")));
        let stored_after_first = store.len();

        let second = h.harvest(now(), now()).await;
        assert!(second.committed.is_empty());
        assert_eq!(second.outcome, HarvestOutcome::AlreadyPresent(key("2024011000")));
        assert!(!second.outcome.is_error());
        assert_eq!(store.len(), stored_after_first);
    }

    #[tokio::test]
    async fn test_conversion_failure_stops_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();

        let source = Arc::new(
            FakeSource::default()
                .with("2024011006", Upstream::Publish("bad"))
                .with("2024011000", Upstream::Publish("good")),
        );
        let h = harvester(
            source.clone(),
            FakeConverter::failing_on("2024011006"),
            store.clone(),
            dir.path(),
        );

        let report = h.harvest(now(), now()).await;

        assert!(matches!(
            report.outcome,
            HarvestOutcome::ConversionFailed { ref key, .. } if key.as_str() == "2024011006"
        ));
        assert!(report.committed.is_empty());
        assert!(store.is_empty());
        assert_eq!(source.requested(), vec![key("2024011006")]);
        assert!(raw_dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_broken_download_steps_back_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        store.write(&key("2024010918"), b"old").await.unwrap();

        let source = Arc::new(
            FakeSource::default()
                .with("2024011006", Upstream::BrokenStream)
                .with("2024011000", Upstream::Publish("a")),
        );
        let h = harvester(source.clone(), FakeConverter::default(), store.clone(), dir.path());

        let report = h.harvest(now(), now()).await;

        assert_eq!(report.committed, vec![key("2024011000")]);
        assert!(!store.exists(&key("2024011006")).await.unwrap());
        assert!(raw_dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_never_attempts_beyond_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        let source = Arc::new(FakeSource::default());
        let h = harvester(source.clone(), FakeConverter::default(), store.clone(), dir.path());

        let now = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let report = h.harvest(now, now).await;

        assert_eq!(report.outcome, HarvestOutcome::HorizonReached);
        let requested = source.requested();
        // 30 days of 6-hourly cycles, both ends inclusive.
        assert_eq!(requested.len(), 121);
        assert_eq!(report.attempts, 121);
        let oldest = requested.last().unwrap();
        assert_eq!(oldest, &key("2024010100"));
        for k in &requested {
            let start = Interval::from_key(k.as_str()).unwrap().start();
            assert!(now - start <= Duration::days(30), "{k} is beyond the horizon");
        }
    }

    #[tokio::test]
    async fn test_backfill_fills_every_gap_up_to_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        let source = Arc::new(FakeSource::publishing_everything("z"));
        let h = harvester(source.clone(), FakeConverter::default(), store.clone(), dir.path());

        let now = Utc.with_ymd_and_hms(2024, 1, 31, 3, 0, 0).unwrap();
        let report = h.harvest(now, now).await;

        assert_eq!(report.outcome, HarvestOutcome::HorizonReached);
        assert_eq!(report.committed.first(), Some(&key("2024013100")));
        assert_eq!(report.committed.last(), Some(&key("2024010106")));
        assert_eq!(store.len(), report.committed.len());
        assert_eq!(store.len(), 120);
    }

    #[tokio::test]
    async fn test_conversion_failure_mid_backfill_keeps_earlier_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySnapshotStore::new();
        store.write(&key("2024010912"), b"old").await.unwrap();

        let source = Arc::new(
            FakeSource::default()
                .with("2024011000", Upstream::Publish("a"))
                .with("2024010918", Upstream::Publish("b")),
        );
        let h = harvester(
            source.clone(),
            FakeConverter::failing_on("2024010918"),
            store.clone(),
            dir.path(),
        );

        let report = h.harvest(now(), now()).await;

        assert_eq!(report.committed, vec![key("2024011000")]);
        assert_eq!(report.outcome.label(), "conversion_failed");
        assert!(store.exists(&key("2024011000")).await.unwrap());
        assert!(!store.exists(&key("2024010918")).await.unwrap());
        assert_eq!(store.len(), 2);
    }
}
