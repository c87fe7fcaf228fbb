//! Periodic harvest trigger.
//!
//! Each tick spawns a harvest on its own task so a slow download never
//! delays the timer. At most one harvest runs at a time: a tick that finds
//! the previous run still in flight is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::harvester::{HarvestReport, Harvester};

pub enum TickOutcome {
    Started(JoinHandle<HarvestReport>),
    Skipped,
}

/// Clears the running flag when the harvest task ends, even on panic.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    harvester: Arc<Harvester>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(harvester: Arc<Harvester>, poll_interval: Duration) -> Self {
        Self {
            harvester,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a harvest from the current time unless one is in flight.
    pub fn tick(&self) -> TickOutcome {
        let Some(guard) = RunGuard::acquire(&self.running) else {
            return TickOutcome::Skipped;
        };

        let harvester = self.harvester.clone();
        TickOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            let now = Utc::now();
            let report = harvester.harvest(now, now).await;
            log_report(&report);
            report
        }))
    }

    /// Tick forever. The first tick fires immediately.
    pub async fn run(self) {
        info!(
            "Harvest scheduler started (every {}s)",
            self.poll_interval.as_secs()
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick_id: u64 = 0;

        loop {
            interval.tick().await;
            tick_id = tick_id.saturating_add(1);

            match self.tick() {
                TickOutcome::Started(_) => info!("Tick {tick_id}: harvest started"),
                TickOutcome::Skipped => {
                    warn!("Tick {tick_id}: previous harvest still running, skipping")
                }
            }
        }
    }
}

fn log_report(report: &HarvestReport) {
    let committed: Vec<&str> = report.committed.iter().map(|k| k.as_str()).collect();
    if report.outcome.is_error() {
        error!(
            "Harvest from {} ended {} after {} attempts: {:?} (committed {:?})",
            report.started_at,
            report.outcome.label(),
            report.attempts,
            report.outcome,
            committed
        );
    } else {
        info!(
            "Harvest from {} ended {} after {} attempts (committed {:?})",
            report.started_at,
            report.outcome.label(),
            report.attempts,
            committed
        );
    }
}
