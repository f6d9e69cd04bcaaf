//! Subscribable medication store.
//!
//! Wraps the SQL repositories with a change broadcast: every successful write
//! announces the [`StorePath`] it touched, and [`Subscription`]s re-read that
//! path when told. Writes from other processes sharing the database never
//! reach the broadcast, so subscriptions also poll the path's revision
//! counter (bumped by triggers) and wake when it moves. A subscription yields
//! the current value first, then once per change. Dropping it unsubscribes.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::allocator::ChamberPool;
use crate::db::{self, ClaimOutcome, Pool, SetOutcome};
use crate::model::{
    DispenserStatus, MedicationRecord, NewMedication, NotificationEvent, Snapshot, StorePath,
};
use crate::schedule::FiredDose;

const CHANGE_BUFFER: usize = 64;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct Store {
    pool: Pool,
    chambers: ChamberPool,
    changes: broadcast::Sender<StorePath>,
    poll_interval: Duration,
}

impl Store {
    pub fn new(pool: Pool, chambers: ChamberPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            pool,
            chambers,
            changes,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often subscriptions check for writes from other processes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn chambers(&self) -> ChamberPool {
        self.chambers
    }

    fn announce(&self, path: StorePath) {
        // No receivers is fine: nobody is watching.
        let receivers = self.changes.send(path).unwrap_or(0);
        debug!(path = path.as_str(), receivers, "store change");
    }

    pub async fn medications(&self) -> Result<Vec<MedicationRecord>> {
        db::list_medications(&self.pool).await
    }

    pub async fn medication(&self, id: &str) -> Result<Option<MedicationRecord>> {
        db::get_medication(&self.pool, id).await
    }

    pub async fn used_chambers(&self) -> Result<Vec<u8>> {
        db::used_chambers(&self.pool).await
    }

    /// Push new medications, each into the lowest free chamber, atomically.
    pub async fn claim_medications(&self, items: &[NewMedication]) -> Result<ClaimOutcome> {
        let outcome = db::claim_medications(&self.pool, self.chambers, items).await?;
        if let ClaimOutcome::Claimed(records) = &outcome {
            for record in records {
                info!(id = %record.id, chamber = record.chamber, name = %record.name, "medication stored");
            }
            self.announce(StorePath::Medications);
        }
        Ok(outcome)
    }

    pub async fn set_medication(&self, record: &MedicationRecord) -> Result<SetOutcome> {
        let outcome = db::set_medication(&self.pool, record).await?;
        if outcome == SetOutcome::Written {
            self.announce(StorePath::Medications);
        }
        Ok(outcome)
    }

    pub async fn remove_medication(&self, id: &str) -> Result<bool> {
        let removed = db::remove_medication(&self.pool, id).await?;
        if removed {
            info!(id, "medication removed");
            self.announce(StorePath::Medications);
        }
        Ok(removed)
    }

    pub async fn dispenser_status(&self) -> Result<Option<DispenserStatus>> {
        db::get_dispenser_status(&self.pool).await
    }

    pub async fn put_dispenser_status(&self, status: &DispenserStatus) -> Result<()> {
        db::put_dispenser_status(&self.pool, status).await?;
        self.announce(StorePath::PillDispenser);
        Ok(())
    }

    pub async fn record_dispense(
        &self,
        medication_id: Option<&str>,
        successful: bool,
        at: &str,
    ) -> Result<bool> {
        let found = db::record_dispense(&self.pool, medication_id, successful, at).await?;
        self.announce(StorePath::PillDispenser);
        if medication_id.is_some() && found {
            self.announce(StorePath::Medications);
        }
        Ok(found)
    }

    pub async fn append_notification(&self, event: &NotificationEvent, timestamp: i64) -> Result<()> {
        db::insert_notification(&self.pool, event, timestamp).await?;
        self.announce(StorePath::Notifications);
        Ok(())
    }

    pub async fn notifications(&self) -> Result<Vec<NotificationEvent>> {
        db::list_notifications(&self.pool).await
    }

    pub async fn reminder_fires(&self) -> Result<HashMap<String, FiredDose>> {
        db::load_reminder_fires(&self.pool).await
    }

    pub async fn mark_reminder_fired(&self, medication_id: &str, fired: FiredDose) -> Result<()> {
        db::mark_reminder_fired(&self.pool, medication_id, fired).await
    }

    /// Change counter of `path`, shared by every process using the database.
    pub async fn revision(&self, path: StorePath) -> Result<i64> {
        db::store_revision(&self.pool, path).await
    }

    pub async fn snapshot(&self, path: StorePath) -> Result<Snapshot> {
        Ok(match path {
            StorePath::Medications => Snapshot::Medications(self.medications().await?),
            StorePath::PillDispenser => Snapshot::Dispenser(self.dispenser_status().await?),
            StorePath::Notifications => Snapshot::Notifications(self.notifications().await?),
        })
    }

    /// Subscribe to `path`.
    pub fn watch(&self, path: StorePath) -> Subscription {
        Subscription {
            path,
            store: self.clone(),
            rx: self.changes.subscribe(),
            primed: false,
            revision: None,
            poll: None,
        }
    }

    /// Live subscriptions across all paths.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }
}

/// Handle on one store path. Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    path: StorePath,
    store: Store,
    rx: broadcast::Receiver<StorePath>,
    primed: bool,
    /// Last revision this subscription reported.
    revision: Option<i64>,
    poll: Option<Interval>,
}

impl Subscription {
    pub fn path(&self) -> StorePath {
        self.path
    }

    /// Re-read the revision counter. Returns whether it moved since the last
    /// report.
    async fn sync_revision(&mut self) -> bool {
        match self.store.revision(self.path).await {
            Ok(revision) => {
                let moved = self.revision != Some(revision);
                self.revision = Some(revision);
                moved
            }
            Err(err) => {
                warn!(?err, path = self.path.as_str(), "failed to read store revision");
                false
            }
        }
    }

    /// Wait until the path has a value to report: immediately on the first
    /// call, then on each change, whether written by this process or another
    /// one. Returns false once the store is gone. Cancel-safe.
    pub async fn changed(&mut self) -> bool {
        if !self.primed {
            self.primed = true;
            self.sync_revision().await;
            return true;
        }
        loop {
            let period = self.store.poll_interval;
            let poll = self.poll.get_or_insert_with(|| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
            tokio::select! {
                received = self.rx.recv() => match received {
                    Ok(path) if path == self.path => {
                        self.sync_revision().await;
                        return true;
                    }
                    Ok(_) => continue,
                    // Missed changes collapse into one re-read.
                    Err(RecvError::Lagged(_)) => {
                        self.sync_revision().await;
                        return true;
                    }
                    Err(RecvError::Closed) => return false,
                },
                _ = poll.tick() => {
                    if self.sync_revision().await {
                        debug!(path = self.path.as_str(), "external store change");
                        return true;
                    }
                }
            }
        }
    }

    pub async fn current(&self) -> Result<Snapshot> {
        self.store.snapshot(self.path).await
    }

    pub async fn next(&mut self) -> Option<Result<Snapshot>> {
        if !self.changed().await {
            return None;
        }
        Some(self.current().await)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Snapshot>> {
        stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }

    /// Unsubscribe explicitly.
    pub fn cancel(self) {}
}
