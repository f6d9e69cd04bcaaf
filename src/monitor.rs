use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::emitter::NotificationCenter;
use crate::model::{
    DispenserStatus, MedicationRecord, NotificationDraft, NotificationKind, Snapshot, StorePath,
};
use crate::schedule::{reminder_draft, DoseScheduler, FiredDose, MatchPolicy};
use crate::store::Store;

/// System alerts raised by a dispenser status document.
pub fn dispenser_alerts(status: &DispenserStatus, now: NaiveDateTime) -> Vec<NotificationDraft> {
    let mut alerts = Vec::new();
    if !status.is_online {
        alerts.push(NotificationDraft {
            kind: NotificationKind::System,
            title: "Dispenser Offline".to_string(),
            message: "Your dispenser is currently offline".to_string(),
            time: now.format("%-I:%M:%S %p").to_string(),
        });
    }
    if let Some(at) = status.last_dispense_time.as_deref() {
        if !status.last_dispense_successful {
            alerts.push(NotificationDraft {
                kind: NotificationKind::System,
                title: "Dispense Failed".to_string(),
                message: format!("Last dispense attempt at {} failed", at),
                time: at.to_string(),
            });
        }
    }
    alerts
}

/// Watches medications and dispenser status and raises notifications.
#[derive(Debug)]
pub struct DoseMonitor {
    store: Store,
    scheduler: DoseScheduler,
    center: NotificationCenter,
    tick: Duration,
    /// Last dispenser document evaluated; an unchanged document raises nothing.
    last_dispenser: Option<DispenserStatus>,
}

impl DoseMonitor {
    /// Build a monitor, seeding the scheduler with fires recorded earlier.
    pub async fn new(
        store: Store,
        center: NotificationCenter,
        policy: MatchPolicy,
        tick: Duration,
    ) -> Result<Self> {
        let history = store.reminder_fires().await?;
        Ok(Self {
            store,
            scheduler: DoseScheduler::with_history(policy, history),
            center,
            tick,
            last_dispenser: None,
        })
    }

    pub fn center(&self) -> &NotificationCenter {
        &self.center
    }

    pub fn center_mut(&mut self) -> &mut NotificationCenter {
        &mut self.center
    }

    pub fn scheduler(&self) -> &DoseScheduler {
        &self.scheduler
    }

    /// Fire reminders due at `now`. Returns how many fired.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn check_medications(
        &mut self,
        records: &[MedicationRecord],
        now: NaiveDateTime,
    ) -> usize {
        self.scheduler.retain_known(records);
        let due: Vec<_> = self
            .scheduler
            .collect_due(records, now)
            .into_iter()
            .map(|(record, day)| (record.clone(), day))
            .collect();

        for (record, day) in &due {
            info!(id = %record.id, name = %record.name, %day, "dose due");
            self.center.emit(reminder_draft(record)).await;
            let fired = FiredDose::of(record, *day);
            if let Err(err) = self.store.mark_reminder_fired(&record.id, fired).await {
                warn!(?err, id = %record.id, "failed to record reminder fire");
            }
        }
        due.len()
    }

    /// Raise alerts for a dispenser snapshot that differs from the last one
    /// seen. Returns how many fired.
    pub async fn check_dispenser(
        &mut self,
        status: Option<&DispenserStatus>,
        now: NaiveDateTime,
    ) -> usize {
        if self.last_dispenser.as_ref() == status {
            return 0;
        }
        self.last_dispenser = status.cloned();
        let Some(status) = status else {
            return 0;
        };
        let alerts = dispenser_alerts(status, now);
        let count = alerts.len();
        for alert in alerts {
            self.center.emit(alert).await;
        }
        count
    }

    async fn evaluate(&mut self, snapshot: Snapshot, now: NaiveDateTime) {
        match snapshot {
            Snapshot::Medications(records) => {
                self.check_medications(&records, now).await;
            }
            Snapshot::Dispenser(status) => {
                self.check_dispenser(status.as_ref(), now).await;
            }
            Snapshot::Notifications(_) => {}
        }
    }

    async fn refresh(&mut self, path: StorePath) {
        match self.store.snapshot(path).await {
            Ok(snapshot) => self.evaluate(snapshot, Local::now().naive_local()).await,
            Err(err) => error!(?err, path = path.as_str(), "failed to read store"),
        }
    }

    /// Run until `shutdown` fires. Subscriptions are dropped on return.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<Self> {
        let mut medications = self.store.watch(StorePath::Medications);
        let mut dispenser = self.store.watch(StorePath::PillDispenser);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_ms = self.tick.as_millis() as u64, "dose monitor started");
        loop {
            tokio::select! {
                changed = medications.changed() => {
                    if !changed {
                        break;
                    }
                    self.refresh(StorePath::Medications).await;
                }
                changed = dispenser.changed() => {
                    if !changed {
                        break;
                    }
                    self.refresh(StorePath::PillDispenser).await;
                }
                _ = ticker.tick() => {
                    self.refresh(StorePath::Medications).await;
                }
                _ = shutdown.cancelled() => {
                    info!("dose monitor shutting down");
                    break;
                }
            }
        }
        Ok(self)
    }
}
