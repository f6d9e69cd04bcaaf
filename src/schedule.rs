//! Daily dose matching.
//!
//! A medication's trigger is `hour:minute` local time on every day of its
//! window. [`MatchPolicy::ExactMinute`] only matches during that minute; a
//! grace period keeps a dose due for a few more minutes so an evaluation that
//! misses the exact minute still fires. [`DoseScheduler`] makes each dose fire
//! at most once per day.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::{MedicationRecord, NotificationDraft, NotificationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    ExactMinute,
    Grace { minutes: u32 },
}

impl MatchPolicy {
    pub fn from_grace_minutes(minutes: u32) -> Self {
        if minutes == 0 {
            MatchPolicy::ExactMinute
        } else {
            MatchPolicy::Grace { minutes }
        }
    }

    fn grace(&self) -> i64 {
        match self {
            MatchPolicy::ExactMinute => 0,
            MatchPolicy::Grace { minutes } => i64::from(*minutes),
        }
    }
}

/// Whether `day` falls inside the record's `[from_date, to_date]` window.
/// Missing bounds are open.
pub fn is_active_on(record: &MedicationRecord, day: NaiveDate) -> bool {
    if let Some(from) = record.from_date {
        if day < from {
            return false;
        }
    }
    if let Some(to) = record.to_date {
        if day > to {
            return false;
        }
    }
    true
}

fn trigger_time(record: &MedicationRecord) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(u32::from(record.hour), u32::from(record.minute), 0)
}

/// The day whose dose is due at `now`, if any.
///
/// With a grace period crossing midnight, a dose triggered late yesterday can
/// still be due just after midnight; the window is checked against the
/// trigger's day, not `now`'s.
pub fn due_day(record: &MedicationRecord, now: NaiveDateTime, policy: MatchPolicy) -> Option<NaiveDate> {
    let trigger = trigger_time(record)?;
    let today = now.date();
    let span = Duration::minutes(policy.grace() + 1);

    let candidates = [Some(today), today.pred_opt()];
    candidates.into_iter().flatten().find(|day| {
        let at = day.and_time(trigger);
        now >= at && now < at + span && is_active_on(record, *day)
    })
}

pub fn is_due(record: &MedicationRecord, now: NaiveDateTime, policy: MatchPolicy) -> bool {
    due_day(record, now, policy).is_some()
}

/// `h:mm`, the way the dashboard prints dose times.
pub fn format_dose_time(hour: u8, minute: u8) -> String {
    format!("{}:{:02}", hour, minute)
}

pub fn reminder_draft(record: &MedicationRecord) -> NotificationDraft {
    let at = format_dose_time(record.hour, record.minute);
    NotificationDraft {
        kind: NotificationKind::Reminder,
        title: format!("Time to take {}", record.name),
        message: format!("Your {} dose is ready", at),
        time: format!("{} • Today", at),
    }
}

/// One fired dose: the trigger day and the time it fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredDose {
    pub day: NaiveDate,
    pub hour: u8,
    pub minute: u8,
}

impl FiredDose {
    pub fn of(record: &MedicationRecord, day: NaiveDate) -> Self {
        Self {
            day,
            hour: record.hour,
            minute: record.minute,
        }
    }
}

/// Remembers the last dose fired per medication. A dose moved to a new time
/// on the same day counts as a new dose.
#[derive(Debug, Clone)]
pub struct DoseScheduler {
    policy: MatchPolicy,
    last_fired: HashMap<String, FiredDose>,
}

impl DoseScheduler {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            last_fired: HashMap::new(),
        }
    }

    /// Seed with fires recorded by an earlier run.
    pub fn with_history(policy: MatchPolicy, history: HashMap<String, FiredDose>) -> Self {
        Self {
            policy,
            last_fired: history,
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn last_fired(&self, medication_id: &str) -> Option<FiredDose> {
        self.last_fired.get(medication_id).copied()
    }

    /// Records due at `now` that have not fired for their dose day yet. Marks
    /// them fired; returns each with its dose day.
    pub fn collect_due<'a>(
        &mut self,
        records: &'a [MedicationRecord],
        now: NaiveDateTime,
    ) -> Vec<(&'a MedicationRecord, NaiveDate)> {
        let policy = self.policy();
        let mut due = Vec::new();
        for record in records {
            let Some(day) = due_day(record, now, policy) else {
                continue;
            };
            let fired = FiredDose::of(record, day);
            if self.last_fired.get(&record.id) == Some(&fired) {
                continue;
            }
            self.last_fired.insert(record.id.clone(), fired);
            due.push((record, day));
        }
        due
    }

    /// Drop history for medications that no longer exist.
    pub fn retain_known(&mut self, records: &[MedicationRecord]) {
        self.last_fired
            .retain(|id, _| records.iter().any(|r| &r.id == id));
    }
}
