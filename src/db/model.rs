//! Row models used by repositories.
//!
//! Rows mirror the SQLite columns; conversion into domain types checks the
//! ranges SQLite stores as plain integers.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use sqlx::FromRow;

use crate::model::{DispenserStatus, MedicationRecord, NotificationEvent, NotificationKind};

#[derive(Debug, Clone, FromRow)]
pub struct MedicationRow {
    pub id: String,
    pub name: String,
    pub pills: i64,
    pub chamber: i64,
    pub hour: i64,
    pub minute: i64,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub conditions: Option<String>,
    pub dispensed: bool,
    pub last_dispensed: Option<String>,
}

impl TryFrom<MedicationRow> for MedicationRecord {
    type Error = anyhow::Error;

    fn try_from(row: MedicationRow) -> Result<Self> {
        let id = row.id;
        let narrow = |field: &str, value: i64| {
            u8::try_from(value)
                .map_err(|_| anyhow!("medication {} has out-of-range {} {}", id, field, value))
        };
        let chamber = narrow("chamber", row.chamber)?;
        let hour = narrow("hour", row.hour)?;
        let minute = narrow("minute", row.minute)?;
        let pills = u32::try_from(row.pills)
            .map_err(|_| anyhow!("medication {} has invalid pills {}", id, row.pills))?;
        Ok(MedicationRecord {
            id,
            name: row.name,
            pills,
            chamber,
            hour,
            minute,
            from_date: row.from_date,
            to_date: row.to_date,
            conditions: row.conditions,
            dispensed: row.dispensed,
            last_dispensed: row.last_dispensed,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DispenserRow {
    pub is_online: bool,
    pub last_dispense_time: Option<String>,
    pub last_dispense_successful: bool,
}

impl From<DispenserRow> for DispenserStatus {
    fn from(row: DispenserRow) -> Self {
        DispenserStatus {
            is_online: row.is_online,
            last_dispense_time: row.last_dispense_time,
            last_dispense_successful: row.last_dispense_successful,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRow {
    pub id: i64,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub time: String,
    pub read: bool,
}

impl TryFrom<NotificationRow> for NotificationEvent {
    type Error = anyhow::Error;

    fn try_from(row: NotificationRow) -> Result<Self> {
        let kind = NotificationKind::parse_kind(&row.kind)
            .ok_or_else(|| anyhow!("notification {} has unknown type {}", row.id, row.kind))?;
        Ok(NotificationEvent {
            id: row.id,
            kind,
            title: row.title,
            message: row.message,
            time: row.time,
            read: row.read,
        })
    }
}

/// Result of claiming chambers for new medications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Vec<MedicationRecord>),
    NoCapacity,
}

/// Result of overwriting a medication at its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Written,
    ChamberTaken,
}
