use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A scheduled medication occupying one dispenser chamber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationRecord {
    pub id: String,
    pub name: String,
    pub pills: u32,
    pub chamber: u8,
    pub hour: u8,
    pub minute: u8,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub conditions: Option<String>,
    pub dispensed: bool,
    pub last_dispensed: Option<String>,
}

/// Validated input for a medication that has not been assigned an id or a
/// chamber yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMedication {
    pub name: String,
    pub pills: u32,
    pub hour: u8,
    pub minute: u8,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub conditions: Option<String>,
}

impl NewMedication {
    pub fn into_record(self, id: String, chamber: u8) -> MedicationRecord {
        MedicationRecord {
            id,
            name: self.name,
            pills: self.pills,
            chamber,
            hour: self.hour,
            minute: self.minute,
            from_date: self.from_date,
            to_date: self.to_date,
            conditions: self.conditions,
            dispensed: false,
            last_dispensed: None,
        }
    }
}

/// Status document written by the dispenser device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispenserStatus {
    pub is_online: bool,
    pub last_dispense_time: Option<String>,
    pub last_dispense_successful: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Reminder,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Reminder => "reminder",
            NotificationKind::System => "system",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "reminder" => Some(NotificationKind::Reminder),
            "system" => Some(NotificationKind::System),
            _ => None,
        }
    }
}

/// A notification shown in the panel. `id` is a millisecond timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub time: String,
    pub read: bool,
}

/// Notification content before the emitter stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub time: String,
}

/// Logical paths of the store. Writes announce the path they touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorePath {
    Medications,
    PillDispenser,
    Notifications,
}

impl StorePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorePath::Medications => "medications",
            StorePath::PillDispenser => "pillDispenser",
            StorePath::Notifications => "notifications",
        }
    }
}

/// Value of a store path at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Medications(Vec<MedicationRecord>),
    Dispenser(Option<DispenserStatus>),
    Notifications(Vec<NotificationEvent>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medication_serializes_with_camel_case_fields() {
        let record = NewMedication {
            name: "Aspirin".into(),
            pills: 2,
            hour: 8,
            minute: 0,
            from_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            to_date: NaiveDate::from_ymd_opt(2024, 1, 10),
            conditions: None,
        }
        .into_record("m1".into(), 3);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["fromDate"], "2024-01-01");
        assert_eq!(value["toDate"], "2024-01-10");
        assert_eq!(value["chamber"], 3);
        assert_eq!(value["dispensed"], false);
        assert!(value["lastDispensed"].is_null());
    }

    #[test]
    fn notification_kind_uses_type_field() {
        let event = NotificationEvent {
            id: 1,
            kind: NotificationKind::System,
            title: "t".into(),
            message: "m".into(),
            time: "now".into(),
            read: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(NotificationKind::parse_kind("reminder"), Some(NotificationKind::Reminder));
        assert_eq!(NotificationKind::parse_kind("other"), None);
    }
}
