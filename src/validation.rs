//! Medication form rows and their validation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::DoseError;
use crate::model::NewMedication;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Raw values of one form row, as typed by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MedicationForm {
    pub name: Option<String>,
    pub pills: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub conditions: Option<String>,
}

fn filled(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, DoseError> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DoseError::Validation(format!("{} is required", name)))
}

fn parse_in_range(value: &str, name: &str, min: u32, max: u32) -> Result<u32, DoseError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| {
            DoseError::Validation(format!("{} must be a whole number from {} to {}", name, min, max))
        })
}

fn parse_date(value: &str, name: &str) -> Result<NaiveDate, DoseError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| DoseError::Validation(format!("{} must be a date like 2024-01-31", name)))
}

impl MedicationForm {
    /// Any field other than conditions has a value.
    pub fn has_any_data(&self) -> bool {
        [
            &self.name,
            &self.pills,
            &self.hour,
            &self.minute,
            &self.from_date,
            &self.to_date,
        ]
        .into_iter()
        .any(filled)
    }

    /// Every required field has a value.
    pub fn is_complete(&self) -> bool {
        [
            &self.name,
            &self.pills,
            &self.hour,
            &self.minute,
            &self.from_date,
            &self.to_date,
        ]
        .into_iter()
        .all(filled)
    }

    pub fn validate(&self) -> Result<NewMedication, DoseError> {
        let name = required(&self.name, "name")?;
        let pills = parse_in_range(required(&self.pills, "pills")?, "pills", 1, u32::MAX)?;
        let hour = parse_in_range(required(&self.hour, "hour")?, "hour", 0, 23)?;
        let minute = parse_in_range(required(&self.minute, "minute")?, "minute", 0, 59)?;
        let from_date = parse_date(required(&self.from_date, "from date")?, "from date")?;
        let to_date = parse_date(required(&self.to_date, "to date")?, "to date")?;
        if to_date < from_date {
            return Err(DoseError::Validation(
                "to date must not be before from date".to_string(),
            ));
        }
        let conditions = self
            .conditions
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(NewMedication {
            name: name.to_string(),
            pills,
            hour: hour as u8,
            minute: minute as u8,
            from_date: Some(from_date),
            to_date: Some(to_date),
            conditions,
        })
    }
}
