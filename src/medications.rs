//! Medication management: the operations behind the add, dose and list forms.

use std::collections::BTreeSet;

use tracing::{info, instrument, warn};

use crate::allocator::ChamberPool;
use crate::db::{ClaimOutcome, SetOutcome};
use crate::error::DoseError;
use crate::model::MedicationRecord;
use crate::store::Store;
use crate::validation::MedicationForm;

/// Result of a multi-row submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: Vec<MedicationRecord>,
    /// Rows with some but not all required fields; skipped without error.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct MedicationService {
    store: Store,
}

impl MedicationService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn pool(&self) -> ChamberPool {
        self.store.chambers()
    }

    pub async fn list(&self) -> Result<Vec<MedicationRecord>, DoseError> {
        Ok(self.store.medications().await?)
    }

    pub async fn available_chambers(&self) -> Result<BTreeSet<u8>, DoseError> {
        let used = self.store.used_chambers().await?;
        Ok(self.pool().available(used))
    }

    /// Chamber the next added medication would get, as shown on the form.
    pub async fn next_chamber(&self) -> Result<u8, DoseError> {
        let used = self.store.used_chambers().await?;
        self.pool().next_chamber(used)
    }

    /// Add one medication from the single-entry form.
    #[instrument(skip_all)]
    pub async fn add_medication(&self, form: &MedicationForm) -> Result<MedicationRecord, DoseError> {
        let new = form.validate()?;
        match self.store.claim_medications(std::slice::from_ref(&new)).await? {
            ClaimOutcome::Claimed(mut records) => records.pop().ok_or_else(|| {
                DoseError::Store(anyhow::anyhow!("claim returned no record"))
            }),
            ClaimOutcome::NoCapacity => {
                warn!(name = %new.name, "no free chamber");
                Err(DoseError::NoCapacity)
            }
        }
    }

    /// Submit the multi-row dose form. Incomplete rows are dropped; the
    /// remaining rows are saved together or not at all.
    #[instrument(skip_all, fields(rows = forms.len()))]
    pub async fn submit_batch(&self, forms: &[MedicationForm]) -> Result<BatchOutcome, DoseError> {
        if !forms.iter().any(MedicationForm::has_any_data) {
            return Err(DoseError::Validation(
                "Please fill in at least one medicine's details".to_string(),
            ));
        }

        let complete: Vec<&MedicationForm> = forms.iter().filter(|f| f.is_complete()).collect();
        let dropped = forms.iter().filter(|f| f.has_any_data()).count() - complete.len();
        let items = complete
            .into_iter()
            .map(MedicationForm::validate)
            .collect::<Result<Vec<_>, _>>()?;

        if items.is_empty() {
            info!(dropped, "no complete rows to save");
            return Ok(BatchOutcome {
                saved: Vec::new(),
                dropped,
            });
        }

        match self.store.claim_medications(&items).await? {
            ClaimOutcome::Claimed(saved) => {
                info!(saved = saved.len(), dropped, "batch saved");
                Ok(BatchOutcome { saved, dropped })
            }
            ClaimOutcome::NoCapacity => {
                warn!(rows = items.len(), "not enough free chambers for batch");
                Err(DoseError::NoCapacity)
            }
        }
    }

    /// Overwrite a medication's fields. The chamber must belong to the pool
    /// and not be held by another medication.
    #[instrument(skip_all, fields(id = %record.id))]
    pub async fn update_medication(&self, record: &MedicationRecord) -> Result<(), DoseError> {
        if !self.pool().contains(record.chamber) {
            return Err(DoseError::Validation(format!(
                "chamber must be between 1 and {}",
                self.pool().size()
            )));
        }
        if record.name.trim().is_empty() || record.pills == 0 || record.hour > 23 || record.minute > 59 {
            return Err(DoseError::Validation("medication fields are out of range".to_string()));
        }
        if let (Some(from), Some(to)) = (record.from_date, record.to_date) {
            if to < from {
                return Err(DoseError::Validation(
                    "to date must not be before from date".to_string(),
                ));
            }
        }
        if self.store.medication(&record.id).await?.is_none() {
            return Err(DoseError::NotFound(record.id.clone()));
        }
        match self.store.set_medication(record).await? {
            SetOutcome::Written => Ok(()),
            SetOutcome::ChamberTaken => Err(DoseError::ChamberTaken(record.chamber)),
        }
    }

    /// Delete a medication, freeing its chamber.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn delete_medication(&self, id: &str) -> Result<(), DoseError> {
        if self.store.remove_medication(id).await? {
            Ok(())
        } else {
            Err(DoseError::NotFound(id.to_string()))
        }
    }
}
