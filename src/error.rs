use thiserror::Error;

#[derive(Debug, Error)]
pub enum DoseError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("All chambers are occupied")]
    NoCapacity,
    #[error("Medication not found: {0}")]
    NotFound(String),
    #[error("Chamber {0} is already assigned")]
    ChamberTaken(u8),
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl DoseError {
    /// Text for the blocking alert shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            DoseError::Validation(msg) => msg.clone(),
            DoseError::NoCapacity => {
                "All chambers are occupied. Remove a medication first.".to_string()
            }
            DoseError::NotFound(_) => "That medication no longer exists.".to_string(),
            DoseError::ChamberTaken(chamber) => {
                format!("Chamber {} is already in use.", chamber)
            }
            DoseError::Store(_) => "Failed to save medication. Please try again.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn store_failures_get_a_generic_message() {
        let err = DoseError::from(anyhow!("disk I/O error"));
        assert_eq!(err.user_message(), "Failed to save medication. Please try again.");
        assert!(err.to_string().contains("disk I/O error"));
    }

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err = DoseError::Validation("name is required".into());
        assert_eq!(err.user_message(), "name is required");
    }
}
