use serde::{Deserialize, Serialize};

/// Body of a platform alert, as posted to the webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Options accompanying an alert title.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertOptions {
    pub body: String,
    pub icon: Option<String>,
}
