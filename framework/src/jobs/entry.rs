use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::JobError;

/// One email-send request as it travels through the broker.
///
/// Wire format: `{"purpose": "...", "email": "...", "replacements": {"KEY": "value"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    /// Selects the template, see [`template_for_purpose`](crate::mail::template_for_purpose).
    pub purpose: String,
    /// Recipient address.
    #[serde(rename = "email")]
    pub recipient: String,
    /// Placeholder name to replacement text, applied to the template body.
    #[serde(default)]
    pub replacements: HashMap<String, String>,
}

impl EmailJob {
    pub fn new(purpose: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            recipient: recipient.into(),
            replacements: HashMap::new(),
        }
    }

    /// Add a placeholder replacement.
    pub fn replace(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.replacements.insert(key.into(), value.into());
        self
    }

    /// Decode a broker payload.
    pub fn decode(payload: &str) -> Result<Self, JobError> {
        Ok(serde_json::from_str(payload)?)
    }
}
