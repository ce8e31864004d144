use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller profile stored alongside a session (the `details` child record).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallerDetails {
    #[serde(default)]
    pub session_code: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl CallerDetails {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none()
    }

    /// Normalized email suitable for a billing-customer lookup.
    pub fn billing_email(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| e.contains('@'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_email_normalizes() {
        let d = CallerDetails {
            email: Some("  Caller@Example.COM ".to_string()),
            ..Default::default()
        };
        assert_eq!(d.billing_email().as_deref(), Some("caller@example.com"));
    }

    #[test]
    fn test_billing_email_rejects_garbage() {
        let d = CallerDetails {
            email: Some("not-an-email".to_string()),
            ..Default::default()
        };
        assert!(d.billing_email().is_none());
        assert!(CallerDetails::default().is_empty());
    }
}
