use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-email plan record written by billing webhooks and admin actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrgEntitlement {
    pub email: String,
    pub org_id: Option<String>,
    pub plan: String,
    pub status: String,
    pub stripe_customer_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OrgEntitlement {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }
}
