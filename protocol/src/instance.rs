use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ContactRecord;
use crate::SessionState;

/// Point-in-time view of one instance, enriched with its live contact list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: i32,
    pub session_state: SessionState,
    /// Alternative login URLs; only populated while awaiting login.
    pub login_artifacts: Vec<String>,
    pub display_name: String,
    /// Avatar of the logged in account, taken from the first contact.
    pub avatar_url: String,
    pub contacts: Vec<ContactRecord>,
    pub log_tail: String,
    pub agent_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_clear_at: Option<DateTime<Utc>>,
}
