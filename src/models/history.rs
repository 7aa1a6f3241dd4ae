use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only outcome record for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionHistory {
    pub id: String,
    pub chain_id: String,
    pub completed_at: DateTime<Utc>,
    /// Planned minutes.
    pub duration: u32,
    /// Measured minutes (forward-timed chains) or the planned value.
    pub actual_duration: u32,
    pub was_successful: bool,
    pub reason_for_failure: Option<String>,
    pub is_forward_timed: bool,
    pub description: Option<String>,
    pub notes: Option<String>,
}

/// Cumulative focus time for one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTimeStats {
    pub chain_id: String,
    pub total_minutes: u64,
    pub session_count: u32,
    pub last_updated: DateTime<Utc>,
}
