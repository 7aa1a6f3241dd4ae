//! Booking and focus-session records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Chain;

/// A pending booking. One per chain at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSession {
    pub chain_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub auxiliary_signal: String,
}

impl ScheduledSession {
    pub fn for_chain(chain: &Chain, now: DateTime<Utc>) -> Self {
        Self {
            chain_id: chain.id.clone(),
            scheduled_at: now,
            expires_at: now + Duration::minutes(i64::from(chain.auxiliary_duration)),
            auxiliary_signal: chain.auxiliary_signal.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Identifies this booking instance; a rebooking of the chain gets a new key.
    pub fn key(&self) -> String {
        format!("{}@{}", self.chain_id, self.scheduled_at.timestamp_millis())
    }
}

/// The running focus timer. At most one exists process-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub chain_id: String,
    pub started_at: DateTime<Utc>,
    /// Planned minutes; 0 for durationless chains.
    pub duration: u32,
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    /// Accumulated paused milliseconds, excluding the current pause.
    pub total_paused_time: u64,
}
