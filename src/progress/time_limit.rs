use chrono::{DateTime, Utc};

use crate::models::Chain;

use super::reset_group_task_progress;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Result of the on-entry check for a time-limited group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEntry {
    /// No limit configured (or not a group).
    Unlimited,
    TimerStarted,
    TimerRunning,
    /// The window had elapsed; progress and clock were cleared.
    Expired,
}

pub fn is_group_expired(group: &Chain, now: DateTime<Utc>) -> bool {
    group.has_time_limit()
        && group
            .group_expires_at
            .map(|expires_at| now >= expires_at)
            .unwrap_or(false)
}

/// Voids partial progress of an expired group cycle and clears its clock.
/// Returns false if the group is missing or not expired, so repeated sweeps are harmless.
pub fn force_reset_expired_group(chains: &mut [Chain], group_id: &str, now: DateTime<Utc>) -> bool {
    let Some(group) = chains.iter_mut().find(|c| c.id == group_id) else {
        return false;
    };
    if !is_group_expired(group, now) {
        return false;
    }
    group.clear_group_timer();
    let reset = reset_group_task_progress(chains, group_id);
    log_warn!("group {group_id} exceeded its time limit; cleared {reset} unit(s)");
    true
}

/// Active time-limited groups whose window has elapsed.
pub fn expired_group_ids(chains: &[Chain], now: DateTime<Utc>) -> Vec<String> {
    chains
        .iter()
        .filter(|c| !c.is_deleted() && is_group_expired(c, now))
        .map(|c| c.id.clone())
        .collect()
}

/// Expiry check first, then lazy clock start.
pub fn enter_group(chains: &mut [Chain], group_id: &str, now: DateTime<Utc>) -> GroupEntry {
    let Some(group) = chains.iter().find(|c| c.id == group_id) else {
        return GroupEntry::Unlimited;
    };
    if !group.has_time_limit() {
        return GroupEntry::Unlimited;
    }
    if force_reset_expired_group(chains, group_id, now) {
        return GroupEntry::Expired;
    }

    let Some(group) = chains.iter_mut().find(|c| c.id == group_id) else {
        return GroupEntry::Unlimited;
    };
    if group.start_group_timer(now) {
        log_info!("group {group_id} timer started, expires at {:?}", group.group_expires_at);
        GroupEntry::TimerStarted
    } else {
        GroupEntry::TimerRunning
    }
}
