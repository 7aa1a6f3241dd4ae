use chrono::{DateTime, Utc};

use crate::models::Chain;
use crate::tree::descendant_ids;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Closes a finished group cycle: bumps the group's own counters, then
/// resets every descendant unit so the next cycle starts fresh.
pub fn increment_group_completion_count(
    chains: &mut [Chain],
    group_id: &str,
    now: DateTime<Utc>,
) -> bool {
    if !mark_group_cycle_completed(chains, group_id, now) {
        return false;
    }
    let reset = reset_group_task_progress(chains, group_id);
    log_info!("group {group_id}: reset {reset} unit(s) for the next cycle");
    true
}

/// Bumps a finished group's counters and clears its time-limit clock without
/// touching its units. Used for a nested group whose enclosing group is still
/// in progress; the enclosing cycle resets those units when it closes.
pub fn mark_group_cycle_completed(chains: &mut [Chain], group_id: &str, now: DateTime<Utc>) -> bool {
    let Some(group) = chains.iter_mut().find(|c| c.id == group_id) else {
        log_warn!("cannot close cycle: group {group_id} not found");
        return false;
    };
    group.current_streak += 1;
    group.total_completions += 1;
    group.last_completed_at = Some(now);
    group.clear_group_timer();
    log_info!(
        "group {group_id} completed a cycle (streak {})",
        group.current_streak
    );
    true
}

/// Zeroes `current_streak` on every non-group descendant. Nested group
/// records are walked through but their own counters are left alone.
pub fn reset_group_task_progress(chains: &mut [Chain], group_id: &str) -> usize {
    let ids = descendant_ids(chains, group_id);
    let mut reset = 0;
    for chain in chains
        .iter_mut()
        .filter(|c| !c.is_group() && ids.contains(&c.id))
    {
        chain.current_streak = 0;
        reset += 1;
    }
    reset
}

/// Breaks the group's own streak after a failed unit. Child progress is kept
/// so the group can be resumed where it stopped.
pub fn reset_group_completion_count(chains: &mut [Chain], group_id: &str) -> bool {
    let Some(group) = chains.iter_mut().find(|c| c.id == group_id) else {
        log_warn!("cannot fail cycle: group {group_id} not found");
        return false;
    };
    group.current_streak = 0;
    group.total_failures += 1;
    true
}
