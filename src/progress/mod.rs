//! Group progress queries and group-cycle transitions.
//!
//! Two progress notions coexist:
//! - repeat progress counts individual repetitions (`min(streak, repeat)` per unit);
//! - unit progress counts units that are fully done for the current cycle.
//!
//! The user-facing "X/Y completed" figure is unit progress.

mod cycle;
mod time_limit;

use serde::Serialize;

use crate::models::ChainTreeNode;

pub use cycle::{
    increment_group_completion_count, mark_group_cycle_completed, reset_group_completion_count,
    reset_group_task_progress,
};
pub use time_limit::{enter_group, expired_group_ids, force_reset_expired_group, is_group_expired, GroupEntry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupProgress {
    pub completed: u32,
    pub total: u32,
}

impl std::ops::Add for GroupProgress {
    type Output = GroupProgress;

    fn add(self, other: GroupProgress) -> GroupProgress {
        GroupProgress {
            completed: self.completed + other.completed,
            total: self.total + other.total,
        }
    }
}

impl std::iter::Sum for GroupProgress {
    fn sum<I: Iterator<Item = GroupProgress>>(iter: I) -> Self {
        iter.fold(GroupProgress::default(), |acc, p| acc + p)
    }
}

/// Repetitions done out of repetitions required.
pub fn get_group_progress(node: &ChainTreeNode) -> GroupProgress {
    if node.is_group() {
        return node.children.iter().map(get_group_progress).sum();
    }
    let total = node.chain.repeat_count();
    GroupProgress {
        completed: node.chain.current_streak.min(total),
        total,
    }
}

/// Units fully done out of units that exist.
pub fn get_group_unit_progress(node: &ChainTreeNode) -> GroupProgress {
    if node.is_group() {
        return node.children.iter().map(get_group_unit_progress).sum();
    }
    GroupProgress {
        completed: u32::from(node.chain.is_unit_complete()),
        total: 1,
    }
}

/// First unfinished unit in depth-first, sort-order sequence.
pub fn get_next_unit_in_group(node: &ChainTreeNode) -> Option<&ChainTreeNode> {
    if !node.is_group() {
        return (!node.chain.is_unit_complete()).then_some(node);
    }
    node.children.iter().find_map(get_next_unit_in_group)
}

/// A group is complete when every descendant unit is. An empty group counts as complete.
pub fn is_group_fully_completed(node: &ChainTreeNode) -> bool {
    if !node.is_group() {
        return node.chain.is_unit_complete();
    }
    node.children.iter().all(is_group_fully_completed)
}
