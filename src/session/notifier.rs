use log::{info, warn};

use crate::models::{Chain, ScheduledSession};

/// Outbound user notifications. Delivery is best effort; implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify_task_completed(&self, chain: &Chain, minutes: u32);
    fn notify_task_failed(&self, chain: &Chain, reason: &str);
    fn notify_schedule_failed(&self, chain: &Chain);
    /// A pending booking was fulfilled by starting the chain.
    fn notify_auxiliary_completed(&self, _chain: &Chain) {}
    /// A booking expired unfulfilled and waits for a fail or allow judgment.
    fn notify_judgment_needed(&self, _chain: &Chain, _booking: &ScheduledSession) {}
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_task_completed(&self, chain: &Chain, minutes: u32) {
        info!(
            "'{}' completed after {} min (streak #{})",
            chain.name, minutes, chain.current_streak
        );
    }

    fn notify_task_failed(&self, chain: &Chain, reason: &str) {
        warn!("'{}' failed: {}", chain.name, reason);
    }

    fn notify_schedule_failed(&self, chain: &Chain) {
        warn!(
            "booking for '{}' lapsed; auxiliary streak reset",
            chain.name
        );
    }

    fn notify_judgment_needed(&self, chain: &Chain, booking: &ScheduledSession) {
        warn!(
            "booking for '{}' expired at {} without a start; judge it to settle",
            chain.name, booking.expires_at
        );
    }

    fn notify_auxiliary_completed(&self, chain: &Chain) {
        info!(
            "booking for '{}' fulfilled (auxiliary streak #{})",
            chain.name, chain.auxiliary_streak
        );
    }
}
