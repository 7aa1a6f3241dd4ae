use std::cmp;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ActiveSession, Chain};

/// Point-in-time view of the running session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: ActiveSession,
    pub chain_name: String,
    /// Unpaused time so far.
    pub active_ms: u64,
    /// Countdown: time left (never negative). Forward-timed: same as `active_ms`.
    pub remaining_ms: i64,
}

impl ActiveSession {
    pub fn begin(chain: &Chain, started_at: DateTime<Utc>) -> Self {
        Self {
            chain_id: chain.id.clone(),
            started_at,
            duration: chain.planned_minutes(),
            is_paused: false,
            paused_at: None,
            total_paused_time: 0,
        }
    }

    pub fn is_forward_timed(&self) -> bool {
        self.duration == 0
    }

    /// Key under which the forward timer for this session is registered.
    pub fn forward_timer_key(&self) -> String {
        format!("{}_{}", self.chain_id, self.started_at.timestamp_millis())
    }

    pub fn target_ms(&self) -> u64 {
        u64::from(self.duration) * 60_000
    }

    /// Returns false if already paused.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_paused {
            return false;
        }
        self.is_paused = true;
        self.paused_at = Some(now);
        true
    }

    /// Folds the current pause into `total_paused_time`. Returns false if not paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_paused {
            return false;
        }
        if let Some(paused_at) = self.paused_at.take() {
            self.total_paused_time = self
                .total_paused_time
                .saturating_add(millis_between(paused_at, now));
        }
        self.is_paused = false;
        true
    }

    /// Paused time including a pause still in progress.
    pub fn paused_ms(&self, now: DateTime<Utc>) -> u64 {
        let ongoing = match (self.is_paused, self.paused_at) {
            (true, Some(paused_at)) => millis_between(paused_at, now),
            _ => 0,
        };
        self.total_paused_time.saturating_add(ongoing)
    }

    /// Wall-clock time since start minus paused time.
    pub fn active_ms(&self, now: DateTime<Utc>) -> u64 {
        millis_between(self.started_at, now).saturating_sub(self.paused_ms(now))
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        let active = self.active_ms(now) as i64;
        if self.is_forward_timed() {
            return active;
        }
        cmp::max(self.target_ms() as i64 - active, 0)
    }

    /// Countdown sessions end on their own once unpaused time reaches the target.
    pub fn is_countdown_finished(&self, now: DateTime<Utc>) -> bool {
        !self.is_forward_timed() && !self.is_paused && self.active_ms(now) >= self.target_ms()
    }

    pub fn snapshot(&self, chain_name: &str, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            session: self.clone(),
            chain_name: chain_name.to_string(),
            active_ms: self.active_ms(now),
            remaining_ms: self.remaining_ms(now),
        }
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// Whole minutes, rounded up.
pub fn ceil_minutes(seconds: u64) -> u32 {
    u32::try_from(seconds.div_ceil(60)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(duration: u32) -> (ActiveSession, DateTime<Utc>) {
        let start = Utc::now();
        let chain = Chain {
            id: "c".into(),
            duration,
            is_durationless: duration == 0,
            ..Chain::default()
        };
        (ActiveSession::begin(&chain, start), start)
    }

    #[test]
    fn pause_time_is_excluded_from_elapsed() {
        let (mut s, start) = session(25);
        assert!(s.pause(start + Duration::minutes(5)));
        assert!(!s.pause(start + Duration::minutes(6)));
        assert_eq!(s.active_ms(start + Duration::minutes(8)), 5 * 60_000);

        assert!(s.resume(start + Duration::minutes(10)));
        assert!(!s.resume(start + Duration::minutes(11)));
        assert_eq!(s.total_paused_time, 5 * 60_000);
        assert_eq!(s.paused_at, None);
        assert_eq!(s.active_ms(start + Duration::minutes(12)), 7 * 60_000);
        assert_eq!(s.remaining_ms(start + Duration::minutes(12)), 18 * 60_000);
    }

    #[test]
    fn countdown_finishes_only_when_unpaused_target_reached() {
        let (mut s, start) = session(10);
        assert!(!s.is_countdown_finished(start + Duration::minutes(9)));
        assert!(s.is_countdown_finished(start + Duration::minutes(10)));

        s.pause(start + Duration::minutes(2));
        assert!(!s.is_countdown_finished(start + Duration::minutes(30)));
        assert_eq!(s.remaining_ms(start + Duration::minutes(30)), 8 * 60_000);
    }

    #[test]
    fn forward_timed_reports_elapsed() {
        let (s, start) = session(0);
        assert!(s.is_forward_timed());
        assert!(!s.is_countdown_finished(start + Duration::hours(3)));
        assert_eq!(s.remaining_ms(start + Duration::seconds(90)), 90_000);
    }

    #[test]
    fn forward_timer_key_uses_epoch_millis() {
        let (s, start) = session(0);
        assert_eq!(
            s.forward_timer_key(),
            format!("c_{}", start.timestamp_millis())
        );
    }

    #[test]
    fn minutes_round_up() {
        assert_eq!(ceil_minutes(0), 0);
        assert_eq!(ceil_minutes(60), 1);
        assert_eq!(ceil_minutes(61), 2);
        assert_eq!(ceil_minutes(125), 3);
    }
}
