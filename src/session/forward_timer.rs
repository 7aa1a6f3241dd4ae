use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Stopwatch service for durationless sessions, keyed by
/// `ActiveSession::forward_timer_key`.
pub trait ForwardTimer: Send + Sync {
    fn start_timer(&self, key: &str);
    fn pause_timer(&self, key: &str);
    fn resume_timer(&self, key: &str);
    /// Stops and forgets the timer, returning elapsed unpaused seconds.
    fn stop_timer(&self, key: &str) -> Option<u64>;
    fn clear_timer(&self, key: &str);
}

#[derive(Debug, Clone, Copy)]
struct Stopwatch {
    /// Time accumulated from earlier running windows; combines with
    /// `running_anchor` to give the true elapsed duration.
    elapsed_ms_baseline: u64,
    running_anchor: Option<Instant>,
}

impl Stopwatch {
    fn started(now: Instant) -> Self {
        Self {
            elapsed_ms_baseline: 0,
            running_anchor: Some(now),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        match self.running_anchor {
            Some(anchor) => self
                .elapsed_ms_baseline
                .saturating_add(anchor.elapsed().as_millis() as u64),
            None => self.elapsed_ms_baseline,
        }
    }

    fn pause(&mut self) {
        self.elapsed_ms_baseline = self.elapsed_ms();
        self.running_anchor = None;
    }

    fn resume(&mut self, now: Instant) {
        if self.running_anchor.is_none() {
            self.running_anchor = Some(now);
        }
    }
}

/// In-process monotonic forward timers.
#[derive(Debug, Default)]
pub struct ForwardTimerRegistry {
    timers: Mutex<HashMap<String, Stopwatch>>,
}

impl ForwardTimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_secs(&self, key: &str) -> Option<u64> {
        self.lock().get(key).map(|w| w.elapsed_ms() / 1000)
    }

    pub fn is_tracking(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stopwatch>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ForwardTimer for ForwardTimerRegistry {
    fn start_timer(&self, key: &str) {
        self.lock()
            .insert(key.to_string(), Stopwatch::started(Instant::now()));
    }

    fn pause_timer(&self, key: &str) {
        if let Some(watch) = self.lock().get_mut(key) {
            watch.pause();
        }
    }

    fn resume_timer(&self, key: &str) {
        if let Some(watch) = self.lock().get_mut(key) {
            watch.resume(Instant::now());
        }
    }

    fn stop_timer(&self, key: &str) -> Option<u64> {
        self.lock().remove(key).map(|w| w.elapsed_ms() / 1000)
    }

    fn clear_timer(&self, key: &str) {
        self.lock().remove(key);
    }
}
