use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::storage::Storage;

use super::SessionController;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const SWEEP_TIMEOUT_SECS: u64 = 30;

/// Owns the two periodic sweeps: session/booking deadlines on a short
/// interval and group time limits on a longer one.
pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sweeper {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start<S: Storage>(
        &mut self,
        controller: SessionController<S>,
        session_interval: Duration,
        group_interval: Duration,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("sweeper already running");
        }
        if session_interval.is_zero() || group_interval.is_zero() {
            bail!("sweep intervals must be non-zero");
        }

        let cancel_token = CancellationToken::new();
        let sessions = session_loop(controller.clone(), session_interval, cancel_token.clone());
        let groups = group_loop(controller, group_interval, cancel_token.clone());
        let handle = tokio::spawn(async move {
            tokio::join!(sessions, groups);
        });

        info!(
            "sweeper started (sessions every {}s, groups every {}s)",
            session_interval.as_secs(),
            group_interval.as_secs()
        );
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("sweeper task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

async fn session_loop<S: Storage>(
    controller: SessionController<S>,
    every: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fut = controller.sweep_sessions();
                match tokio::time::timeout(Duration::from_secs(SWEEP_TIMEOUT_SECS), fut).await {
                    Ok(Ok(sweep)) => {
                        if let Some(outcome) = &sweep.completed {
                            log_info!("countdown for {} ran out; recorded completion", outcome.history.chain_id);
                        }
                        if !sweep.lapsed_bookings.is_empty() {
                            log_info!("failed lapsed bookings: {:?}", sweep.lapsed_bookings);
                        }
                        if !sweep.awaiting_judgment.is_empty() {
                            log_debug!("bookings awaiting judgment: {:?}", sweep.awaiting_judgment);
                        }
                        log_debug!("session sweep done");
                    }
                    Ok(Err(err)) => log_error!("session sweep failed: {err}"),
                    Err(_) => log_warn!("session sweep timeout (> {}s)", SWEEP_TIMEOUT_SECS),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("session sweep loop shutting down");
                break;
            }
        }
    }
}

async fn group_loop<S: Storage>(
    controller: SessionController<S>,
    every: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tokio::time::timeout(Duration::from_secs(SWEEP_TIMEOUT_SECS), controller.sweep_groups()).await {
                    Ok(Ok(reset)) if !reset.is_empty() => {
                        log_info!("reset expired groups: {:?}", reset);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => log_error!("group sweep failed: {err}"),
                    Err(_) => log_warn!("group sweep timeout (> {}s)", SWEEP_TIMEOUT_SECS),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("group sweep loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chain;
    use crate::session::ManualClock;
    use crate::storage::MemoryStorage;
    use crate::tree::TreeCache;
    use chrono::Utc;
    use std::sync::Arc;

    fn controller(storage: &MemoryStorage, clock: Arc<ManualClock>) -> SessionController<MemoryStorage> {
        SessionController::new(Arc::new(storage.clone()), Arc::new(TreeCache::new())).with_clock(clock)
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_joins() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut sweeper = Sweeper::new();

        sweeper
            .start(controller(&storage, clock.clone()), Duration::from_millis(10), Duration::from_millis(10))
            .unwrap();
        assert!(sweeper.is_running());
        assert!(sweeper
            .start(controller(&storage, clock), Duration::from_millis(10), Duration::from_millis(10))
            .is_err());

        sweeper.stop().await.unwrap();
        assert!(!sweeper.is_running());
        sweeper.stop().await.unwrap();
    }

    #[tokio::test]
    async fn overdue_booking_is_failed_in_background() {
        let chain = Chain {
            id: "a".into(),
            ..Chain::default()
        };
        let storage = MemoryStorage::with_chains(vec![chain]);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctl = controller(&storage, clock.clone())
            .with_lapse_grace(Some(chrono::Duration::minutes(1)));
        ctl.schedule_chain("a").await.unwrap();
        clock.advance(chrono::Duration::minutes(20));

        let mut sweeper = Sweeper::new();
        sweeper
            .start(ctl, Duration::from_millis(5), Duration::from_secs(60))
            .unwrap();
        for _ in 0..100 {
            if storage.get_scheduled_sessions().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sweeper.stop().await.unwrap();

        assert!(storage.get_scheduled_sessions().await.unwrap().is_empty());
        let chains = storage.get_chains().await.unwrap();
        assert_eq!(chains[0].auxiliary_failures, 1);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut sweeper = Sweeper::new();
        assert!(sweeper
            .start(controller(&storage, clock), Duration::ZERO, Duration::from_secs(1))
            .is_err());
        assert!(!sweeper.is_running());
    }
}
