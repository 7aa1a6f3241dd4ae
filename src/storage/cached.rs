use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;

use crate::models::{ActiveSession, Chain, CompletionHistory, ScheduledSession, TaskTimeStats};
use crate::tree::TreeCache;

use super::Storage;

const ENABLE_LOGS: bool = false;

use crate::log_debug;

/// One cached query. The async lock is held across the fetch, so identical
/// concurrent reads queue behind a single underlying call and share its result.
struct Slot<T> {
    value: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone + Send> Slot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    async fn get_or_fetch<F, Fut>(&self, ttl: Duration, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.value.lock().await;
        if let Some((fetched_at, value)) = guard.as_ref() {
            if fetched_at.elapsed() < ttl {
                return Ok(value.clone());
            }
        }
        let value = fetch().await?;
        *guard = Some((Instant::now(), value.clone()));
        Ok(value)
    }
}

/// Read-through cache over another `Storage`.
///
/// Writes hold the affected slots while they run and clear them before
/// returning, so a read issued after a write's acknowledgement never sees
/// pre-write data. Chain writes also drop the shared tree cache.
pub struct CachedStorage<S> {
    inner: S,
    ttl: Duration,
    tree_cache: Arc<TreeCache>,
    chains: Slot<Vec<Chain>>,
    active_chains: Slot<Vec<Chain>>,
    scheduled: Slot<Vec<ScheduledSession>>,
    history: Slot<Vec<CompletionHistory>>,
}

impl<S: Storage> CachedStorage<S> {
    pub fn new(inner: S, ttl: Duration, tree_cache: Arc<TreeCache>) -> Self {
        Self {
            inner,
            ttl,
            tree_cache,
            chains: Slot::new(),
            active_chains: Slot::new(),
            scheduled: Slot::new(),
            history: Slot::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn tree_cache(&self) -> &Arc<TreeCache> {
        &self.tree_cache
    }
}

impl<S: Storage> Storage for CachedStorage<S> {
    async fn get_chains(&self) -> Result<Vec<Chain>> {
        self.chains
            .get_or_fetch(self.ttl, || self.inner.get_chains())
            .await
    }

    async fn get_active_chains(&self) -> Result<Vec<Chain>> {
        self.active_chains
            .get_or_fetch(self.ttl, || self.inner.get_active_chains())
            .await
    }

    async fn save_chains(&self, chains: Vec<Chain>) -> Result<()> {
        let mut all = self.chains.value.lock().await;
        let mut active = self.active_chains.value.lock().await;
        let result = self.inner.save_chains(chains).await;
        *all = None;
        *active = None;
        self.tree_cache.invalidate();
        log_debug!("chain caches invalidated");
        result
    }

    async fn get_scheduled_sessions(&self) -> Result<Vec<ScheduledSession>> {
        self.scheduled
            .get_or_fetch(self.ttl, || self.inner.get_scheduled_sessions())
            .await
    }

    async fn save_scheduled_sessions(&self, sessions: Vec<ScheduledSession>) -> Result<()> {
        let mut scheduled = self.scheduled.value.lock().await;
        let result = self.inner.save_scheduled_sessions(sessions).await;
        *scheduled = None;
        result
    }

    // The active session changes every pause/resume; always read through.
    async fn get_active_session(&self) -> Result<Option<ActiveSession>> {
        self.inner.get_active_session().await
    }

    async fn save_active_session(&self, session: Option<ActiveSession>) -> Result<()> {
        self.inner.save_active_session(session).await
    }

    async fn get_completion_history(&self) -> Result<Vec<CompletionHistory>> {
        self.history
            .get_or_fetch(self.ttl, || self.inner.get_completion_history())
            .await
    }

    async fn save_completion_history(&self, history: Vec<CompletionHistory>) -> Result<()> {
        let mut cached = self.history.value.lock().await;
        let result = self.inner.save_completion_history(history).await;
        *cached = None;
        result
    }

    async fn update_task_time_stats(&self, chain_id: String, minutes: u32) -> Result<()> {
        self.inner.update_task_time_stats(chain_id, minutes).await
    }

    async fn get_task_time_stats(&self) -> Result<Vec<TaskTimeStats>> {
        self.inner.get_task_time_stats().await
    }

    async fn cleanup_expired_deleted_chains(&self, days: u32) -> Result<Vec<String>> {
        let mut all = self.chains.value.lock().await;
        let mut active = self.active_chains.value.lock().await;
        let mut scheduled = self.scheduled.value.lock().await;
        let mut history = self.history.value.lock().await;
        let result = self.inner.cleanup_expired_deleted_chains(days).await;
        *all = None;
        *active = None;
        *scheduled = None;
        *history = None;
        self.tree_cache.invalidate();
        result
    }

    async fn permanently_delete_chain(&self, id: String) -> Result<bool> {
        let mut all = self.chains.value.lock().await;
        let mut active = self.active_chains.value.lock().await;
        let mut scheduled = self.scheduled.value.lock().await;
        let mut history = self.history.value.lock().await;
        let result = self.inner.permanently_delete_chain(id).await;
        *all = None;
        *active = None;
        *scheduled = None;
        *history = None;
        self.tree_cache.invalidate();
        result
    }
}
