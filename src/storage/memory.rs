use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::models::{ActiveSession, Chain, CompletionHistory, ScheduledSession, TaskTimeStats};
use crate::tree::descendant_ids;

use super::Storage;

#[derive(Default)]
struct MemoryState {
    chains: Vec<Chain>,
    scheduled: Vec<ScheduledSession>,
    active: Option<ActiveSession>,
    history: Vec<CompletionHistory>,
    stats: Vec<TaskTimeStats>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
    fail_scheduled_writes: AtomicBool,
    chain_reads: AtomicUsize,
}

/// Process-local store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chains(chains: Vec<Chain>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState {
                    chains,
                    ..MemoryState::default()
                }),
                ..MemoryInner::default()
            }),
        }
    }

    /// Makes every subsequent write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fails only scheduled-session writes, to exercise partial saves.
    pub fn set_fail_scheduled_writes(&self, fail: bool) {
        self.inner.fail_scheduled_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of chain reads served, for checking cache behaviour.
    pub fn chain_reads(&self) -> usize {
        self.inner.chain_reads.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            bail!("memory storage is read-only");
        }
        Ok(())
    }
}

fn purge(state: &mut MemoryState, root_ids: &[String]) -> Vec<String> {
    let mut doomed: Vec<String> = Vec::new();
    for id in root_ids {
        if !doomed.contains(id) {
            doomed.push(id.clone());
        }
        for child in descendant_ids(&state.chains, id) {
            if !doomed.contains(&child) {
                doomed.push(child);
            }
        }
    }
    let set: HashSet<&str> = doomed.iter().map(String::as_str).collect();
    state.chains.retain(|c| !set.contains(c.id.as_str()));
    state.scheduled.retain(|s| !set.contains(s.chain_id.as_str()));
    state.history.retain(|h| !set.contains(h.chain_id.as_str()));
    state.stats.retain(|s| !set.contains(s.chain_id.as_str()));
    if state
        .active
        .as_ref()
        .is_some_and(|a| set.contains(a.chain_id.as_str()))
    {
        state.active = None;
    }
    doomed
}

impl Storage for MemoryStorage {
    async fn get_chains(&self) -> Result<Vec<Chain>> {
        self.inner.chain_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.state.lock().await.chains.clone())
    }

    async fn get_active_chains(&self) -> Result<Vec<Chain>> {
        self.inner.chain_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.state.lock().await;
        Ok(state.chains.iter().filter(|c| !c.is_deleted()).cloned().collect())
    }

    async fn save_chains(&self, chains: Vec<Chain>) -> Result<()> {
        self.check_writable()?;
        self.inner.state.lock().await.chains = chains;
        Ok(())
    }

    async fn get_scheduled_sessions(&self) -> Result<Vec<ScheduledSession>> {
        Ok(self.inner.state.lock().await.scheduled.clone())
    }

    async fn save_scheduled_sessions(&self, sessions: Vec<ScheduledSession>) -> Result<()> {
        self.check_writable()?;
        if self.inner.fail_scheduled_writes.load(Ordering::SeqCst) {
            bail!("scheduled session write rejected");
        }
        self.inner.state.lock().await.scheduled = sessions;
        Ok(())
    }

    async fn get_active_session(&self) -> Result<Option<ActiveSession>> {
        Ok(self.inner.state.lock().await.active.clone())
    }

    async fn save_active_session(&self, session: Option<ActiveSession>) -> Result<()> {
        self.check_writable()?;
        self.inner.state.lock().await.active = session;
        Ok(())
    }

    async fn get_completion_history(&self) -> Result<Vec<CompletionHistory>> {
        Ok(self.inner.state.lock().await.history.clone())
    }

    async fn save_completion_history(&self, history: Vec<CompletionHistory>) -> Result<()> {
        self.check_writable()?;
        let mut state = self.inner.state.lock().await;
        for entry in history {
            if !state.history.iter().any(|h| h.id == entry.id) {
                state.history.push(entry);
            }
        }
        Ok(())
    }

    async fn update_task_time_stats(&self, chain_id: String, minutes: u32) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        match state.stats.iter_mut().find(|s| s.chain_id == chain_id) {
            Some(stats) => {
                stats.total_minutes += u64::from(minutes);
                stats.session_count += 1;
                stats.last_updated = now;
            }
            None => state.stats.push(TaskTimeStats {
                chain_id,
                total_minutes: u64::from(minutes),
                session_count: 1,
                last_updated: now,
            }),
        }
        Ok(())
    }

    async fn get_task_time_stats(&self) -> Result<Vec<TaskTimeStats>> {
        Ok(self.inner.state.lock().await.stats.clone())
    }

    async fn cleanup_expired_deleted_chains(&self, days: u32) -> Result<Vec<String>> {
        self.check_writable()?;
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut state = self.inner.state.lock().await;
        let expired: Vec<String> = state
            .chains
            .iter()
            .filter(|c| c.deleted_at.is_some_and(|at| at < cutoff))
            .map(|c| c.id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        Ok(purge(&mut state, &expired))
    }

    async fn permanently_delete_chain(&self, id: String) -> Result<bool> {
        self.check_writable()?;
        let mut state = self.inner.state.lock().await;
        if !state.chains.iter().any(|c| c.id == id) {
            return Ok(false);
        }
        purge(&mut state, &[id]);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(id: &str, parent: Option<&str>) -> Chain {
        Chain {
            id: id.into(),
            parent_id: parent.map(str::to_string),
            ..Chain::default()
        }
    }

    #[tokio::test]
    async fn active_chains_skip_soft_deleted() {
        let mut deleted = chain("gone", None);
        deleted.deleted_at = Some(Utc::now());
        let storage = MemoryStorage::with_chains(vec![chain("kept", None), deleted]);

        let active = storage.get_active_chains().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(storage.get_chains().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_purges_only_old_deletions_and_their_children() {
        let mut old = chain("old", None);
        old.deleted_at = Some(Utc::now() - Duration::days(40));
        let mut recent = chain("recent", None);
        recent.deleted_at = Some(Utc::now() - Duration::days(2));
        let storage = MemoryStorage::with_chains(vec![
            old,
            chain("old-child", Some("old")),
            recent,
        ]);

        let mut purged = storage.cleanup_expired_deleted_chains(30).await.unwrap();
        purged.sort();
        assert_eq!(purged, vec!["old", "old-child"]);
        let remaining = storage.get_chains().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "recent");
    }

    #[tokio::test]
    async fn history_writes_are_append_only() {
        let storage = MemoryStorage::new();
        let entry = CompletionHistory {
            id: "h1".into(),
            chain_id: "c".into(),
            completed_at: Utc::now(),
            duration: 25,
            actual_duration: 25,
            was_successful: true,
            reason_for_failure: None,
            is_forward_timed: false,
            description: None,
            notes: None,
        };
        storage.save_completion_history(vec![entry.clone()]).await.unwrap();
        let mut changed = entry.clone();
        changed.notes = Some("rewritten".into());
        storage.save_completion_history(vec![changed]).await.unwrap();

        let history = storage.get_completion_history().await.unwrap();
        assert_eq!(history, vec![entry]);
    }

    #[tokio::test]
    async fn failing_writes_surface_errors() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        assert!(storage.save_chains(vec![chain("a", None)]).await.is_err());
        assert!(storage.get_chains().await.unwrap().is_empty());
    }
}
