//! Chain CRUD and the recycle bin.
//!
//! Mutations share the session controller's transition lock so edits never
//! interleave with a running transition.

use std::cmp::Reverse;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    error::{EngineError, EngineResult},
    models::{Chain, ChainType, CompletionHistory, TaskTimeStats},
    session::{Clock, ForwardTimer, SessionController, WriteSet},
    storage::Storage,
    tree::descendant_ids,
};

/// Fields for a new chain. Unset fields take `Chain::default()` values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub parent_id: Option<String>,
    pub trigger: String,
    pub duration: Option<u32>,
    pub is_durationless: bool,
    pub description: String,
    pub auxiliary_signal: String,
    pub auxiliary_duration: Option<u32>,
    pub auxiliary_completion_trigger: String,
    pub task_repeat_count: Option<u32>,
    pub time_limit_hours: Option<u32>,
}

/// Partial edit. `None` leaves a field untouched; the nested options of
/// `parent_id` and `time_limit_hours` clear the value with `Some(None)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainUpdate {
    pub name: Option<String>,
    pub parent_id: Option<Option<String>>,
    pub sort_order: Option<i64>,
    pub trigger: Option<String>,
    pub duration: Option<u32>,
    pub is_durationless: Option<bool>,
    pub description: Option<String>,
    pub auxiliary_signal: Option<String>,
    pub auxiliary_duration: Option<u32>,
    pub auxiliary_completion_trigger: Option<String>,
    pub task_repeat_count: Option<u32>,
    pub time_limit_hours: Option<Option<u32>>,
}

pub struct ChainLibrary<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    forward_timer: Arc<dyn ForwardTimer>,
    transition: Arc<Mutex<()>>,
}

impl<S> Clone for ChainLibrary<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: Arc::clone(&self.clock),
            forward_timer: Arc::clone(&self.forward_timer),
            transition: Arc::clone(&self.transition),
        }
    }
}

fn valid_parent(chains: &[Chain], parent_id: &str) -> bool {
    chains
        .iter()
        .any(|c| c.id == parent_id && c.is_group() && !c.is_deleted())
}

impl<S: Storage> ChainLibrary<S> {
    pub fn for_controller(controller: &SessionController<S>) -> Self {
        Self {
            storage: Arc::clone(controller.storage()),
            clock: Arc::clone(controller.clock()),
            forward_timer: Arc::clone(controller.forward_timer()),
            transition: Arc::clone(controller.transition_lock()),
        }
    }

    async fn load_chains(&self) -> EngineResult<Vec<Chain>> {
        self.storage
            .get_chains()
            .await
            .map_err(|err| EngineError::persistence("load chains", err))
    }

    async fn save_chains(&self, chains: Vec<Chain>) -> EngineResult<()> {
        WriteSet {
            chains: Some(chains),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await
    }

    /// Creates a chain at the end of its sibling list. Returns `None` for an
    /// empty name or a parent that is not a live group.
    pub async fn create_chain(&self, draft: ChainDraft) -> EngineResult<Option<Chain>> {
        let _guard = self.transition.lock().await;
        let name = draft.name.trim();
        if name.is_empty() {
            warn!("refusing to create a chain without a name");
            return Ok(None);
        }

        let mut chains = self.load_chains().await?;
        if let Some(parent_id) = &draft.parent_id {
            if !valid_parent(&chains, parent_id) {
                warn!("cannot create chain under {parent_id}: not a live group");
                return Ok(None);
            }
        }

        let mut chain = Chain::new(name, draft.chain_type, self.clock.now());
        chain.sort_order = chains
            .iter()
            .filter(|c| c.parent_id == draft.parent_id)
            .map(|c| c.sort_order + 1)
            .max()
            .unwrap_or(0);
        chain.parent_id = draft.parent_id;
        chain.trigger = draft.trigger;
        chain.is_durationless = draft.is_durationless;
        chain.description = draft.description;
        chain.auxiliary_signal = draft.auxiliary_signal;
        chain.auxiliary_completion_trigger = draft.auxiliary_completion_trigger;
        chain.time_limit_hours = draft.time_limit_hours.filter(|_| chain.is_group());
        if let Some(duration) = draft.duration {
            chain.duration = duration;
        }
        if let Some(minutes) = draft.auxiliary_duration {
            chain.auxiliary_duration = minutes;
        }
        if let Some(repeat) = draft.task_repeat_count {
            chain.task_repeat_count = repeat.max(1);
        }

        chains.push(chain.clone());
        self.save_chains(chains).await?;
        info!("created chain {} '{}'", chain.id, chain.name);
        Ok(Some(chain))
    }

    /// Applies `update`. Returns `None` when the chain is missing or the new
    /// parent would be itself, one of its descendants, or not a live group.
    pub async fn update_chain(&self, id: &str, update: ChainUpdate) -> EngineResult<Option<Chain>> {
        let _guard = self.transition.lock().await;
        let mut chains = self.load_chains().await?;
        let Some(idx) = chains.iter().position(|c| c.id == id) else {
            return Ok(None);
        };

        if let Some(Some(parent_id)) = &update.parent_id {
            if parent_id == id
                || descendant_ids(&chains, id).contains(parent_id)
                || !valid_parent(&chains, parent_id)
            {
                warn!("rejecting move of {id} under {parent_id}");
                return Ok(None);
            }
        }

        let chain = &mut chains[idx];
        if let Some(name) = update.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            chain.name = name;
        }
        if let Some(parent_id) = update.parent_id {
            chain.parent_id = parent_id;
        }
        if let Some(sort_order) = update.sort_order {
            chain.sort_order = sort_order;
        }
        if let Some(trigger) = update.trigger {
            chain.trigger = trigger;
        }
        if let Some(duration) = update.duration {
            chain.duration = duration;
        }
        if let Some(durationless) = update.is_durationless {
            chain.is_durationless = durationless;
        }
        if let Some(description) = update.description {
            chain.description = description;
        }
        if let Some(signal) = update.auxiliary_signal {
            chain.auxiliary_signal = signal;
        }
        if let Some(minutes) = update.auxiliary_duration {
            chain.auxiliary_duration = minutes;
        }
        if let Some(trigger) = update.auxiliary_completion_trigger {
            chain.auxiliary_completion_trigger = trigger;
        }
        if let Some(repeat) = update.task_repeat_count {
            chain.task_repeat_count = repeat.max(1);
        }
        if let Some(limit) = update.time_limit_hours {
            chain.time_limit_hours = limit.filter(|_| chain.is_group());
            if chain.time_limit_hours.is_none() {
                chain.clear_group_timer();
            }
        }

        let updated = chain.clone();
        self.save_chains(chains).await?;
        Ok(Some(updated))
    }

    /// Moves a chain and its descendants to the recycle bin, drops their
    /// bookings and discards a session running on any of them without
    /// recording an outcome. Returns the ids marked.
    pub async fn soft_delete_chain(&self, id: &str) -> EngineResult<Vec<String>> {
        let _guard = self.transition.lock().await;
        let mut chains = self.load_chains().await?;
        if !chains.iter().any(|c| c.id == id && !c.is_deleted()) {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut marked = vec![id.to_string()];
        marked.extend(descendant_ids(&chains, id));
        for chain in chains.iter_mut().filter(|c| marked.contains(&c.id)) {
            if chain.deleted_at.is_none() {
                chain.deleted_at = Some(now);
            }
        }

        let mut scheduled = self
            .storage
            .get_scheduled_sessions()
            .await
            .map_err(|err| EngineError::persistence("load scheduled sessions", err))?;
        let before = scheduled.len();
        scheduled.retain(|s| !marked.contains(&s.chain_id));

        let discarded = self
            .storage
            .get_active_session()
            .await
            .map_err(|err| EngineError::persistence("load active session", err))?
            .filter(|session| marked.contains(&session.chain_id));

        WriteSet {
            chains: Some(chains),
            scheduled: (scheduled.len() != before).then_some(scheduled),
            active: discarded.is_some().then_some(None),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await?;
        if let Some(session) = discarded {
            self.forward_timer.clear_timer(&session.forward_timer_key());
            warn!("discarded running session of deleted chain {}", session.chain_id);
        }
        info!("moved {} chain(s) to the recycle bin", marked.len());
        Ok(marked)
    }

    /// Brings a chain and its descendants back. A chain whose parent is still
    /// deleted (or gone) is restored as a root.
    pub async fn restore_chain(&self, id: &str) -> EngineResult<Vec<String>> {
        let _guard = self.transition.lock().await;
        let mut chains = self.load_chains().await?;
        let Some(idx) = chains.iter().position(|c| c.id == id && c.is_deleted()) else {
            return Ok(Vec::new());
        };

        let detach = chains[idx]
            .parent_id
            .as_deref()
            .is_some_and(|parent| !chains.iter().any(|c| c.id == parent && !c.is_deleted()));
        if detach {
            chains[idx].parent_id = None;
        }

        let mut restored = vec![id.to_string()];
        restored.extend(descendant_ids(&chains, id));
        for chain in chains.iter_mut().filter(|c| restored.contains(&c.id)) {
            chain.deleted_at = None;
        }

        self.save_chains(chains).await?;
        Ok(restored)
    }

    pub async fn permanently_delete_chain(&self, id: &str) -> EngineResult<bool> {
        let _guard = self.transition.lock().await;
        self.storage
            .permanently_delete_chain(id.to_string())
            .await
            .map_err(|err| EngineError::persistence("delete chain", err))
    }

    /// Purges recycle-bin entries older than `days`.
    pub async fn purge_recycle_bin(&self, days: u32) -> EngineResult<Vec<String>> {
        let _guard = self.transition.lock().await;
        let purged = self
            .storage
            .cleanup_expired_deleted_chains(days)
            .await
            .map_err(|err| EngineError::persistence("clean up deleted chains", err))?;
        if !purged.is_empty() {
            info!("purged {} chain(s) from the recycle bin", purged.len());
        }
        Ok(purged)
    }

    /// Recycle-bin contents, most recently deleted first.
    pub async fn deleted_chains(&self) -> EngineResult<Vec<Chain>> {
        let mut deleted: Vec<Chain> = self
            .load_chains()
            .await?
            .into_iter()
            .filter(Chain::is_deleted)
            .collect();
        deleted.sort_by_key(|c| Reverse(c.deleted_at));
        Ok(deleted)
    }

    /// Session outcomes for one chain, newest first.
    pub async fn history_for_chain(&self, chain_id: &str) -> EngineResult<Vec<CompletionHistory>> {
        let mut history: Vec<CompletionHistory> = self
            .storage
            .get_completion_history()
            .await
            .map_err(|err| EngineError::persistence("load completion history", err))?
            .into_iter()
            .filter(|h| h.chain_id == chain_id)
            .collect();
        history.sort_by_key(|h| Reverse(h.completed_at));
        Ok(history)
    }

    pub async fn time_stats(&self, chain_id: &str) -> EngineResult<Option<TaskTimeStats>> {
        Ok(self
            .storage
            .get_task_time_stats()
            .await
            .map_err(|err| EngineError::persistence("load task time stats", err))?
            .into_iter()
            .find(|s| s.chain_id == chain_id))
    }
}
