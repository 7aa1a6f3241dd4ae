use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{EngineError, EngineResult},
    models::{ActiveSession, Chain, ChainTreeNode, CompletionHistory, ScheduledSession},
    progress::{
        enter_group, expired_group_ids, force_reset_expired_group, get_group_progress,
        get_group_unit_progress, get_next_unit_in_group, increment_group_completion_count,
        is_group_fully_completed, mark_group_cycle_completed, reset_group_completion_count,
        GroupEntry, GroupProgress,
    },
    storage::Storage,
    tree::{ancestor_ids, find_node, TreeCache},
};

use super::{
    ceil_minutes, Clock, ForwardTimer, ForwardTimerRegistry, LogNotifier, Notifier,
    SessionSnapshot, SystemClock,
};

pub const DEFAULT_INTERRUPTION_REASON: &str = "Interrupted by user";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum StartOutcome {
    Started {
        session: ActiveSession,
        /// Bookings fulfilled by this start (the started chain and/or its group).
        absorbed_bookings: Vec<String>,
    },
    /// The group has no unfinished unit left in this cycle.
    AllTasksComplete { group_id: String },
    /// A time-limited group's window had elapsed; its progress was voided.
    GroupExpired { group_id: String },
    /// Another session is already running.
    Busy { active_chain_id: String },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum GroupTransition {
    CycleCompleted { group_id: String },
    CycleBroken { group_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub history: CompletionHistory,
    /// Group cycles closed or broken by this outcome, nearest group first.
    pub group_transitions: Vec<GroupTransition>,
}

/// Verdict on a booking that lapsed or was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxiliaryJudgment {
    Fail,
    /// Forgive the lapse and record `rule` as a permanent auxiliary exception.
    Allow { rule: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSweep {
    pub completed: Option<SessionOutcome>,
    /// Expired bookings still waiting for a judgment. They stay booked.
    pub awaiting_judgment: Vec<String>,
    /// Bookings failed automatically after the lapse grace period.
    pub lapsed_bookings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub repeats: GroupProgress,
    pub units: GroupProgress,
    pub fully_completed: bool,
}

/// Records touched by one transition. `commit` attempts every write even
/// when one of them fails.
#[derive(Default)]
pub(crate) struct WriteSet {
    pub(crate) chains: Option<Vec<Chain>>,
    pub(crate) scheduled: Option<Vec<ScheduledSession>>,
    pub(crate) active: Option<Option<ActiveSession>>,
    pub(crate) history: Option<Vec<CompletionHistory>>,
    pub(crate) time_stats: Option<(String, u32)>,
}

impl WriteSet {
    pub(crate) async fn commit<S: Storage>(self, storage: &S) -> EngineResult<()> {
        let WriteSet {
            chains,
            scheduled,
            active,
            history,
            time_stats,
        } = self;
        let (chains_saved, scheduled_saved, active_saved, history_saved, stats_saved) = tokio::join!(
            async move {
                match chains {
                    Some(chains) => Some(storage.save_chains(chains).await),
                    None => None,
                }
            },
            async move {
                match scheduled {
                    Some(sessions) => Some(storage.save_scheduled_sessions(sessions).await),
                    None => None,
                }
            },
            async move {
                match active {
                    Some(session) => Some(storage.save_active_session(session).await),
                    None => None,
                }
            },
            async move {
                match history {
                    Some(history) => Some(storage.save_completion_history(history).await),
                    None => None,
                }
            },
            async move {
                match time_stats {
                    Some((chain_id, minutes)) => {
                        Some(storage.update_task_time_stats(chain_id, minutes).await)
                    }
                    None => None,
                }
            },
        );

        let results = [
            ("save chains", chains_saved),
            ("save scheduled sessions", scheduled_saved),
            ("save active session", active_saved),
            ("save completion history", history_saved),
            ("update task time stats", stats_saved),
        ];
        let attempted = results.iter().filter(|(_, r)| r.is_some()).count();
        let mut failures: Vec<(&'static str, anyhow::Error)> = results
            .into_iter()
            .filter_map(|(op, result)| match result {
                Some(Err(err)) => Some((op, err)),
                _ => None,
            })
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        for (op, err) in &failures {
            error!("{op} failed: {err:#}");
        }
        if failures.len() < attempted {
            return Err(EngineError::PartialWrite {
                failed: failures
                    .iter()
                    .map(|(op, err)| format!("{op}: {err:#}"))
                    .collect(),
            });
        }
        let (op, err) = failures.remove(0);
        Err(EngineError::persistence(op, err))
    }
}

fn active_subset(chains: &[Chain]) -> Vec<Chain> {
    chains.iter().filter(|c| !c.is_deleted()).cloned().collect()
}

fn position(chains: &[Chain], id: &str) -> Option<usize> {
    chains.iter().position(|c| c.id == id)
}

/// Drives the booking and focus-session lifecycle over a `Storage`.
///
/// Transitions are serialised through an async lock; each loads the records
/// it needs, mutates them in memory and writes them back in one `WriteSet`.
pub struct SessionController<S> {
    storage: Arc<S>,
    tree_cache: Arc<TreeCache>,
    notifier: Arc<dyn Notifier>,
    forward_timer: Arc<dyn ForwardTimer>,
    clock: Arc<dyn Clock>,
    interruption_reason: String,
    lapse_grace: Option<Duration>,
    announced_lapses: Arc<Mutex<HashSet<String>>>,
    transition: Arc<Mutex<()>>,
}

impl<S> Clone for SessionController<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            tree_cache: Arc::clone(&self.tree_cache),
            notifier: Arc::clone(&self.notifier),
            forward_timer: Arc::clone(&self.forward_timer),
            clock: Arc::clone(&self.clock),
            interruption_reason: self.interruption_reason.clone(),
            lapse_grace: self.lapse_grace,
            announced_lapses: Arc::clone(&self.announced_lapses),
            transition: Arc::clone(&self.transition),
        }
    }
}

impl<S: Storage> SessionController<S> {
    pub fn new(storage: Arc<S>, tree_cache: Arc<TreeCache>) -> Self {
        Self {
            storage,
            tree_cache,
            notifier: Arc::new(LogNotifier),
            forward_timer: Arc::new(ForwardTimerRegistry::new()),
            clock: Arc::new(SystemClock),
            interruption_reason: DEFAULT_INTERRUPTION_REASON.to_string(),
            lapse_grace: None,
            announced_lapses: Arc::new(Mutex::new(HashSet::new())),
            transition: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_forward_timer(mut self, forward_timer: Arc<dyn ForwardTimer>) -> Self {
        self.forward_timer = forward_timer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_interruption_reason(mut self, reason: impl Into<String>) -> Self {
        self.interruption_reason = reason.into();
        self
    }

    /// Fails expired bookings automatically once they have waited `grace`
    /// past their window. Without it a lapsed booking waits for a judgment.
    pub fn with_lapse_grace(mut self, grace: Option<Duration>) -> Self {
        self.lapse_grace = grace;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn forward_timer(&self) -> &Arc<dyn ForwardTimer> {
        &self.forward_timer
    }

    pub(crate) fn transition_lock(&self) -> &Arc<Mutex<()>> {
        &self.transition
    }

    // ---- reads -------------------------------------------------------

    async fn load_chains(&self) -> EngineResult<Vec<Chain>> {
        self.storage
            .get_chains()
            .await
            .map_err(|err| EngineError::persistence("load chains", err))
    }

    async fn load_scheduled(&self) -> EngineResult<Vec<ScheduledSession>> {
        self.storage
            .get_scheduled_sessions()
            .await
            .map_err(|err| EngineError::persistence("load scheduled sessions", err))
    }

    async fn load_active(&self) -> EngineResult<Option<ActiveSession>> {
        self.storage
            .get_active_session()
            .await
            .map_err(|err| EngineError::persistence("load active session", err))
    }

    async fn load_history(&self) -> EngineResult<Vec<CompletionHistory>> {
        self.storage
            .get_completion_history()
            .await
            .map_err(|err| EngineError::persistence("load completion history", err))
    }

    /// The current hierarchy of non-deleted chains.
    pub async fn tree(&self) -> EngineResult<Arc<Vec<ChainTreeNode>>> {
        let chains = self
            .storage
            .get_active_chains()
            .await
            .map_err(|err| EngineError::persistence("load active chains", err))?;
        Ok(self.tree_cache.get_or_build(&chains))
    }

    pub async fn next_unit(&self, group_id: &str) -> EngineResult<Option<Chain>> {
        let tree = self.tree().await?;
        Ok(find_node(&tree, group_id)
            .and_then(get_next_unit_in_group)
            .map(|node| node.chain.clone()))
    }

    pub async fn group_status(&self, group_id: &str) -> EngineResult<Option<GroupStatus>> {
        let tree = self.tree().await?;
        Ok(find_node(&tree, group_id).map(|node| GroupStatus {
            repeats: get_group_progress(node),
            units: get_group_unit_progress(node),
            fully_completed: is_group_fully_completed(node),
        }))
    }

    pub async fn snapshot(&self) -> EngineResult<Option<SessionSnapshot>> {
        let Some(session) = self.load_active().await? else {
            return Ok(None);
        };
        let chains = self.load_chains().await?;
        let name = chains
            .iter()
            .find(|c| c.id == session.chain_id)
            .map(|c| c.name.as_str())
            .unwrap_or_default();
        Ok(Some(session.snapshot(name, self.clock.now())))
    }

    pub async fn scheduled_session(&self, chain_id: &str) -> EngineResult<Option<ScheduledSession>> {
        Ok(self
            .load_scheduled()
            .await?
            .into_iter()
            .find(|s| s.chain_id == chain_id))
    }

    /// Whether `rule` is already a recorded exception for the chain. Callers
    /// treat a match as pre-approved instead of asking for a fresh judgment.
    pub async fn is_preapproved(
        &self,
        chain_id: &str,
        rule: &str,
        auxiliary: bool,
    ) -> EngineResult<bool> {
        let chains = self.load_chains().await?;
        Ok(chains.iter().find(|c| c.id == chain_id).is_some_and(|c| {
            if auxiliary {
                c.has_auxiliary_exception(rule)
            } else {
                c.has_exception(rule)
            }
        }))
    }

    // ---- booking -----------------------------------------------------

    /// Books the chain. A booking counts as an auxiliary success straight away.
    pub async fn schedule_chain(&self, chain_id: &str) -> EngineResult<Option<ScheduledSession>> {
        let _guard = self.transition.lock().await;
        let mut scheduled = self.load_scheduled().await?;
        if scheduled.iter().any(|s| s.chain_id == chain_id) {
            warn!("chain {chain_id} already has a booking; ignoring");
            return Ok(None);
        }

        let mut chains = self.load_chains().await?;
        let Some(idx) = position(&chains, chain_id).filter(|&i| !chains[i].is_deleted()) else {
            warn!("cannot book unknown chain {chain_id}");
            return Ok(None);
        };

        let now = self.clock.now();
        let booking = ScheduledSession::for_chain(&chains[idx], now);
        chains[idx].auxiliary_streak += 1;
        scheduled.push(booking.clone());

        WriteSet {
            chains: Some(chains),
            scheduled: Some(scheduled),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await?;

        info!("chain {chain_id} booked until {}", booking.expires_at);
        Ok(Some(booking))
    }

    /// Settles a booking. Returns false when no booking exists (already settled).
    pub async fn judge_auxiliary(
        &self,
        chain_id: &str,
        judgment: AuxiliaryJudgment,
    ) -> EngineResult<bool> {
        let _guard = self.transition.lock().await;
        self.judge_locked(chain_id, judgment).await
    }

    async fn judge_locked(&self, chain_id: &str, judgment: AuxiliaryJudgment) -> EngineResult<bool> {
        if let AuxiliaryJudgment::Allow { rule } = &judgment {
            if rule.trim().is_empty() {
                warn!("allow judgment for {chain_id} needs a rule name; ignoring");
                return Ok(false);
            }
        }

        let mut scheduled = self.load_scheduled().await?;
        let before = scheduled.len();
        scheduled.retain(|s| s.chain_id != chain_id);
        if scheduled.len() == before {
            return Ok(false);
        }

        let mut chains = self.load_chains().await?;
        let mut writes = WriteSet {
            scheduled: Some(scheduled),
            ..WriteSet::default()
        };

        let mut failed_chain = None;
        if let Some(idx) = position(&chains, chain_id) {
            let chain = &mut chains[idx];
            match &judgment {
                AuxiliaryJudgment::Fail => {
                    chain.auxiliary_streak = 0;
                    chain.auxiliary_failures += 1;
                    failed_chain = Some(chain.clone());
                }
                AuxiliaryJudgment::Allow { rule } => {
                    if chain.add_auxiliary_exception(rule) {
                        info!("chain {chain_id} gained auxiliary exception '{rule}'");
                    }
                }
            }
            writes.chains = Some(chains);
        }

        writes.commit(self.storage.as_ref()).await?;
        if let Some(chain) = failed_chain {
            self.notifier.notify_schedule_failed(&chain);
        }
        Ok(true)
    }

    // ---- focus sessions ----------------------------------------------

    /// Starts a chain. Groups resolve to their next unfinished unit.
    pub async fn start_chain(&self, chain_id: &str) -> EngineResult<StartOutcome> {
        let _guard = self.transition.lock().await;

        if let Some(active) = self.load_active().await? {
            return Ok(StartOutcome::Busy {
                active_chain_id: active.chain_id,
            });
        }

        let mut chains = self.load_chains().await?;
        let Some(target) = chains
            .iter()
            .find(|c| c.id == chain_id && !c.is_deleted())
            .cloned()
        else {
            warn!("cannot start unknown chain {chain_id}");
            return Ok(StartOutcome::NotFound);
        };
        let now = self.clock.now();

        // Time limits are checked outermost first: the target's enclosing
        // groups and the target itself before a unit is picked, then the
        // nested groups between the target and that unit.
        let mut chains_dirty = false;
        let mut entered = ancestor_ids(&chains, chain_id);
        entered.reverse();
        if target.is_group() {
            entered.push(target.id.clone());
        }
        if let Some(expired) = self
            .enter_groups(&mut chains, &entered, now, &mut chains_dirty)
            .await?
        {
            return Ok(expired);
        }

        let leaf_id = if target.is_group() {
            let tree = self.tree_cache.get_or_build(&active_subset(&chains));
            let next = find_node(&tree, chain_id)
                .and_then(get_next_unit_in_group)
                .map(|node| node.chain.id.clone());
            match next {
                Some(id) => id,
                None => {
                    info!("group {chain_id}: all tasks complete for this cycle");
                    return Ok(StartOutcome::AllTasksComplete {
                        group_id: chain_id.to_string(),
                    });
                }
            }
        } else {
            target.id.clone()
        };

        if leaf_id != chain_id {
            let mut nested: Vec<String> = ancestor_ids(&chains, &leaf_id)
                .into_iter()
                .take_while(|id| id != chain_id)
                .collect();
            nested.reverse();
            if let Some(expired) = self
                .enter_groups(&mut chains, &nested, now, &mut chains_dirty)
                .await?
            {
                return Ok(expired);
            }
        }

        let Some(leaf_idx) = position(&chains, &leaf_id) else {
            return Ok(StartOutcome::NotFound);
        };
        let session = ActiveSession::begin(&chains[leaf_idx], now);

        let mut scheduled = self.load_scheduled().await?;
        let mut absorbed_bookings = Vec::new();
        for id in [chain_id, leaf_id.as_str()] {
            if absorbed_bookings.iter().any(|a: &String| a == id) {
                continue;
            }
            let before = scheduled.len();
            scheduled.retain(|s| s.chain_id != id);
            if scheduled.len() != before {
                if let Some(idx) = position(&chains, id) {
                    chains[idx].auxiliary_streak += 1;
                }
                absorbed_bookings.push(id.to_string());
            }
        }
        let booking_absorbed = !absorbed_bookings.is_empty();

        if session.is_forward_timed() {
            self.forward_timer.start_timer(&session.forward_timer_key());
        }

        let notify: Vec<Chain> = absorbed_bookings
            .iter()
            .filter_map(|id| chains.iter().find(|c| &c.id == id).cloned())
            .collect();

        let writes = WriteSet {
            chains: (chains_dirty || booking_absorbed).then_some(chains),
            scheduled: booking_absorbed.then_some(scheduled),
            active: Some(Some(session.clone())),
            ..WriteSet::default()
        };
        if let Err(err) = writes.commit(self.storage.as_ref()).await {
            if session.is_forward_timed() {
                self.forward_timer.clear_timer(&session.forward_timer_key());
            }
            return Err(err);
        }

        for chain in &notify {
            self.notifier.notify_auxiliary_completed(chain);
        }
        info!(
            "session started for {} ({} min planned)",
            session.chain_id, session.duration
        );
        Ok(StartOutcome::Started {
            session,
            absorbed_bookings,
        })
    }

    /// On-entry time-limit check for `group_ids`, in order. The first expired
    /// group has its reset persisted and ends the start.
    async fn enter_groups(
        &self,
        chains: &mut [Chain],
        group_ids: &[String],
        now: DateTime<Utc>,
        timer_started: &mut bool,
    ) -> EngineResult<Option<StartOutcome>> {
        for group_id in group_ids {
            match enter_group(chains, group_id, now) {
                GroupEntry::Expired => {
                    let group = chains.iter().find(|c| &c.id == group_id).cloned();
                    WriteSet {
                        chains: Some(chains.to_vec()),
                        ..WriteSet::default()
                    }
                    .commit(self.storage.as_ref())
                    .await?;
                    if let Some(group) = group {
                        self.notifier
                            .notify_task_failed(&group, "group time limit exceeded");
                    }
                    return Ok(Some(StartOutcome::GroupExpired {
                        group_id: group_id.clone(),
                    }));
                }
                GroupEntry::TimerStarted => *timer_started = true,
                GroupEntry::TimerRunning | GroupEntry::Unlimited => {}
            }
        }
        Ok(None)
    }

    pub async fn pause_session(&self) -> EngineResult<Option<ActiveSession>> {
        let _guard = self.transition.lock().await;
        let Some(mut session) = self.load_active().await? else {
            return Ok(None);
        };
        if !session.pause(self.clock.now()) {
            return Ok(None);
        }
        if session.is_forward_timed() {
            self.forward_timer.pause_timer(&session.forward_timer_key());
        }
        self.save_active(Some(session.clone())).await?;
        Ok(Some(session))
    }

    pub async fn resume_session(&self) -> EngineResult<Option<ActiveSession>> {
        let _guard = self.transition.lock().await;
        let Some(mut session) = self.load_active().await? else {
            return Ok(None);
        };
        if !session.resume(self.clock.now()) {
            return Ok(None);
        }
        if session.is_forward_timed() {
            self.forward_timer.resume_timer(&session.forward_timer_key());
        }
        self.save_active(Some(session.clone())).await?;
        Ok(Some(session))
    }

    async fn save_active(&self, session: Option<ActiveSession>) -> EngineResult<()> {
        WriteSet {
            active: Some(session),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await
    }

    /// Records a successful session. No-op (Ok(None)) without an active session.
    pub async fn complete_session(&self) -> EngineResult<Option<SessionOutcome>> {
        let _guard = self.transition.lock().await;
        self.complete_locked().await
    }

    async fn complete_locked(&self) -> EngineResult<Option<SessionOutcome>> {
        let Some(session) = self.load_active().await? else {
            warn!("complete requested without an active session");
            return Ok(None);
        };
        let now = self.clock.now();
        let mut chains = self.load_chains().await?;
        let Some(idx) = position(&chains, &session.chain_id) else {
            return self.drop_orphaned_session(&session).await;
        };

        let forward_timed = chains[idx].is_durationless;
        let actual_duration = if forward_timed {
            self.measured_minutes(&session, now)
        } else {
            session.duration
        };

        let chain = &mut chains[idx];
        chain.current_streak += 1;
        chain.total_completions += 1;
        chain.last_completed_at = Some(now);

        let history = CompletionHistory {
            id: Uuid::new_v4().to_string(),
            chain_id: chain.id.clone(),
            completed_at: now,
            duration: session.duration,
            actual_duration,
            was_successful: true,
            reason_for_failure: None,
            is_forward_timed: forward_timed,
            description: Some(chain.description.clone()).filter(|d| !d.is_empty()),
            notes: None,
        };

        let completed_chain = chains[idx].clone();
        let group_transitions = if completed_chain.is_group() {
            Vec::new()
        } else {
            self.close_completed_groups(&mut chains, &session.chain_id, now)
        };

        let mut all_history = self.load_history().await?;
        all_history.push(history.clone());

        WriteSet {
            chains: Some(chains),
            active: Some(None),
            history: Some(all_history),
            time_stats: Some((session.chain_id.clone(), actual_duration)),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await?;

        self.notifier
            .notify_task_completed(&completed_chain, actual_duration);
        info!(
            "session for {} completed ({} min, streak {})",
            completed_chain.id, actual_duration, completed_chain.current_streak
        );
        Ok(Some(SessionOutcome {
            history,
            group_transitions,
        }))
    }

    /// Closes the cycle of every enclosing group the unit just finished,
    /// nearest first. Completion is read before any reset so an outer group
    /// still sees its nested units as done. Units are only reset once no
    /// enclosing group is left in progress.
    fn close_completed_groups(
        &self,
        chains: &mut [Chain],
        unit_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<GroupTransition> {
        let tree = self.tree_cache.get_or_build(&active_subset(chains));
        let enclosing: Vec<String> = ancestor_ids(chains, unit_id)
            .into_iter()
            .take_while(|id| find_node(&tree, id).is_some_and(|node| node.is_group()))
            .collect();
        let finished: Vec<String> = enclosing
            .iter()
            .take_while(|id| find_node(&tree, id).is_some_and(is_group_fully_completed))
            .cloned()
            .collect();
        let reset_units = finished.len() == enclosing.len();

        finished
            .into_iter()
            .filter(|group_id| {
                if reset_units {
                    increment_group_completion_count(chains, group_id, now)
                } else {
                    mark_group_cycle_completed(chains, group_id, now)
                }
            })
            .map(|group_id| GroupTransition::CycleCompleted { group_id })
            .collect()
    }

    /// Records a failed session and breaks the chain's streak.
    pub async fn interrupt_session(
        &self,
        reason: Option<String>,
    ) -> EngineResult<Option<SessionOutcome>> {
        let _guard = self.transition.lock().await;
        let Some(session) = self.load_active().await? else {
            warn!("interrupt requested without an active session");
            return Ok(None);
        };
        let now = self.clock.now();
        let mut chains = self.load_chains().await?;
        let Some(idx) = position(&chains, &session.chain_id) else {
            return self.drop_orphaned_session(&session).await;
        };

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.interruption_reason.clone());
        let forward_timed = chains[idx].is_durationless;
        let actual_duration = self.measured_minutes(&session, now);
        self.forward_timer.clear_timer(&session.forward_timer_key());

        let chain = &mut chains[idx];
        chain.current_streak = 0;
        chain.total_failures += 1;

        let history = CompletionHistory {
            id: Uuid::new_v4().to_string(),
            chain_id: chain.id.clone(),
            completed_at: now,
            duration: session.duration,
            actual_duration,
            was_successful: false,
            reason_for_failure: Some(reason.clone()),
            is_forward_timed: forward_timed,
            description: Some(chain.description.clone()).filter(|d| !d.is_empty()),
            notes: None,
        };

        let group_transitions = match chain.parent_id.clone().filter(|_| !chain.is_group()) {
            Some(group_id) if reset_group_completion_count(&mut chains, &group_id) => {
                vec![GroupTransition::CycleBroken { group_id }]
            }
            _ => Vec::new(),
        };
        let failed_chain = chains[idx].clone();

        let mut all_history = self.load_history().await?;
        all_history.push(history.clone());

        WriteSet {
            chains: Some(chains),
            active: Some(None),
            history: Some(all_history),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await?;

        self.notifier.notify_task_failed(&failed_chain, &reason);
        info!("session for {} interrupted: {reason}", failed_chain.id);
        Ok(Some(SessionOutcome {
            history,
            group_transitions,
        }))
    }

    /// Forgives an irregular action during the running session by recording
    /// it as a main-chain exception. Streaks are untouched.
    pub async fn add_exception(&self, rule: &str) -> EngineResult<bool> {
        let _guard = self.transition.lock().await;
        let rule = rule.trim();
        if rule.is_empty() {
            return Ok(false);
        }
        let Some(session) = self.load_active().await? else {
            return Ok(false);
        };
        let mut chains = self.load_chains().await?;
        let Some(idx) = position(&chains, &session.chain_id) else {
            return Ok(false);
        };
        if !chains[idx].add_exception(rule) {
            return Ok(false);
        }
        WriteSet {
            chains: Some(chains),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await?;
        info!("chain {} gained exception '{rule}'", session.chain_id);
        Ok(true)
    }

    fn measured_minutes(&self, session: &ActiveSession, now: DateTime<Utc>) -> u32 {
        let seconds = self
            .forward_timer
            .stop_timer(&session.forward_timer_key())
            .unwrap_or_else(|| session.active_ms(now) / 1000);
        ceil_minutes(seconds)
    }

    async fn drop_orphaned_session(
        &self,
        session: &ActiveSession,
    ) -> EngineResult<Option<SessionOutcome>> {
        warn!(
            "active session references missing chain {}; clearing it",
            session.chain_id
        );
        self.forward_timer.clear_timer(&session.forward_timer_key());
        self.save_active(None).await?;
        Ok(None)
    }

    // ---- periodic sweeps ---------------------------------------------

    /// Completes a finished countdown and reports expired bookings. An
    /// expired booking stays in place until it is judged, unless a lapse
    /// grace is configured and has also run out. Safe to repeat: settled
    /// state produces the same report and no writes.
    pub async fn sweep_sessions(&self) -> EngineResult<SessionSweep> {
        let _guard = self.transition.lock().await;
        let now = self.clock.now();
        let mut sweep = SessionSweep::default();

        if let Some(session) = self.load_active().await? {
            if session.is_countdown_finished(now) {
                sweep.completed = self.complete_locked().await?;
            }
        }

        let expired: Vec<ScheduledSession> = self
            .load_scheduled()
            .await?
            .into_iter()
            .filter(|s| s.is_expired(now))
            .collect();
        let mut pending = Vec::new();
        for booking in expired {
            let overdue = self
                .lapse_grace
                .is_some_and(|grace| now >= booking.expires_at + grace);
            if overdue {
                if self.judge_locked(&booking.chain_id, AuxiliaryJudgment::Fail).await? {
                    sweep.lapsed_bookings.push(booking.chain_id);
                }
            } else {
                pending.push(booking);
            }
        }

        self.announce_pending(&pending).await?;
        sweep.awaiting_judgment = pending.into_iter().map(|b| b.chain_id).collect();
        Ok(sweep)
    }

    /// Notifies once per booking that it needs a judgment.
    async fn announce_pending(&self, pending: &[ScheduledSession]) -> EngineResult<()> {
        let mut announced = self.announced_lapses.lock().await;
        let keys: Vec<String> = pending.iter().map(ScheduledSession::key).collect();
        announced.retain(|key| keys.contains(key));

        let fresh: Vec<&ScheduledSession> = pending
            .iter()
            .zip(&keys)
            .filter(|(_, key)| !announced.contains(*key))
            .map(|(booking, _)| booking)
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let chains = self.load_chains().await?;
        for booking in fresh {
            announced.insert(booking.key());
            if let Some(chain) = chains.iter().find(|c| c.id == booking.chain_id) {
                info!("booking for {} lapsed; awaiting judgment", chain.id);
                self.notifier.notify_judgment_needed(chain, booking);
            }
        }
        Ok(())
    }

    /// Voids progress of time-limited groups whose window has elapsed.
    pub async fn sweep_groups(&self) -> EngineResult<Vec<String>> {
        let _guard = self.transition.lock().await;
        let now = self.clock.now();
        let mut chains = self.load_chains().await?;
        let expired = expired_group_ids(&chains, now);
        if expired.is_empty() {
            return Ok(expired);
        }

        let reset: Vec<String> = expired
            .into_iter()
            .filter(|id| force_reset_expired_group(&mut chains, id, now))
            .collect();
        let failed: Vec<Chain> = chains
            .iter()
            .filter(|c| reset.contains(&c.id))
            .cloned()
            .collect();

        WriteSet {
            chains: Some(chains),
            ..WriteSet::default()
        }
        .commit(self.storage.as_ref())
        .await?;
        for group in &failed {
            self.notifier
                .notify_task_failed(group, "group time limit exceeded");
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChainType;
    use crate::session::ManualClock;
    use crate::storage::MemoryStorage;
    use chrono::Duration;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify_task_completed(&self, chain: &Chain, minutes: u32) {
            self.push(format!("completed:{}:{minutes}", chain.id));
        }

        fn notify_task_failed(&self, chain: &Chain, reason: &str) {
            self.push(format!("failed:{}:{reason}", chain.id));
        }

        fn notify_schedule_failed(&self, chain: &Chain) {
            self.push(format!("schedule_failed:{}", chain.id));
        }

        fn notify_auxiliary_completed(&self, chain: &Chain) {
            self.push(format!("auxiliary_completed:{}", chain.id));
        }

        fn notify_judgment_needed(&self, chain: &Chain, _booking: &ScheduledSession) {
            self.push(format!("judgment_needed:{}", chain.id));
        }
    }

    /// Reports a fixed elapsed time on stop.
    #[derive(Default)]
    struct FakeForwardTimer {
        elapsed_secs: Option<u64>,
        calls: StdMutex<Vec<String>>,
    }

    impl FakeForwardTimer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl ForwardTimer for FakeForwardTimer {
        fn start_timer(&self, _key: &str) {
            self.record("start");
        }

        fn pause_timer(&self, _key: &str) {
            self.record("pause");
        }

        fn resume_timer(&self, _key: &str) {
            self.record("resume");
        }

        fn stop_timer(&self, _key: &str) -> Option<u64> {
            self.record("stop");
            self.elapsed_secs
        }

        fn clear_timer(&self, _key: &str) {
            self.record("clear");
        }
    }

    struct Harness {
        controller: SessionController<MemoryStorage>,
        storage: MemoryStorage,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        timer: Arc<FakeForwardTimer>,
    }

    impl Harness {
        fn new(chains: Vec<Chain>) -> Self {
            Self::with_timer(chains, FakeForwardTimer::default())
        }

        fn with_lapse_grace(chains: Vec<Chain>, grace: Duration) -> Self {
            let mut h = Self::new(chains);
            h.controller = h.controller.with_lapse_grace(Some(grace));
            h
        }

        fn with_timer(chains: Vec<Chain>, timer: FakeForwardTimer) -> Self {
            let storage = MemoryStorage::with_chains(chains);
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let notifier = Arc::new(RecordingNotifier::default());
            let timer = Arc::new(timer);
            let controller =
                SessionController::new(Arc::new(storage.clone()), Arc::new(TreeCache::new()))
                    .with_clock(clock.clone())
                    .with_notifier(notifier.clone())
                    .with_forward_timer(timer.clone());
            Self {
                controller,
                storage,
                clock,
                notifier,
                timer,
            }
        }

        async fn chain(&self, id: &str) -> Chain {
            self.storage
                .get_chains()
                .await
                .unwrap()
                .into_iter()
                .find(|c| c.id == id)
                .unwrap()
        }
    }

    fn unit(id: &str) -> Chain {
        Chain {
            id: id.into(),
            name: id.to_uppercase(),
            ..Chain::default()
        }
    }

    fn child(id: &str, parent: &str, sort_order: i64) -> Chain {
        Chain {
            parent_id: Some(parent.into()),
            sort_order,
            ..unit(id)
        }
    }

    fn group(id: &str) -> Chain {
        Chain {
            chain_type: ChainType::Group,
            ..unit(id)
        }
    }

    fn started(outcome: StartOutcome) -> ActiveSession {
        match outcome {
            StartOutcome::Started { session, .. } => session,
            other => panic!("expected a started session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lapsed_booking_waits_for_judgment() {
        let h = Harness::new(vec![unit("a")]);
        let booking = h.controller.schedule_chain("a").await.unwrap().unwrap();
        assert_eq!(booking.expires_at - booking.scheduled_at, Duration::minutes(15));
        assert_eq!(h.chain("a").await.auxiliary_streak, 1);

        // A second booking for the same chain is refused.
        assert!(h.controller.schedule_chain("a").await.unwrap().is_none());

        h.clock.advance(Duration::minutes(14));
        assert_eq!(h.controller.sweep_sessions().await.unwrap(), SessionSweep::default());

        h.clock.advance(Duration::minutes(2));
        let sweep = h.controller.sweep_sessions().await.unwrap();
        assert_eq!(sweep.awaiting_judgment, vec!["a".to_string()]);
        assert!(sweep.lapsed_bookings.is_empty());
        assert!(h.controller.scheduled_session("a").await.unwrap().is_some());
        assert_eq!(h.chain("a").await.auxiliary_streak, 1);

        // Repeated sweeps report it again but announce it once.
        let again = h.controller.sweep_sessions().await.unwrap();
        assert_eq!(again.awaiting_judgment, vec!["a".to_string()]);
        assert_eq!(h.notifier.events(), vec!["judgment_needed:a"]);

        assert!(h.controller.judge_auxiliary("a", AuxiliaryJudgment::Fail).await.unwrap());
        let a = h.chain("a").await;
        assert_eq!(a.auxiliary_streak, 0);
        assert_eq!(a.auxiliary_failures, 1);
        assert!(h.controller.scheduled_session("a").await.unwrap().is_none());
        assert_eq!(
            h.notifier.events(),
            vec!["judgment_needed:a", "schedule_failed:a"]
        );
        assert_eq!(h.controller.sweep_sessions().await.unwrap(), SessionSweep::default());
    }

    #[tokio::test]
    async fn lapsed_booking_can_be_allowed_after_sweep() {
        let h = Harness::new(vec![unit("a")]);
        h.controller.schedule_chain("a").await.unwrap();
        h.clock.advance(Duration::minutes(16));
        h.controller.sweep_sessions().await.unwrap();

        let allow = AuxiliaryJudgment::Allow {
            rule: "phone".into(),
        };
        assert!(h.controller.judge_auxiliary("a", allow).await.unwrap());
        let a = h.chain("a").await;
        assert_eq!(a.auxiliary_streak, 1);
        assert_eq!(a.auxiliary_failures, 0);
        assert_eq!(a.auxiliary_exceptions, vec!["phone".to_string()]);
    }

    #[tokio::test]
    async fn lapse_grace_fails_overdue_bookings() {
        let h = Harness::with_lapse_grace(vec![unit("a")], Duration::minutes(5));
        h.controller.schedule_chain("a").await.unwrap();

        h.clock.advance(Duration::minutes(17));
        let sweep = h.controller.sweep_sessions().await.unwrap();
        assert_eq!(sweep.awaiting_judgment, vec!["a".to_string()]);

        h.clock.advance(Duration::minutes(3));
        let sweep = h.controller.sweep_sessions().await.unwrap();
        assert_eq!(sweep.lapsed_bookings, vec!["a".to_string()]);
        assert!(sweep.awaiting_judgment.is_empty());
        assert_eq!(h.chain("a").await.auxiliary_failures, 1);
        assert_eq!(h.controller.sweep_sessions().await.unwrap(), SessionSweep::default());
    }

    #[tokio::test]
    async fn starting_inside_booking_window_absorbs_it() {
        let h = Harness::new(vec![unit("a")]);
        h.controller.schedule_chain("a").await.unwrap();
        h.clock.advance(Duration::minutes(5));

        match h.controller.start_chain("a").await.unwrap() {
            StartOutcome::Started {
                absorbed_bookings, ..
            } => assert_eq!(absorbed_bookings, vec!["a".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.chain("a").await.auxiliary_streak, 2);
        assert!(h.controller.scheduled_session("a").await.unwrap().is_none());
        assert_eq!(h.notifier.events(), vec!["auxiliary_completed:a"]);
    }

    #[tokio::test]
    async fn allow_judgment_records_rule_without_breaking_streak() {
        let h = Harness::new(vec![unit("a")]);
        h.controller.schedule_chain("a").await.unwrap();

        let empty = AuxiliaryJudgment::Allow { rule: "  ".into() };
        assert!(!h.controller.judge_auxiliary("a", empty).await.unwrap());

        let allow = AuxiliaryJudgment::Allow {
            rule: "phone call".into(),
        };
        assert!(h.controller.judge_auxiliary("a", allow.clone()).await.unwrap());
        assert!(!h.controller.judge_auxiliary("a", allow).await.unwrap());

        let a = h.chain("a").await;
        assert_eq!(a.auxiliary_streak, 1);
        assert_eq!(a.auxiliary_exceptions, vec!["phone call".to_string()]);
        assert!(h.controller.is_preapproved("a", "phone call", true).await.unwrap());
        assert!(!h.controller.is_preapproved("a", "phone call", false).await.unwrap());
    }

    #[tokio::test]
    async fn completing_timed_session_records_planned_minutes() {
        let h = Harness::new(vec![unit("a")]);
        started(h.controller.start_chain("a").await.unwrap());
        h.clock.advance(Duration::minutes(25));

        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert!(outcome.history.was_successful);
        assert_eq!(outcome.history.actual_duration, 25);
        assert!(!outcome.history.is_forward_timed);
        assert!(outcome.group_transitions.is_empty());

        let a = h.chain("a").await;
        assert_eq!(a.current_streak, 1);
        assert_eq!(a.total_completions, 1);
        assert_eq!(a.last_completed_at, Some(h.clock.now()));
        assert!(h.storage.get_active_session().await.unwrap().is_none());

        let stats = h.storage.get_task_time_stats().await.unwrap();
        assert_eq!(stats[0].total_minutes, 25);
        assert_eq!(h.notifier.events(), vec!["completed:a:25"]);
    }

    #[tokio::test]
    async fn durationless_completion_rounds_measured_time_up() {
        let mut a = unit("a");
        a.is_durationless = true;
        let timer = FakeForwardTimer {
            elapsed_secs: Some(125),
            ..FakeForwardTimer::default()
        };
        let h = Harness::with_timer(vec![a], timer);

        let session = started(h.controller.start_chain("a").await.unwrap());
        assert_eq!(session.duration, 0);

        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert_eq!(outcome.history.duration, 0);
        assert_eq!(outcome.history.actual_duration, 3);
        assert!(outcome.history.is_forward_timed);
        assert_eq!(h.timer.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn durationless_falls_back_to_session_clock() {
        let mut a = unit("a");
        a.is_durationless = true;
        let h = Harness::new(vec![a]);

        started(h.controller.start_chain("a").await.unwrap());
        h.clock.advance(Duration::seconds(61));
        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert_eq!(outcome.history.actual_duration, 2);
    }

    #[tokio::test]
    async fn group_cycle_closes_when_last_unit_completes() {
        let h = Harness::new(vec![
            group("g"),
            child("a", "g", 0),
            child("b", "g", 1),
        ]);

        let first = started(h.controller.start_chain("g").await.unwrap());
        assert_eq!(first.chain_id, "a");
        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert!(outcome.group_transitions.is_empty());

        let second = started(h.controller.start_chain("g").await.unwrap());
        assert_eq!(second.chain_id, "b");
        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert_eq!(
            outcome.group_transitions,
            vec![GroupTransition::CycleCompleted {
                group_id: "g".into()
            }]
        );

        let g = h.chain("g").await;
        assert_eq!(g.current_streak, 1);
        assert_eq!(g.total_completions, 1);
        assert_eq!(h.chain("a").await.current_streak, 0);
        assert_eq!(h.chain("b").await.current_streak, 0);
        // Unit counters survive the cycle reset.
        assert_eq!(h.chain("b").await.total_completions, 1);
    }

    fn nested_child(id: &str, parent: &str, sort_order: i64) -> Chain {
        Chain {
            chain_type: ChainType::Group,
            ..child(id, parent, sort_order)
        }
    }

    async fn run_cycle_rounds(h: &Harness, group_id: &str, rounds: usize) -> Vec<String> {
        let mut picks = Vec::new();
        for _ in 0..rounds {
            let session = started(h.controller.start_chain(group_id).await.unwrap());
            picks.push(session.chain_id);
            h.controller.complete_session().await.unwrap();
        }
        picks
    }

    #[tokio::test]
    async fn outer_cycle_closes_through_nested_group() {
        let h = Harness::new(vec![
            group("outer"),
            child("a", "outer", 0),
            nested_child("inner", "outer", 1),
            child("b", "inner", 0),
        ]);

        started(h.controller.start_chain("outer").await.unwrap());
        h.controller.complete_session().await.unwrap();
        started(h.controller.start_chain("outer").await.unwrap());
        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert_eq!(
            outcome.group_transitions,
            vec![
                GroupTransition::CycleCompleted {
                    group_id: "inner".into()
                },
                GroupTransition::CycleCompleted {
                    group_id: "outer".into()
                },
            ]
        );

        assert_eq!(run_cycle_rounds(&h, "outer", 2).await, vec!["a", "b"]);
        assert_eq!(h.chain("outer").await.total_completions, 2);
        assert_eq!(h.chain("inner").await.total_completions, 2);
        assert_eq!(h.chain("a").await.current_streak, 0);
        assert_eq!(h.chain("b").await.current_streak, 0);
    }

    #[tokio::test]
    async fn nested_group_finishing_first_waits_for_outer_cycle() {
        let h = Harness::new(vec![
            group("outer"),
            nested_child("inner", "outer", 0),
            child("b", "inner", 0),
            child("a", "outer", 1),
        ]);

        started(h.controller.start_chain("outer").await.unwrap());
        let outcome = h.controller.complete_session().await.unwrap().unwrap();
        assert_eq!(
            outcome.group_transitions,
            vec![GroupTransition::CycleCompleted {
                group_id: "inner".into()
            }]
        );
        // The inner unit keeps its progress so the outer scan moves on.
        assert_eq!(h.chain("b").await.current_streak, 1);
        assert_eq!(h.chain("inner").await.total_completions, 1);

        assert_eq!(run_cycle_rounds(&h, "outer", 3).await, vec!["a", "b", "a"]);
        assert_eq!(h.chain("outer").await.total_completions, 2);
        assert_eq!(h.chain("inner").await.total_completions, 2);
    }

    #[tokio::test]
    async fn finished_group_reports_all_tasks_complete() {
        let mut a = child("a", "g", 0);
        a.current_streak = 1;
        let h = Harness::new(vec![group("g"), a]);

        assert_eq!(
            h.controller.start_chain("g").await.unwrap(),
            StartOutcome::AllTasksComplete {
                group_id: "g".into()
            }
        );
        assert!(h.storage.get_active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupt_breaks_unit_and_group_streaks() {
        let mut g = group("g");
        g.current_streak = 2;
        let mut a = child("a", "g", 0);
        a.task_repeat_count = 5;
        a.current_streak = 3;
        let h = Harness::new(vec![g, a]);

        started(h.controller.start_chain("a").await.unwrap());
        h.clock.advance(Duration::seconds(90));
        let outcome = h.controller.interrupt_session(None).await.unwrap().unwrap();

        assert!(!outcome.history.was_successful);
        assert_eq!(
            outcome.history.reason_for_failure.as_deref(),
            Some(DEFAULT_INTERRUPTION_REASON)
        );
        assert_eq!(outcome.history.actual_duration, 2);
        assert_eq!(
            outcome.group_transitions,
            vec![GroupTransition::CycleBroken {
                group_id: "g".into()
            }]
        );

        let a = h.chain("a").await;
        assert_eq!((a.current_streak, a.total_failures), (0, 1));
        let g = h.chain("g").await;
        assert_eq!((g.current_streak, g.total_failures), (0, 1));
        assert_eq!(
            h.notifier.events(),
            vec![format!("failed:a:{DEFAULT_INTERRUPTION_REASON}")]
        );
    }

    #[tokio::test]
    async fn only_one_session_at_a_time() {
        let h = Harness::new(vec![unit("a"), unit("b")]);
        started(h.controller.start_chain("a").await.unwrap());
        assert_eq!(
            h.controller.start_chain("b").await.unwrap(),
            StartOutcome::Busy {
                active_chain_id: "a".into()
            }
        );
        assert_eq!(
            h.controller.start_chain("missing").await.unwrap(),
            StartOutcome::Busy {
                active_chain_id: "a".into()
            }
        );
    }

    #[tokio::test]
    async fn transitions_without_session_are_inert() {
        let h = Harness::new(vec![unit("a")]);
        assert!(h.controller.complete_session().await.unwrap().is_none());
        assert!(h.controller.interrupt_session(None).await.unwrap().is_none());
        assert!(h.controller.pause_session().await.unwrap().is_none());
        assert!(!h.controller.add_exception("snack").await.unwrap());
        assert_eq!(
            h.controller.start_chain("missing").await.unwrap(),
            StartOutcome::NotFound
        );
        assert!(h.storage.get_completion_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume_move_forward_timer() {
        let mut a = unit("a");
        a.is_durationless = true;
        let h = Harness::new(vec![a]);
        started(h.controller.start_chain("a").await.unwrap());

        assert!(h.controller.pause_session().await.unwrap().is_some());
        assert!(h.controller.pause_session().await.unwrap().is_none());
        h.clock.advance(Duration::minutes(3));
        let resumed = h.controller.resume_session().await.unwrap().unwrap();
        assert_eq!(resumed.total_paused_time, 3 * 60_000);
        assert!(h.controller.resume_session().await.unwrap().is_none());
        assert_eq!(h.timer.calls(), vec!["start", "pause", "resume"]);
    }

    #[tokio::test]
    async fn sweep_completes_finished_countdown() {
        let mut a = unit("a");
        a.duration = 10;
        let h = Harness::new(vec![a]);
        started(h.controller.start_chain("a").await.unwrap());

        h.clock.advance(Duration::minutes(9));
        assert!(h.controller.sweep_sessions().await.unwrap().completed.is_none());

        h.clock.advance(Duration::minutes(1));
        let sweep = h.controller.sweep_sessions().await.unwrap();
        assert_eq!(sweep.completed.unwrap().history.actual_duration, 10);
        assert!(h.controller.sweep_sessions().await.unwrap().completed.is_none());
        assert_eq!(h.chain("a").await.current_streak, 1);
    }

    #[tokio::test]
    async fn time_limited_group_expires_on_entry_and_on_sweep() {
        let mut g = group("g");
        g.time_limit_hours = Some(1);
        let h = Harness::new(vec![g, child("a", "g", 0), child("b", "g", 1)]);

        started(h.controller.start_chain("g").await.unwrap());
        let clock_start = h.chain("g").await.group_started_at;
        assert_eq!(clock_start, Some(h.clock.now()));
        h.controller.complete_session().await.unwrap();
        assert_eq!(h.chain("a").await.current_streak, 1);

        h.clock.advance(Duration::hours(2));
        assert_eq!(
            h.controller.start_chain("g").await.unwrap(),
            StartOutcome::GroupExpired {
                group_id: "g".into()
            }
        );
        assert_eq!(h.chain("a").await.current_streak, 0);
        assert!(!h.chain("g").await.is_group_timer_running());
        assert_eq!(h.notifier.events().last().unwrap(), "failed:g:group time limit exceeded");

        // Entering again starts a fresh window.
        started(h.controller.start_chain("g").await.unwrap());
        h.controller.complete_session().await.unwrap();
        h.clock.advance(Duration::hours(1));
        assert_eq!(h.controller.sweep_groups().await.unwrap(), vec!["g".to_string()]);
        assert!(h.controller.sweep_groups().await.unwrap().is_empty());
        assert_eq!(h.chain("a").await.current_streak, 0);
    }

    #[tokio::test]
    async fn group_expiry_is_checked_before_unit_selection() {
        let mut g = group("g");
        g.time_limit_hours = Some(1);
        g.start_group_timer(Utc::now() - Duration::hours(3));
        let mut a = child("a", "g", 0);
        a.current_streak = 1;
        let h = Harness::new(vec![g, a]);

        assert_eq!(
            h.controller.start_chain("g").await.unwrap(),
            StartOutcome::GroupExpired {
                group_id: "g".into()
            }
        );
        assert_eq!(h.chain("a").await.current_streak, 0);
        assert!(!h.chain("g").await.is_group_timer_running());
    }

    #[tokio::test]
    async fn nested_time_limited_group_is_entered_on_group_start() {
        let mut inner = nested_child("inner", "outer", 0);
        inner.time_limit_hours = Some(2);
        let h = Harness::new(vec![group("outer"), inner, child("b", "inner", 0)]);

        let session = started(h.controller.start_chain("outer").await.unwrap());
        assert_eq!(session.chain_id, "b");
        assert_eq!(h.chain("inner").await.group_started_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn exceptions_attach_to_running_chain() {
        let h = Harness::new(vec![unit("a")]);
        started(h.controller.start_chain("a").await.unwrap());

        assert!(h.controller.add_exception("water").await.unwrap());
        assert!(!h.controller.add_exception("water").await.unwrap());
        assert!(h.controller.is_preapproved("a", "water", false).await.unwrap());
        assert!(!h.controller.is_preapproved("a", "Water", false).await.unwrap());
        assert_eq!(h.chain("a").await.current_streak, 0);
    }

    #[tokio::test]
    async fn partial_failure_is_reported_distinctly() {
        let h = Harness::new(vec![unit("a")]);
        h.storage.set_fail_scheduled_writes(true);
        match h.controller.schedule_chain("a").await {
            Err(EngineError::PartialWrite { failed }) => {
                assert_eq!(failed.len(), 1);
                assert!(failed[0].starts_with("save scheduled sessions"));
            }
            other => panic!("unexpected {other:?}"),
        }

        h.storage.set_fail_scheduled_writes(false);
        h.storage.set_fail_writes(true);
        let err = h.controller.start_chain("a").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Persistence {
                operation: "save active session",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn snapshot_reports_remaining_time() {
        let h = Harness::new(vec![unit("a")]);
        assert!(h.controller.snapshot().await.unwrap().is_none());

        started(h.controller.start_chain("a").await.unwrap());
        h.clock.advance(Duration::minutes(5));
        let snapshot = h.controller.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.chain_name, "A");
        assert_eq!(snapshot.remaining_ms, 20 * 60_000);

        let status = h.controller.group_status("a").await.unwrap().unwrap();
        assert_eq!(status.units, GroupProgress { completed: 0, total: 1 });
    }
}
