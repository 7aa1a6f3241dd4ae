//! The record-store contract the engine talks to.
//!
//! Every call is independently fallible. Implementations: `db::Database`
//! (SQLite), `MemoryStorage`, and the `CachedStorage` read-through wrapper.

mod cached;
mod memory;

use std::future::Future;

use anyhow::Result;

use crate::models::{ActiveSession, Chain, CompletionHistory, ScheduledSession, TaskTimeStats};

pub use cached::CachedStorage;
pub use memory::MemoryStorage;

pub trait Storage: Send + Sync + 'static {
    /// All chain records, soft-deleted ones included.
    fn get_chains(&self) -> impl Future<Output = Result<Vec<Chain>>> + Send;

    /// Chain records without a `deleted_at` marker.
    fn get_active_chains(&self) -> impl Future<Output = Result<Vec<Chain>>> + Send;

    /// Replaces the stored chain collection.
    fn save_chains(&self, chains: Vec<Chain>) -> impl Future<Output = Result<()>> + Send;

    fn get_scheduled_sessions(&self) -> impl Future<Output = Result<Vec<ScheduledSession>>> + Send;

    fn save_scheduled_sessions(
        &self,
        sessions: Vec<ScheduledSession>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_active_session(&self) -> impl Future<Output = Result<Option<ActiveSession>>> + Send;

    fn save_active_session(
        &self,
        session: Option<ActiveSession>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_completion_history(&self) -> impl Future<Output = Result<Vec<CompletionHistory>>> + Send;

    /// History is append-only: entries already stored (by id) are left untouched.
    fn save_completion_history(
        &self,
        history: Vec<CompletionHistory>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_task_time_stats(
        &self,
        chain_id: String,
        minutes: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_task_time_stats(&self) -> impl Future<Output = Result<Vec<TaskTimeStats>>> + Send;

    /// Permanently removes chains soft-deleted more than `days` ago. Returns the purged ids.
    fn cleanup_expired_deleted_chains(
        &self,
        days: u32,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Removes a chain, its descendants and their bookings, history and stats.
    fn permanently_delete_chain(&self, id: String) -> impl Future<Output = Result<bool>> + Send;
}
