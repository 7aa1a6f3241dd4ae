//! SQLite-backed `Storage`.
//!
//! All statements run on one worker thread (see `connection`). Multi-row
//! writes go through a transaction so each `Storage` call lands whole or
//! not at all.

mod connection;
mod helpers;
mod migrations;
mod repositories;

use anyhow::Result;

pub use connection::Database;

use crate::models::{ActiveSession, Chain, CompletionHistory, ScheduledSession, TaskTimeStats};
use crate::storage::Storage;

impl Storage for Database {
    async fn get_chains(&self) -> Result<Vec<Chain>> {
        self.list_chains().await
    }

    async fn get_active_chains(&self) -> Result<Vec<Chain>> {
        self.list_active_chains().await
    }

    async fn save_chains(&self, chains: Vec<Chain>) -> Result<()> {
        self.replace_chains(chains).await
    }

    async fn get_scheduled_sessions(&self) -> Result<Vec<ScheduledSession>> {
        self.list_scheduled_sessions().await
    }

    async fn save_scheduled_sessions(&self, sessions: Vec<ScheduledSession>) -> Result<()> {
        self.replace_scheduled_sessions(sessions).await
    }

    async fn get_active_session(&self) -> Result<Option<ActiveSession>> {
        self.load_active_session().await
    }

    async fn save_active_session(&self, session: Option<ActiveSession>) -> Result<()> {
        self.store_active_session(session).await
    }

    async fn get_completion_history(&self) -> Result<Vec<CompletionHistory>> {
        self.list_completion_history().await
    }

    async fn save_completion_history(&self, history: Vec<CompletionHistory>) -> Result<()> {
        self.append_completion_history(history).await
    }

    async fn update_task_time_stats(&self, chain_id: String, minutes: u32) -> Result<()> {
        self.add_task_time(chain_id, minutes).await
    }

    async fn get_task_time_stats(&self) -> Result<Vec<TaskTimeStats>> {
        self.list_task_time_stats().await
    }

    async fn cleanup_expired_deleted_chains(&self, days: u32) -> Result<Vec<String>> {
        self.purge_deleted_chains(days).await
    }

    async fn permanently_delete_chain(&self, id: String) -> Result<bool> {
        self.delete_chain_permanently(id).await
    }
}
