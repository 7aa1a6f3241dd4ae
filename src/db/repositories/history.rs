use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, to_u32, to_u64},
};
use crate::models::{CompletionHistory, TaskTimeStats};

fn row_to_history(row: &Row) -> Result<CompletionHistory> {
    let completed_at: String = row.get("completed_at")?;

    Ok(CompletionHistory {
        id: row.get("id")?,
        chain_id: row.get("chain_id")?,
        completed_at: parse_datetime(&completed_at, "completed_at")?,
        duration: to_u32(row.get("duration")?, "duration")?,
        actual_duration: to_u32(row.get("actual_duration")?, "actual_duration")?,
        was_successful: row.get("was_successful")?,
        reason_for_failure: row.get("reason_for_failure")?,
        is_forward_timed: row.get("is_forward_timed")?,
        description: row.get("description")?,
        notes: row.get("notes")?,
    })
}

fn row_to_stats(row: &Row) -> Result<TaskTimeStats> {
    let last_updated: String = row.get("last_updated")?;

    Ok(TaskTimeStats {
        chain_id: row.get("chain_id")?,
        total_minutes: to_u64(row.get("total_minutes")?, "total_minutes")?,
        session_count: to_u32(row.get("session_count")?, "session_count")?,
        last_updated: parse_datetime(&last_updated, "last_updated")?,
    })
}

impl Database {
    pub async fn list_completion_history(&self) -> Result<Vec<CompletionHistory>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chain_id, completed_at, duration, actual_duration, was_successful,
                        reason_for_failure, is_forward_timed, description, notes
                 FROM completion_history
                 ORDER BY rowid ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut history = Vec::new();
            while let Some(row) = rows.next()? {
                history.push(row_to_history(row)?);
            }
            Ok(history)
        })
        .await
    }

    /// Inserts entries not yet stored. Existing ids are never rewritten.
    pub async fn append_completion_history(&self, history: Vec<CompletionHistory>) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            for entry in &history {
                tx.execute(
                    "INSERT OR IGNORE INTO completion_history
                        (id, chain_id, completed_at, duration, actual_duration, was_successful,
                         reason_for_failure, is_forward_timed, description, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        entry.id,
                        entry.chain_id,
                        entry.completed_at.to_rfc3339(),
                        entry.duration,
                        entry.actual_duration,
                        entry.was_successful,
                        entry.reason_for_failure,
                        entry.is_forward_timed,
                        entry.description,
                        entry.notes,
                    ],
                )
                .with_context(|| format!("failed to append history entry {}", entry.id))?;
            }
            tx.commit().context("failed to commit completion history")?;
            Ok(())
        })
        .await
    }

    pub async fn add_task_time(&self, chain_id: String, minutes: u32) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO task_time_stats (chain_id, total_minutes, session_count, last_updated)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(chain_id) DO UPDATE SET
                     total_minutes = total_minutes + excluded.total_minutes,
                     session_count = session_count + 1,
                     last_updated = excluded.last_updated",
                params![chain_id, minutes, Utc::now().to_rfc3339()],
            )
            .context("failed to update task time stats")?;
            Ok(())
        })
        .await
    }

    pub async fn list_task_time_stats(&self) -> Result<Vec<TaskTimeStats>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chain_id, total_minutes, session_count, last_updated
                 FROM task_time_stats
                 ORDER BY chain_id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut stats = Vec::new();
            while let Some(row) = rows.next()? {
                stats.push(row_to_stats(row)?);
            }
            Ok(stats)
        })
        .await
    }
}
